use std::{
    fmt::{self, Display},
    sync::Arc,
};

use emberutils::{CommandRunner, EmberutilsError, HostCommand};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::{EmberError, EmberResult};

use super::NetworkIdentity;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A discrete step of wiring a VM's tap device into the host network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkStep {
    /// Delete a tap device left over from an earlier VM with the same byte.
    RemoveStaleTap,

    /// `ip tuntap add`.
    CreateTap,

    /// `ip addr add`.
    AssignAddress,

    /// `ip link set up`.
    LinkUp,

    /// `net.ipv4.conf.<tap>.proxy_arp=1`.
    ProxyArp,

    /// `net.ipv6.conf.<tap>.disable_ipv6=1`.
    DisableIpv6,

    /// `net.ipv4.ip_forward=1`, once per host.
    IpForward,

    /// `POSTROUTING -o <uplink> -j MASQUERADE`.
    NatMasquerade,

    /// `FORWARD --ctstate RELATED,ESTABLISHED -j ACCEPT`.
    ForwardEstablished,

    /// `FORWARD -i <tap> -o <uplink> -j ACCEPT`.
    ForwardOutbound,

    /// Removing rules and the tap device.
    Teardown,
}

/// Creates and removes the host side of a VM's network.
///
/// Every step is a privileged host command run through a [`CommandRunner`]. Provisioning aborts at
/// the first failing step and undoes what it already did.
pub struct NetworkProvisioner {
    runner: Arc<dyn CommandRunner>,
    uplink_interface: String,
    ip_forward: OnceCell<()>,
}

struct PlannedStep {
    step: NetworkStep,
    command: HostCommand,
    undo: Option<HostCommand>,
}

struct IptablesRule {
    step: NetworkStep,
    table: Option<&'static str>,
    chain: &'static str,
    spec: Vec<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NetworkProvisioner {
    /// Creates a provisioner routing VM traffic out of `uplink_interface`.
    pub fn new(runner: Arc<dyn CommandRunner>, uplink_interface: impl Into<String>) -> Self {
        Self {
            runner,
            uplink_interface: uplink_interface.into(),
            ip_forward: OnceCell::new(),
        }
    }

    /// Creates and wires the tap device for `identity`.
    ///
    /// On failure or cancellation every completed step is undone in reverse order before the
    /// error is returned.
    pub async fn provision(
        &self,
        identity: &NetworkIdentity,
        cancel: &CancellationToken,
    ) -> EmberResult<()> {
        let tap = identity.get_tap_name();

        if let Err(e) = self.remove_tap_if_present(tap).await {
            return Err(EmberError::provisioning(NetworkStep::RemoveStaleTap, e));
        }

        let mut undo_stack: Vec<HostCommand> = Vec::new();
        for planned in self.plan(identity) {
            if cancel.is_cancelled() {
                self.rollback(tap, undo_stack).await;
                return Err(EmberError::Cancelled(format!(
                    "network provisioning of {}",
                    tap
                )));
            }

            let result = if planned.step == NetworkStep::IpForward {
                self.ip_forward
                    .get_or_try_init(|| async {
                        self.runner.run(&planned.command).await.map(|_| ())
                    })
                    .await
                    .map(|_| ())
            } else {
                self.runner.run(&planned.command).await.map(|_| ())
            };

            match result {
                Ok(()) => {
                    tracing::debug!(tap = %tap, step = %planned.step, "network step completed");
                    if let Some(undo) = planned.undo {
                        undo_stack.push(undo);
                    }
                }
                Err(e) => {
                    tracing::error!(tap = %tap, step = %planned.step, error = %e, "network step failed");
                    self.rollback(tap, undo_stack).await;
                    return Err(EmberError::provisioning(planned.step, e));
                }
            }
        }

        tracing::info!(tap = %tap, ip = %identity.get_ip(), "provisioned vm network");
        Ok(())
    }

    /// Removes the forwarding rules and the tap device of `identity`.
    ///
    /// Rules and devices that are already gone are skipped. Every removal is attempted and the
    /// first failure is returned.
    pub async fn teardown(&self, identity: &NetworkIdentity) -> EmberResult<()> {
        let tap = identity.get_tap_name();
        let mut first_error: Option<EmberutilsError> = None;

        for rule in self.rules(tap).into_iter().rev() {
            match self.runner.output(&rule.command("-C")).await {
                Ok(check) if check.success() => {
                    if let Err(e) = self.runner.run(&rule.command("-D")).await {
                        tracing::warn!(tap = %tap, step = %rule.step, error = %e, "failed to delete rule");
                        first_error.get_or_insert(e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Err(e) = self.remove_tap_if_present(tap).await {
            tracing::warn!(tap = %tap, error = %e, "failed to delete tap device");
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(EmberError::provisioning(NetworkStep::Teardown, e)),
            None => {
                tracing::info!(tap = %tap, "tore down vm network");
                Ok(())
            }
        }
    }

    async fn remove_tap_if_present(&self, tap: &str) -> Result<(), EmberutilsError> {
        let show = self
            .runner
            .output(&HostCommand::new("ip").args(["link", "show", "dev", tap]))
            .await?;

        if show.success() {
            self.runner.run(&ip(["link", "del", tap])).await?;
            tracing::debug!(tap = %tap, "deleted tap device");
        }

        Ok(())
    }

    async fn rollback(&self, tap: &str, undo_stack: Vec<HostCommand>) {
        for undo in undo_stack.into_iter().rev() {
            if let Err(e) = self.runner.run(&undo).await {
                tracing::warn!(tap = %tap, command = %undo, error = %e, "rollback step failed");
            }
        }
    }

    fn plan(&self, identity: &NetworkIdentity) -> Vec<PlannedStep> {
        let tap = identity.get_tap_name().as_str();
        let address = format!("{}/{}", identity.get_ip(), identity.get_prefix());

        let mut steps = vec![
            PlannedStep {
                step: NetworkStep::CreateTap,
                command: ip(["tuntap", "add", "dev", tap, "mode", "tap"]),
                undo: Some(ip(["link", "del", tap])),
            },
            PlannedStep {
                step: NetworkStep::AssignAddress,
                command: ip(["addr", "add", address.as_str(), "dev", tap]),
                undo: Some(ip(["addr", "del", address.as_str(), "dev", tap])),
            },
            PlannedStep {
                step: NetworkStep::LinkUp,
                command: ip(["link", "set", tap, "up"]),
                undo: None,
            },
            PlannedStep {
                step: NetworkStep::ProxyArp,
                command: sysctl(format!("net.ipv4.conf.{}.proxy_arp=1", tap)),
                undo: None,
            },
            PlannedStep {
                step: NetworkStep::DisableIpv6,
                command: sysctl(format!("net.ipv6.conf.{}.disable_ipv6=1", tap)),
                undo: None,
            },
            PlannedStep {
                step: NetworkStep::IpForward,
                command: sysctl("net.ipv4.ip_forward=1"),
                undo: None,
            },
        ];

        steps.extend(self.rules(tap).into_iter().map(|rule| PlannedStep {
            step: rule.step,
            command: rule.command("-A"),
            undo: Some(rule.command("-D")),
        }));

        steps
    }

    fn rules(&self, tap: &str) -> Vec<IptablesRule> {
        let uplink = self.uplink_interface.as_str();
        vec![
            IptablesRule {
                step: NetworkStep::NatMasquerade,
                table: Some("nat"),
                chain: "POSTROUTING",
                spec: strings(["-o", uplink, "-j", "MASQUERADE"]),
            },
            IptablesRule {
                step: NetworkStep::ForwardEstablished,
                table: None,
                chain: "FORWARD",
                spec: strings([
                    "-m",
                    "conntrack",
                    "--ctstate",
                    "RELATED,ESTABLISHED",
                    "-j",
                    "ACCEPT",
                ]),
            },
            IptablesRule {
                step: NetworkStep::ForwardOutbound,
                table: None,
                chain: "FORWARD",
                spec: strings(["-i", tap, "-o", uplink, "-j", "ACCEPT"]),
            },
        ]
    }
}

impl IptablesRule {
    fn command(&self, action: &str) -> HostCommand {
        let mut command = HostCommand::privileged("iptables");
        if let Some(table) = self.table {
            command = command.args(["-t", table]);
        }

        command.args([action, self.chain]).args(self.spec.iter().cloned())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn ip<'a>(args: impl IntoIterator<Item = &'a str>) -> HostCommand {
    HostCommand::privileged("ip").args(args)
}

fn sysctl(setting: impl Into<String>) -> HostCommand {
    HostCommand::privileged("sysctl").arg("-w").arg(setting)
}

fn strings<'a>(items: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    items.into_iter().map(str::to_string).collect()
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for NetworkStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkStep::RemoveStaleTap => "remove stale tap",
            NetworkStep::CreateTap => "create tap",
            NetworkStep::AssignAddress => "assign address",
            NetworkStep::LinkUp => "link up",
            NetworkStep::ProxyArp => "enable proxy_arp",
            NetworkStep::DisableIpv6 => "disable ipv6",
            NetworkStep::IpForward => "enable ip_forward",
            NetworkStep::NatMasquerade => "nat masquerade rule",
            NetworkStep::ForwardEstablished => "forward established rule",
            NetworkStep::ForwardOutbound => "forward outbound rule",
            NetworkStep::Teardown => "teardown",
        };

        write!(f, "{}", name)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
