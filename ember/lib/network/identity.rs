use std::{
    collections::BTreeSet,
    net::Ipv4Addr,
    ops::Deref,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};

use crate::{config::NetworkConfig, EmberError, EmberResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Everything a VM needs to be reachable, derived from a single host byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters, CopyGetters)]
pub struct NetworkIdentity {
    /// Fourth octet of the VM's address.
    #[getset(get_copy = "pub with_prefix")]
    host_byte: u8,

    /// The VM's address.
    #[getset(get_copy = "pub with_prefix")]
    ip: Ipv4Addr,

    /// The guest's default gateway.
    #[getset(get_copy = "pub with_prefix")]
    gateway: Ipv4Addr,

    /// The subnet mask.
    #[getset(get_copy = "pub with_prefix")]
    netmask: Ipv4Addr,

    /// The subnet prefix length.
    #[getset(get_copy = "pub with_prefix")]
    prefix: u8,

    /// The guest NIC's MAC address.
    #[getset(get = "pub with_prefix")]
    mac: String,

    /// The host tap device name.
    #[getset(get = "pub with_prefix")]
    tap_name: String,
}

/// Hands out host bytes from a bounded pool.
///
/// The set of used bytes lives behind a mutex so concurrent allocations never observe the same
/// free byte.
#[derive(Debug)]
pub struct IdentityAllocator {
    network: NetworkConfig,
    used: Mutex<BTreeSet<u8>>,
}

/// A host byte held by one VM. Returned to the pool when dropped.
#[derive(Debug)]
pub struct IdentityLease {
    identity: NetworkIdentity,
    allocator: Arc<IdentityAllocator>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl NetworkIdentity {
    /// Derives the identity for `host_byte` inside `network`.
    pub fn derive(network: &NetworkConfig, host_byte: u8) -> Self {
        Self {
            host_byte,
            ip: network.address_for(host_byte),
            gateway: network.gateway(),
            netmask: network.get_subnet().mask(),
            prefix: network.get_subnet().prefix(),
            mac: Self::mac_for(host_byte),
            tap_name: Self::tap_name_for(host_byte),
        }
    }

    /// `02:FC:00:00:00:<byte>`, locally administered and unicast.
    pub fn mac_for(host_byte: u8) -> String {
        format!("02:FC:00:00:00:{:02X}", host_byte)
    }

    /// `fc-tap-<byte>`.
    pub fn tap_name_for(host_byte: u8) -> String {
        format!("fc-tap-{}", host_byte)
    }

    /// Kernel `ip=` argument giving the guest a static address on `eth0`.
    pub fn kernel_ip_arg(&self) -> String {
        format!(
            "ip={}::{}:{}::eth0:off",
            self.ip, self.gateway, self.netmask
        )
    }
}

impl IdentityAllocator {
    /// Creates an allocator over the pool configured in `network`.
    pub fn new(network: NetworkConfig) -> Self {
        Self {
            network,
            used: Mutex::new(BTreeSet::new()),
        }
    }

    /// Leases the lowest free host byte.
    pub fn allocate(self: &Arc<Self>) -> EmberResult<IdentityLease> {
        let (start, end) = self.bounds();
        let byte = {
            let mut used = self.lock();
            let byte = (start..=end).find(|b| !used.contains(b)).ok_or_else(|| {
                EmberError::Allocation(format!(
                    "address pool {}..={} is exhausted",
                    start, end
                ))
            })?;
            used.insert(byte);
            byte
        };

        tracing::debug!(host_byte = byte, "allocated network identity");
        Ok(self.lease(byte))
    }

    /// Leases a specific host byte, as needed to restore a snapshot whose guest has its address
    /// baked in.
    pub fn claim(self: &Arc<Self>, host_byte: u8) -> EmberResult<IdentityLease> {
        let (start, end) = self.bounds();
        if !(start..=end).contains(&host_byte) {
            return Err(EmberError::Allocation(format!(
                "host byte {} is outside the pool {}..={}",
                host_byte, start, end
            )));
        }

        if !self.lock().insert(host_byte) {
            return Err(EmberError::Allocation(format!(
                "host byte {} is already in use",
                host_byte
            )));
        }

        tracing::debug!(host_byte, "claimed network identity");
        Ok(self.lease(host_byte))
    }

    /// Returns `host_byte` to the pool. Returns false if it was not allocated.
    pub fn release(&self, host_byte: u8) -> bool {
        let released = self.lock().remove(&host_byte);
        if released {
            tracing::debug!(host_byte, "released network identity");
        }
        released
    }

    /// Number of bytes currently leased.
    pub fn in_use(&self) -> usize {
        self.lock().len()
    }

    /// Total number of bytes in the pool.
    pub fn capacity(&self) -> usize {
        let (start, end) = self.bounds();
        (end - start) as usize + 1
    }

    /// The network the pool belongs to.
    pub fn network(&self) -> &NetworkConfig {
        &self.network
    }

    fn bounds(&self) -> (u8, u8) {
        (
            *self.network.get_pool_start(),
            *self.network.get_pool_end(),
        )
    }

    fn lease(self: &Arc<Self>, host_byte: u8) -> IdentityLease {
        IdentityLease {
            identity: NetworkIdentity::derive(&self.network, host_byte),
            allocator: Arc::clone(self),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<u8>> {
        self.used.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl IdentityLease {
    /// The leased identity.
    pub fn identity(&self) -> &NetworkIdentity {
        &self.identity
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Deref for IdentityLease {
    type Target = NetworkIdentity;

    fn deref(&self) -> &Self::Target {
        &self.identity
    }
}

impl Drop for IdentityLease {
    fn drop(&mut self) {
        self.allocator.release(self.identity.host_byte);
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
