use std::sync::Arc;

use async_trait::async_trait;
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::EmberResult;

use super::ShutdownMode;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Process signals that end the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// `SIGINT`
    Interrupt,

    /// `SIGTERM`
    Terminate,

    /// `SIGQUIT`
    Quit,
}

/// Something that can bring all of its VMs down.
#[async_trait]
pub trait ShutdownTarget: Send + Sync + 'static {
    /// Stops every VM. Must be safe to call again while a previous call is still running.
    async fn shutdown_all(&self, mode: ShutdownMode);
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Installs handlers for `SIGINT`, `SIGTERM` and `SIGQUIT` that bring `target` down.
///
/// `done` is cancelled once a sweep has completed and the process may exit.
pub fn install(
    target: Arc<dyn ShutdownTarget>,
    done: CancellationToken,
) -> EmberResult<JoinHandle<()>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                Some(()) = interrupt.recv() => ShutdownSignal::Interrupt,
                Some(()) = terminate.recv() => ShutdownSignal::Terminate,
                Some(()) = quit.recv() => ShutdownSignal::Quit,
                else => break,
            };

            if tx.send(received).await.is_err() {
                break;
            }
        }
    });

    Ok(tokio::spawn(handle_signals(rx, target, done)))
}

/// Turns a stream of signals into shutdown sweeps.
///
/// The first `SIGINT` or `SIGTERM` starts a graceful sweep in the background. Another one while
/// it runs escalates to a forced sweep. `SIGQUIT` always forces.
pub async fn handle_signals(
    mut signals: mpsc::Receiver<ShutdownSignal>,
    target: Arc<dyn ShutdownTarget>,
    done: CancellationToken,
) {
    let mut graceful: Option<JoinHandle<()>> = None;

    while let Some(received) = signals.recv().await {
        let sweeping = graceful.as_ref().is_some_and(|task| !task.is_finished());

        match received {
            ShutdownSignal::Interrupt | ShutdownSignal::Terminate if !sweeping => {
                tracing::info!(signal = ?received, "shutting down all vms gracefully");
                let target = Arc::clone(&target);
                let done = done.clone();
                graceful = Some(tokio::spawn(async move {
                    target.shutdown_all(ShutdownMode::Graceful).await;
                    done.cancel();
                }));
            }
            _ => {
                tracing::warn!(signal = ?received, "forcing shutdown of all vms");
                target.shutdown_all(ShutdownMode::Forced).await;
                done.cancel();
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
