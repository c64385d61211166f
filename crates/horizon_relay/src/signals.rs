//! Process shutdown for the relay: which signal arrived and draining the
//! running server once it does.

use std::fmt;
use std::future::Future;
use tracing::info;

use crate::hub::HubStats;
use crate::server::RelayHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Interrupt => f.write_str("SIGINT"),
            ShutdownSignal::Terminate => f.write_str("SIGTERM"),
        }
    }
}

/// Waits for SIGINT or SIGTERM. Ctrl+C counts as an interrupt everywhere.
pub async fn shutdown_signal() -> anyhow::Result<ShutdownSignal> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            interrupted = tokio::signal::ctrl_c() => {
                interrupted?;
                Ok(ShutdownSignal::Interrupt)
            }
            _ = sigterm.recv() => Ok(ShutdownSignal::Terminate),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(ShutdownSignal::Interrupt)
    }
}

/// Keeps `relay` serving until `trigger` resolves, then shuts it down.
///
/// Returns the hub totals as they stood when the trigger fired.
pub async fn drain_on<F>(relay: RelayHandle, trigger: F) -> anyhow::Result<HubStats>
where
    F: Future<Output = anyhow::Result<ShutdownSignal>>,
{
    let signal = trigger.await?;
    info!("📡 Received {}, closing relay connections...", signal);

    let stats = relay.hub().stats();
    relay.shutdown().await;
    Ok(stats)
}
