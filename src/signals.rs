use super::Result;

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancels `token` on the first SIGINT or SIGTERM delivered to the runner.
///
/// Supervised children live in their own process groups and never see the
/// terminal's Ctrl+C, so the supervisor tears them down when the token fires.
pub fn cancel_on_signal(token: CancellationToken) -> Result<JoinHandle<()>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        let name = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
            _ = token.cancelled() => return,
        };
        warn!("received {}, stopping in-flight scenario", name);
        token.cancel();
        info!("cancellation requested");
    }))
}
