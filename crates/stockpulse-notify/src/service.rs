use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::listener::{ListenOutcome, UpstreamListener};
use crate::reconnect::ReconnectPolicy;

/// Keeps an [`UpstreamListener`] listening for the life of the process,
/// reconnecting with backoff whenever the upstream connection is lost.
pub struct ListenerService;

impl ListenerService {
    /// Spawn the supervision loop. The listener should already have its
    /// handlers and channels registered.
    pub fn start(listener: Arc<UpstreamListener>, policy: ReconnectPolicy) -> ListenerHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(Arc::clone(&listener), policy, cancel.clone()));
        ListenerHandle {
            cancel,
            task,
            listener,
        }
    }
}

async fn supervise(listener: Arc<UpstreamListener>, policy: ReconnectPolicy, cancel: CancellationToken) {
    let mut failures: u32 = 0;

    loop {
        let delay = match listener.start_listening(&cancel).await {
            Ok(ListenOutcome::Cancelled) | Ok(ListenOutcome::Disconnected) => break,
            Ok(ListenOutcome::PeerClosed) => {
                failures = 0;
                let delay = policy.delay_for(0);
                warn!(delay_ms = delay.as_millis() as u64, "upstream connection lost, reconnecting");
                delay
            }
            Err(e) => {
                failures += 1;
                if !policy.allows(failures) {
                    error!(attempts = failures, error = %e, "giving up on upstream connection");
                    break;
                }
                let delay = policy.delay_for(failures - 1);
                warn!(
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "upstream connect failed, retrying"
                );
                delay
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    listener.disconnect().await;
    info!("listener service stopped");
}

/// Handle to a running [`ListenerService`].
pub struct ListenerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    listener: Arc<UpstreamListener>,
}

impl ListenerHandle {
    pub fn listener(&self) -> &Arc<UpstreamListener> {
        &self.listener
    }

    /// True once the supervision loop has exited, either stopped or out of
    /// reconnect attempts.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop listening and wait up to `timeout` for in-flight dispatch to
    /// drain. The upstream connection is released either way.
    pub async fn stop(mut self, timeout: Duration) {
        self.cancel.cancel();
        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "listener task failed"),
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "listener did not stop in time, aborting");
                self.task.abort();
            }
        }
        self.listener.disconnect().await;
    }
}
