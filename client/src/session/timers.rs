use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::SessionEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    IceChecking,
    FailureRetry,
    Reannounce,
}

/// Delivers one `TimerFired` into the session mailbox unless cancelled
/// or dropped first.
#[derive(Debug)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    pub fn start(
        kind: TimerKind,
        epoch: u64,
        delay: Duration,
        mailbox: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let token = CancellationToken::new();
        let ctx = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let _ = mailbox.send(SessionEvent::TimerFired { epoch, kind });
                }
                _ = ctx.cancelled() => {
                    tracing::trace!("Timer {kind:?} for pairing #{epoch} cancelled");
                }
            }
        });
        Self { token }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
