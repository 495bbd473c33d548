//! Cooperative stop signalling for in-flight transfers.
//!
//! A transfer checks its [`StopToken`] between chunks and at every other
//! suspension point. Pause and cancel travel over the same channel because
//! they interrupt the transfer the same way; they differ only in what the
//! task does afterwards (persist a resume record vs. delete the part file).

use tokio::sync::watch;

/// Why a transfer is being asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    /// Stop and persist a resume record at the last acknowledged offset.
    Pause,
    /// Stop and delete the part file and resume record.
    Cancel,
}

/// Command side: held by the orchestrator for each active transfer.
#[derive(Debug)]
pub struct StopHandle {
    tx: watch::Sender<Option<StopKind>>,
}

impl StopHandle {
    /// Signals the transfer to stop. Later signals do not overwrite an
    /// earlier one; the first request wins.
    pub fn signal(&self, kind: StopKind) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(kind);
                true
            } else {
                false
            }
        });
    }
}

/// Transfer side: checked between chunks, awaited at suspension points.
#[derive(Debug, Clone)]
pub struct StopToken {
    rx: watch::Receiver<Option<StopKind>>,
}

impl StopToken {
    /// Non-blocking check, used between chunk writes.
    #[must_use]
    pub fn check(&self) -> Option<StopKind> {
        *self.rx.borrow()
    }

    /// Resolves when a stop is signalled. Used in `select!` races against
    /// rate-limit acquisition and backoff sleeps.
    pub async fn stopped(&mut self) -> StopKind {
        loop {
            if let Some(kind) = *self.rx.borrow_and_update() {
                return kind;
            }
            // The sender lives as long as the orchestrator entry; if it is
            // dropped the transfer is being torn down, which we report as
            // a cancel.
            if self.rx.changed().await.is_err() {
                return StopKind::Cancel;
            }
        }
    }
}

/// Creates a connected stop handle/token pair for one transfer.
#[must_use]
pub fn stop_channel() -> (StopHandle, StopToken) {
    let (tx, rx) = watch::channel(None);
    (StopHandle { tx }, StopToken { rx })
}
