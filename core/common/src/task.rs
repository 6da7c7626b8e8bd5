//! Cooperative cancellation and progress reporting for long-running work.
//!
//! A [`TaskContext`] is handed explicitly to every operation that processes
//! data in chunks. The operation polls it once per chunk; cancellation is
//! advisory and never interrupts a chunk that is already in flight.

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Cancellation token plus an optional progress sink.
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    cancel: CancellationToken,
    progress: Option<UnboundedSender<u64>>,
}

impl TaskContext {
    /// A context that is never cancelled and reports nowhere.
    pub fn detached() -> Self {
        Self::default()
    }

    /// Create a context observing the given token.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            progress: None,
        }
    }

    /// Attach a progress channel. Each report carries a byte count.
    pub fn with_progress(mut self, sender: UnboundedSender<u64>) -> Self {
        self.progress = Some(sender);
        self
    }

    /// The token backing this context.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Return `Err(Error::Cancelled)` if cancellation was requested.
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Emit a progress increment. A closed receiver is ignored.
    pub fn report(&self, amount: u64) {
        if let Some(sender) = &self.progress {
            let _ = sender.send(amount);
        }
    }
}
