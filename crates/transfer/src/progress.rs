use crate::error::{ErrorKind, Result};
use tokio::sync::watch;

/// Snapshot of a transfer's progress, published through a `watch` channel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub transferred: u64,
    /// `None` until an upload's local file has been inspected.
    pub total: Option<u64>,
    /// Increases on every change, for cheap change detection.
    pub seq: u64,
}
impl Progress {
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(0) | None => None,
            Some(total) => Some(self.transferred as f64 / total as f64),
        }
    }
}

/// Write side of a transfer's progress.
///
/// `transferred` only ever grows and never passes `total`; bytes beyond the
/// total are refused with [`Oversized`](ErrorKind::Oversized).
#[derive(Clone)]
pub(crate) struct ProgressTracker {
    tx: watch::Sender<Progress>,
}

impl ProgressTracker {
    pub fn new(total: Option<u64>) -> (Self, watch::Receiver<Progress>) {
        let (tx, rx) = watch::channel(Progress { total, ..Default::default() });
        (Self { tx }, rx)
    }

    pub fn current(&self) -> Progress {
        *self.tx.borrow()
    }

    pub fn set_total(&self, total: u64) {
        self.tx.send_if_modified(|progress| {
            if progress.total == Some(total) {
                return false;
            }
            progress.total = Some(total);
            progress.seq += 1;
            true
        });
    }

    pub fn advance(&self, bytes: u64) -> Result<()> {
        let mut oversized = None;
        self.tx.send_if_modified(|progress| {
            let transferred = progress.transferred.saturating_add(bytes);
            if let Some(total) = progress.total
                && transferred > total
            {
                oversized = Some(total);
                return false;
            }
            if bytes == 0 {
                return false;
            }
            progress.transferred = transferred;
            progress.seq += 1;
            true
        });
        match oversized {
            Some(advertised) => exn::bail!(ErrorKind::Oversized { advertised }),
            None => Ok(()),
        }
    }

    /// Mark everything as transferred, e.g. when the file was already cached.
    pub fn complete(&self) {
        self.tx.send_if_modified(|progress| match progress.total {
            Some(total) if progress.transferred < total => {
                progress.transferred = total;
                progress.seq += 1;
                true
            },
            _ => false,
        });
    }
}
