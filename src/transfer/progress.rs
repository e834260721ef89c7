//! Transfer accounting, progress events and cooperative cancellation.
//!
//! Long transfers run synchronously end-to-end on the device worker; a
//! producer/consumer channel carries progress events to observers outside
//! the worker. Sending never blocks the worker; a vanished observer just
//! stops receiving.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Public Interface
// =============================================================================

/// A snapshot pushed to observers after every completed chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub retries: usize,
    pub crc_failures: usize,
}

/// Accumulated accounting for one whole transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub bytes_moved: u64,
    pub elapsed: Duration,
    pub retries: usize,
    pub crc_failures: usize,
}

impl TransferStats {
    /// Effective throughput in bytes per second.
    pub fn throughput_bps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_moved as f64 / secs
        } else {
            0.0
        }
    }

    /// One-line loss/throughput report for the logs.
    pub fn report(&self) -> String {
        format!(
            "{} bytes in {:.2?} ({:.0} B/s), {} retr{}, {} CRC failure{}",
            self.bytes_moved,
            self.elapsed,
            self.throughput_bps(),
            self.retries,
            if self.retries == 1 { "y" } else { "ies" },
            self.crc_failures,
            if self.crc_failures == 1 { "" } else { "s" },
        )
    }
}

/// Shared cancellation flag, checked between chunks. Once observed, the
/// transfer loop closes the remote handle and reports the distinct
/// `Cancelled` outcome.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Per-transfer knobs: whole-file verification, a progress sink, and a
/// cancellation token.
#[derive(Default)]
pub struct TransferOptions {
    /// Verify the whole transfer against the device-reported CRC16+size
    /// afterwards (non-empty files only).
    pub verify: bool,
    /// Progress sink; events are pushed after every completed chunk.
    pub progress: Option<Sender<ProgressEvent>>,
    /// Cooperative cancellation flag.
    pub cancel: Option<CancelToken>,
}

impl TransferOptions {
    pub(crate) fn cancelled(&self) -> bool {
        self.cancel.as_ref().map_or(false, CancelToken::is_cancelled)
    }

    pub(crate) fn notify(&self, event: ProgressEvent) {
        if let Some(tx) = &self.progress {
            // The worker never blocks on an observer; a closed receiver is
            // the observer's loss.
            let _ = tx.send(event);
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throughput_and_report() {
        let stats = TransferStats {
            bytes_moved: 1000,
            elapsed: Duration::from_secs(2),
            retries: 1,
            crc_failures: 0,
        };
        assert!((stats.throughput_bps() - 500.0).abs() < f64::EPSILON);
        let report = stats.report();
        assert!(report.contains("1000 bytes"));
        assert!(report.contains("1 retry"));
        assert!(report.contains("0 CRC failures"));
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn options_notify_ignores_gone_observer() {
        let (tx, rx) = std::sync::mpsc::channel();
        let opts = TransferOptions {
            progress: Some(tx),
            ..Default::default()
        };
        drop(rx);
        // Must not panic or block.
        opts.notify(ProgressEvent {
            bytes_done: 1,
            bytes_total: 2,
            retries: 0,
            crc_failures: 0,
        });
    }
}
