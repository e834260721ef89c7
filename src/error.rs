//! Error taxonomy for `patchcom`.
//!
//! Every fallible operation in the crate returns [`Result`] with a variant
//! from the single [`Error`] enum. The variants split along how callers are
//! expected to react:
//!
//!  * [`Error::TransportUnavailable`]: the serial link itself is gone.
//!    Fatal for the session, never retried.
//!  * [`Error::ProtocolTimeout`]: an exchange produced no complete response
//!    in time, or the response failed the completeness check. Retried a
//!    bounded number of times with backoff; when retries are exhausted the
//!    last raw response is attached for diagnosis.
//!  * [`Error::IntegrityMismatch`]: a chunk or whole-file CRC/size check
//!    failed. Retried per chunk; at whole-file granularity it is surfaced
//!    as its own class so callers can warn instead of abort.
//!  * Compiler pipeline variants are never auto-retried; they carry the raw
//!    diagnostics of the external tool verbatim.
//!  * [`Error::ResourceExhausted`]: no free comparator slot or a device
//!    allocation failure. Reported, not retried.
//!  * [`Error::Cancelled`]: a first-class outcome for a cooperatively
//!    cancelled transfer, distinct from failure.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// All failure classes surfaced by the crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The serial link is unavailable or vanished mid-exchange.
    #[error("serial transport unavailable: {0}")]
    TransportUnavailable(String),

    /// A command exchange did not complete within its timeout, even after
    /// bounded retries. Carries the last raw response seen, which may be
    /// partial or interleaved with device log output.
    #[error("protocol exchange failed after {attempts} attempt(s); last response: {last_response:?}")]
    ProtocolTimeout {
        attempts: usize,
        last_response: String,
    },

    /// A CRC16 or size check failed for a chunk or a whole transfer.
    #[error("integrity mismatch ({context}): expected {expected:#06x}, got {actual:#06x}")]
    IntegrityMismatch {
        expected: u16,
        actual: u16,
        context: String,
    },

    /// The device reported a hard failure (`[ERR]` reply, remote filesystem
    /// error). Terminal for the operation, never retried.
    #[error("device error: {0}")]
    Device(String),

    /// No build-commands entry could be matched to the patch source.
    #[error("no build configuration found: {0}")]
    ConfigNotFound(String),

    /// The external compiler rejected the patch fragment.
    #[error("compile failed:\n{0}")]
    Compile(String),

    /// The external linker failed to place the patch.
    #[error("link failed:\n{0}")]
    Link(String),

    /// Extracting the flat binary or the symbol table failed.
    #[error("extraction failed:\n{0}")]
    Extract(String),

    /// A required symbol is absent from the firmware image or the
    /// compiled patch.
    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    /// No free comparator slot, or the device could not allocate memory.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The operation was cancelled cooperatively between chunks.
    #[error("cancelled")]
    Cancelled,

    /// A stage of an injection failed; wraps the underlying error with the
    /// stage that aborted the injection.
    #[error("injection stage `{stage}` failed: {source}")]
    Injection {
        stage: &'static str,
        #[source]
        source: Box<Error>,
    },

    /// Local filesystem or process I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The retryable-vs-terminal predicate used by the bounded retry loops
    /// in the protocol and transfer layers. Only timeouts/incomplete
    /// responses and per-chunk integrity failures are worth another
    /// attempt; everything else is terminal for the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ProtocolTimeout { .. } | Error::IntegrityMismatch { .. }
        )
    }

    /// Tag an error with the injection stage it aborted.
    pub(crate) fn at_stage(self, stage: &'static str) -> Error {
        Error::Injection {
            stage,
            source: Box::new(self),
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
    fn timeout_is_retryable() {
        let err = Error::ProtocolTimeout {
            attempts: 3,
            last_response: "garbage".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn crc_mismatch_is_retryable() {
        let err = Error::IntegrityMismatch {
            expected: 0x29B1,
            actual: 0x0000,
            context: "chunk 4".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn device_and_compile_errors_are_terminal() {
        assert!(!Error::Device("no such file".into()).is_retryable());
        assert!(!Error::Compile("patch.c:1: error".into()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::ResourceExhausted("no available slots".into()).is_retryable());
    }

    #[test]
    fn stage_tag_keeps_source() {
        let err = Error::Compile("boom".into()).at_stage("compile pass 1");
        match err {
            Error::Injection { stage, source } => {
                assert_eq!(stage, "compile pass 1");
                assert!(matches!(*source, Error::Compile(_)));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
