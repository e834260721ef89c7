//! Events for the interactive-mode detection state machine.
//!
//! This module is private and restricted to the
//! [`protocol`](crate::protocol) scope. Refer to the
//! [`state_machine`](super::state_machine) module for an overview of
//! states, events and transitions.

use std::time::Instant;

use crate::error::Error;

// =============================================================================
// Crate-Public Interface
// =============================================================================

// TriggerSentEvent ============================================================

/// Fired once the attach trigger has been written to the link, starting the
/// observation window. Triggers the transition to [`ProbingState`].
#[derive(Debug)]
pub(crate) struct TriggerSentEvent {
    /// The probe gives up and declares bare-metal mode past this point.
    pub deadline: Instant,
}

// PromptSeenEvent =============================================================

/// Fired when the observation window caught an interactive prompt. The
/// platform variant is the prompt text before the suffix, when present.
#[derive(Debug)]
pub(crate) struct PromptSeenEvent {
    pub platform: Option<String>,
}

// MarkerSeenEvent =============================================================

/// Fired when the observation window caught an explicit `[OK]`/`[ERR]` tag
/// without a prompt: the device is interactive but did not identify its
/// platform variant.
#[derive(Debug)]
pub(crate) struct MarkerSeenEvent {}

// ProbeTimedOutEvent ==========================================================

/// Fired when the observation window elapsed with neither a prompt nor a
/// status tag: the device speaks the bare-metal flavor of the protocol and
/// commands will be issued standalone.
#[derive(Debug)]
pub(crate) struct ProbeTimedOutEvent {}

// ProbeFailedEvent ============================================================

/// Fired when the link itself failed during the probe. This is fatal for
/// the session; the probe resolves with the carried error.
#[derive(Debug)]
pub(crate) struct ProbeFailedEvent {
    pub error: Error,
}

// Events enum =================================================================

/// Events that can be triggered within the mode detection state machine.
#[derive(Debug)]
pub(crate) enum Event {
    TriggerSent(TriggerSentEvent),
    PromptSeen(PromptSeenEvent),
    MarkerSeen(MarkerSeenEvent),
    ProbeTimedOut(ProbeTimedOutEvent),
    ProbeFailed(ProbeFailedEvent),
}
