//! States for the interactive-mode detection state machine.
//!
//! This module is private and restricted to the
//! [`protocol`](crate::protocol) scope. The public interface of the state
//! machine is provided by [`state_machine`](super::state_machine).
//!
//! Refer to the [`state_machine`](super::state_machine) module for an
//! overview of states, events and transitions.

use std::time::{Duration, Instant};

use log::{info, trace};

use super::events::*;
use super::wire;
use crate::error::Error;
use crate::session::DeviceMode;
use crate::transport::Transport;

/// How long the probe observes the link for a prompt or a status tag
/// before declaring bare-metal mode.
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Pause between polls of the input buffer during the observation window.
const PROBE_POLL_INTERVAL: Duration = Duration::from_millis(20);

// =============================================================================
// Crate-Public Interface
// =============================================================================

/// Trait adding the ability for a state to be `run` after a transition into
/// it.
///
/// During this call, the state can do any work that needs to be done and
/// when finished, requests a transition to a new state by returning the
/// appropriate `event`. The `event` is then consumed to create the new
/// `state` using the corresponding `From` trait implementation.
pub(crate) trait Runnable {
    fn run(&mut self, link: &mut dyn Transport) -> Event;
}

// Unknown State ===============================================================

/// The initial state: the link mode has not been observed yet.
///
/// From the `UnknownState`, the state machine can evolve via the following
/// transitions:
///
///  * **[`TriggerSentEvent`] => [`ProbingState`]** after the attach trigger
///    was written to the link,
///  * **[`ProbeFailedEvent`] => [`ResolvedState`]** when the link is gone.
#[derive(Debug)]
pub(crate) struct UnknownState {}
impl Runnable for UnknownState {
    fn run(&mut self, link: &mut dyn Transport) -> Event {
        info!("=> Unknown");

        let trigger = format!("{} {}\n", wire::NAMESPACE, wire::ATTACH_CMD);
        let result = link
            .clear_input()
            .and_then(|_| link.write_all(trigger.as_bytes()));

        match result {
            Ok(()) => Event::TriggerSent(TriggerSentEvent {
                deadline: Instant::now() + PROBE_TIMEOUT,
            }),
            Err(error) => Event::ProbeFailed(ProbeFailedEvent { error }),
        }
    }
}

// Probing State ===============================================================

/// The observation window: collect whatever the device says in response to
/// the attach trigger and classify it.
///
///  * **[`PromptSeenEvent`] => [`ResolvedState`]** on an interactive prompt
///    (platform variant extracted from the prompt text),
///  * **[`MarkerSeenEvent`] => [`ResolvedState`]** on an explicit status
///    tag without a prompt,
///  * **[`ProbeTimedOutEvent`] => [`ResolvedState`]** when the window
///    elapses quietly (bare-metal),
///  * **[`ProbeFailedEvent`] => [`ResolvedState`]** when the link is gone.
#[derive(Debug)]
pub(crate) struct ProbingState {
    pub deadline: Instant,
    pub collected: Vec<u8>,
}
impl Runnable for ProbingState {
    fn run(&mut self, link: &mut dyn Transport) -> Event {
        info!("=> Probing");

        loop {
            match link.bytes_to_read() {
                Ok(available) => {
                    trace!("Bytes available to read: {}", available);
                    if available > 0 {
                        let mut buf = vec![0_u8; available.min(4096)];
                        match link.read_available(&mut buf) {
                            Ok(n) => self.collected.extend_from_slice(&buf[..n]),
                            Err(error) => {
                                return Event::ProbeFailed(ProbeFailedEvent { error })
                            }
                        }

                        let text = String::from_utf8_lossy(&self.collected);
                        let cleaned = wire::strip_ansi(&text);
                        if cleaned.lines().any(wire::is_prompt_line) {
                            return Event::PromptSeen(PromptSeenEvent {
                                platform: wire::prompt_platform(&cleaned),
                            });
                        }
                        if wire::has_status_tag(&cleaned) {
                            return Event::MarkerSeen(MarkerSeenEvent {});
                        }
                    }
                }
                Err(error) => return Event::ProbeFailed(ProbeFailedEvent { error }),
            }

            if Instant::now() >= self.deadline {
                return Event::ProbeTimedOut(ProbeTimedOutEvent {});
            }
            std::thread::sleep(PROBE_POLL_INTERVAL);
        }
    }
}

// Resolved State ==============================================================

/// Terminal state: the probe has classified the link (or died trying). The
/// state machine event loop extracts the outcome from here and returns.
#[derive(Debug)]
pub(crate) struct ResolvedState {
    pub mode: Option<DeviceMode>,
    pub error: Option<Error>,
}
