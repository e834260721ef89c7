//! Interactive-mode detection state machine.
//!
//! Before the first command, the engine does not know whether the device
//! runs the interactive monitor (commands typed at a prompt) or the
//! bare-metal responder (commands issued standalone). The probe writes the
//! attach trigger once and observes the link:
//!
//! ```text
//!            START
//!              |
//!              v
//!         .---------.   trigger    .---------.
//!         | Unknown |------------->| Probing |
//!         '---------'   written    '---------'
//!              |                    |   |   |
//!         link |          prompt or |   |   | window elapsed
//!         gone |          tag seen  |   |   | quietly
//!              |                    v   v   v
//!              |              ******************
//!              '------------->*    Resolved    *
//!                             ******************
//!                      Interactive | BareMetal | link error
//! ```
//!
//! State transitions from events are implemented using the rust
//! `From`/`Into` pattern: only transitions for which a `From` impl exists
//! are authorized, and any other transition is a compile-time error.

use super::events::*;
use super::states::*;
use crate::error::Result;
use crate::session::DeviceMode;
use crate::transport::Transport;

// =============================================================================
// Crate-Public Interface
// =============================================================================

/// The mode detection state machine. Use the `factory()` function to get an
/// instance, then run it to completion with `run()`.
pub(crate) struct ModeProbe {
    sm: ProbeStates,
}
impl ModeProbe {
    /// Run the probe to completion and return the detected mode, or the
    /// link error that killed the probe.
    pub(crate) fn run(&mut self, link: &mut dyn Transport) -> Result<DeviceMode> {
        loop {
            self.sm = self.sm.step(link);
            if let ProbeStates::Resolved(sm) = &mut self.sm {
                if let Some(error) = sm.state.error.take() {
                    return Err(error);
                }
                if let Some(mode) = sm.state.mode.take() {
                    return Ok(mode);
                }
                unreachable!("resolved state without an outcome");
            }
        }
    }
}

/// Factory function for the mode detection state machine.
pub(crate) fn factory() -> ModeProbe {
    ModeProbe {
        // The machine naturally starts with the mode unknown.
        sm: ProbeStates::Unknown(ProbeSM::new()),
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// The raw state machine implementing mode detection.
///
/// Note that using a generic type that holds the current state makes it
/// nicer when debugging to see the state machine and the current state it
/// is holding at any time.
#[derive(Debug)]
struct ProbeSM<S> {
    state: S,
}
impl<S: Runnable> ProbeSM<S> {
    fn run(&mut self, link: &mut dyn Transport) -> Event {
        self.state.run(link)
    }
}

/// The state machine starts in the `UnknownState`.
impl ProbeSM<UnknownState> {
    fn new() -> Self {
        ProbeSM {
            state: UnknownState {},
        }
    }
}

/// An enum wrapper around the states of the mode detection state machine.
enum ProbeStates {
    Unknown(ProbeSM<UnknownState>),
    Probing(ProbeSM<ProbingState>),
    Resolved(ProbeSM<ResolvedState>),
}
impl ProbeStates {
    /// The unit of work in the state machine event loop: run the current
    /// state and convert the returned event into the next state. Illegal
    /// event/state combinations are unrepresentable or caught here.
    fn step(&mut self, link: &mut dyn Transport) -> Self {
        match self {
            ProbeStates::Unknown(sm) => {
                let event = sm.run(link);
                match event {
                    Event::TriggerSent(ev) => ProbeStates::Probing(ev.into()),
                    Event::ProbeFailed(ev) => ProbeStates::Resolved(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            ProbeStates::Probing(sm) => {
                let event = sm.run(link);
                match event {
                    Event::PromptSeen(ev) => ProbeStates::Resolved(ev.into()),
                    Event::MarkerSeen(ev) => ProbeStates::Resolved(ev.into()),
                    Event::ProbeTimedOut(ev) => ProbeStates::Resolved(ev.into()),
                    Event::ProbeFailed(ev) => ProbeStates::Resolved(ev.into()),
                    _ => unreachable!("illegal event {:#?} at current state {:#?}", event, sm),
                }
            }
            ProbeStates::Resolved(_) => {
                unreachable!("the resolved state is terminal and never steps")
            }
        }
    }
}

// -----------------------------------------------------------------------------
// State from Event transitions
// -----------------------------------------------------------------------------

impl From<TriggerSentEvent> for ProbeSM<ProbingState> {
    fn from(event: TriggerSentEvent) -> ProbeSM<ProbingState> {
        ProbeSM {
            state: ProbingState {
                deadline: event.deadline,
                collected: Vec::new(),
            },
        }
    }
}

impl From<PromptSeenEvent> for ProbeSM<ResolvedState> {
    fn from(event: PromptSeenEvent) -> ProbeSM<ResolvedState> {
        ProbeSM {
            state: ResolvedState {
                mode: Some(DeviceMode::Interactive {
                    platform: event.platform,
                }),
                error: None,
            },
        }
    }
}

impl From<MarkerSeenEvent> for ProbeSM<ResolvedState> {
    fn from(_event: MarkerSeenEvent) -> ProbeSM<ResolvedState> {
        ProbeSM {
            state: ResolvedState {
                mode: Some(DeviceMode::Interactive { platform: None }),
                error: None,
            },
        }
    }
}

impl From<ProbeTimedOutEvent> for ProbeSM<ResolvedState> {
    fn from(_event: ProbeTimedOutEvent) -> ProbeSM<ResolvedState> {
        ProbeSM {
            state: ResolvedState {
                mode: Some(DeviceMode::BareMetal),
                error: None,
            },
        }
    }
}

impl From<ProbeFailedEvent> for ProbeSM<ResolvedState> {
    fn from(event: ProbeFailedEvent) -> ProbeSM<ResolvedState> {
        ProbeSM {
            state: ResolvedState {
                mode: None,
                error: Some(event.error),
            },
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::MockTransport;

    #[test]
    fn prompt_resolves_interactive_with_platform() {
        let mut link = MockTransport::new().reply("stm32patch> ");
        let mode = factory().run(&mut link).unwrap();
        assert_eq!(
            mode,
            DeviceMode::Interactive {
                platform: Some("stm32".into())
            }
        );
        assert!(link.command_stream().starts_with("fpatch --cmd attach"));
    }

    #[test]
    fn status_tag_resolves_interactive_without_platform() {
        let mut link = MockTransport::new().reply("[OK]\n[END]\n");
        let mode = factory().run(&mut link).unwrap();
        assert_eq!(mode, DeviceMode::Interactive { platform: None });
    }

    #[test]
    fn silence_resolves_bare_metal() {
        let mut link = MockTransport::new().silence();
        let mode = factory().run(&mut link).unwrap();
        assert_eq!(mode, DeviceMode::BareMetal);
    }
}
