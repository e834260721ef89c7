//! The serial protocol engine.
//!
//! **Example** - Importing the public interfaces through protocol:
//! ```ignore
//! use crate::{
//!     protocol::{PatchMode, ProtocolEngine},
//!     session::Session,
//! };
//! ```
//!
//! **Example** - Issuing a command against a session:
//! ```ignore
//! let mut engine = ProtocolEngine::new(transport, settings);
//! let mut session = Session::new(256, 256);
//! engine.ping(&mut session)?;
//! let info = engine.query_info(&mut session)?;
//! ```

mod engine;
mod events;
mod state_machine;
mod states;
pub(crate) mod wire;

pub use engine::{DeviceInfo, ProtocolEngine, UnpatchScope};
pub use wire::{PatchMode, Response};
