//! Patchcom live-patches running ARM Cortex-M firmware without reflashing:
//! it compiles a small C fragment with the firmware's own cross toolchain,
//! loads the result into spare device RAM over the serial port, and
//! redirects execution to it through the CPU's Flash Patch and Breakpoint
//! (FPB) comparators. The point is fast iteration on running hardware
//! without a flash cycle.
//!
//! Four engines make up the crate, in dependency order:
//!
//! * [`protocol`]: the serial protocol engine: a mode-detection state
//!   machine, command exchanges with bounded retries, and the device
//!   operations (info, allocate, patch install, unpatch, echo probe).
//! * [`transfer`]: a chunked file transfer protocol on top, with CRC16
//!   integrity, per-chunk retries, progress events and cancellation.
//! * [`compiler`]: the transport-independent patch pipeline: build-config
//!   recovery, two-pass compile/link at a chosen address, binary and
//!   symbol extraction, and the Thumb-veneer fixup.
//! * [`inject`]: the workflow tying them together: slot selection,
//!   two-pass compilation, upload and redirect install.
//!
//! Every device is driven by one [`session::DeviceWorker`] thread that
//! owns the transport and drains a request queue strictly serially; the
//! serial medium is half-duplex and stateful, so interleaved commands
//! would corrupt response matching.
//!
//! The mode-detection logic is implemented as a state machine in terms of
//! **states** and typed **events**, with transitions expressed through the
//! `From`/`Into` pattern: a state's work produces an event, and only
//! events with a `From` implementation for the next state are legal, so
//! illegal transitions are compile-time errors. Transitioning consumes the
//! previous state; data moves between states by riding on the event.

pub mod compiler;
pub mod error;
pub mod inject;
pub mod protocol;
pub mod session;
pub mod settings;
pub mod transfer;
pub mod transport;
mod utils;

pub use error::{Error, Result};
pub use inject::{
    inject_many, inject_one, unpatch, BatchOutcome, CompilerContext, InjectionOutcome,
    InjectionRequest, Slot, SlotPlan,
};
pub use protocol::{DeviceInfo, PatchMode, ProtocolEngine, UnpatchScope};
pub use session::{DeviceMode, DeviceWorker, Session, TransferHandle};
pub use settings::{Settings, SettingsBuilder};
pub use transfer::{CancelToken, ProgressEvent, RemoteFs, TransferOptions, TransferStats};
pub use transport::{SerialTransport, Transport};
pub use utils::crc16_ccitt;
