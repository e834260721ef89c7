//! Injection workflow and comparator slot management.
//!
//! This module orchestrates the other three engines: it resolves the
//! target address out of the firmware symbol table, picks one of the
//! device's comparator slots, drives the two-pass compile, uploads the
//! code through the file transfer layer and installs the redirect.
//!
//! **Example** - injecting a replacement for one firmware function:
//! ```ignore
//! let request = InjectionRequest::new("uart_poll", source_text)
//!     .mode(PatchMode::Direct);
//! let outcome = inject::inject_one(&mut engine, &mut session, &ctx, &request)?;
//! ```

mod slots;
mod workflow;

pub use slots::{Slot, SlotPlan};
pub use workflow::{
    inject_many, inject_one, unpatch, BatchOutcome, CompilerContext, InjectionOutcome,
    InjectionRequest,
};
