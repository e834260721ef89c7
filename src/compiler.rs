//! The patch compiler pipeline.
//!
//! Transport-independent: source text + load address + build configuration
//! in, relocatable flat binary + symbol table out, via the external cross
//! toolchain.
//!
//! **Example** - the two passes of one injection:
//! ```ignore
//! let compiler = PatchCompiler { tools: &tools, firmware: &symbols, config: &config };
//! let pass1 = compiler.compile(source, origin, PLACEHOLDER_BASE, Some("uart_poll"))?;
//! let address = engine.alloc(&mut session, pass1.size() as u32)?;
//! let pass2 = compiler.compile(source, origin, address, Some("uart_poll"))?;
//! ```

mod build_config;
mod firmware;
mod pipeline;
mod toolchain;

pub use build_config::{BuildConfig, BuildDatabase, BuildEntry};
pub use firmware::{FirmwareSymbol, SymbolKind, SymbolTable};
pub use pipeline::{
    fix_thumb_veneers, is_internal_symbol, CompiledPatch, PatchCompiler, PLACEHOLDER_BASE,
};
pub use toolchain::Toolchain;
