//! Hex-table dumps of raw serial traffic for debugging.

use hexplay::HexViewBuilder;
use log::{log_enabled, Level::Debug};

/// Dump `bytes` as a hex table when `Debug` logging is enabled. Used by the
/// protocol engine to show raw exchanges without cluttering normal output.
pub(crate) fn debug_hexdump(bytes: &[u8]) {
    if log_enabled!(Debug) {
        let view = HexViewBuilder::new(bytes)
            .address_offset(0)
            .row_width(16)
            .finish();
        println!("{}", view);
    }
}
