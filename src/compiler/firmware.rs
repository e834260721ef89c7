//! The firmware image's symbol table.
//!
//! The linker resolves a patch fragment's references to the running
//! firmware by importing the firmware's own symbols as external read-only
//! definitions, so the table is also the authority for target-address
//! resolution and for classifying functions as Thumb. On ARM ELF images
//! the symbol dumper reports Thumb functions with bit 0 set in the value;
//! the table stores the even address and remembers the Thumb flag.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;

use log::info;

use super::toolchain::{run_tool, Toolchain};
use crate::error::{Error, Result};

// =============================================================================
// Public Interface
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Object,
    Other,
}

/// One defined symbol of the firmware image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareSymbol {
    pub name: String,
    /// Even address; the Thumb bit is tracked separately.
    pub address: u32,
    pub thumb: bool,
    pub kind: SymbolKind,
}

impl FirmwareSymbol {
    /// The value a branch target needs: the address with the Thumb bit
    /// OR-ed in for Thumb functions.
    pub fn call_address(&self) -> u32 {
        if self.thumb {
            self.address | 1
        } else {
            self.address
        }
    }
}

/// The firmware's defined symbols, indexed by name and by function
/// address.
#[derive(Debug, Default)]
pub struct SymbolTable {
    by_name: HashMap<String, FirmwareSymbol>,
    /// Function addresses (even) to Thumb flag, for the veneer fixup.
    fn_addresses: HashMap<u32, bool>,
}

impl SymbolTable {
    /// Dump and parse the symbol table of `elf` with the toolchain's
    /// symbol dumper.
    pub fn load(tools: &Toolchain, elf: &Path) -> Result<SymbolTable> {
        if !elf.is_file() {
            return Err(Error::Extract(format!(
                "firmware image {} does not exist",
                elf.display()
            )));
        }
        let out = run_tool(&tools.nm, &[elf.as_os_str()], Error::Extract)?;
        let table = Self::parse_nm(&out);
        info!(
            "loaded {} firmware symbols from {}",
            table.len(),
            elf.display()
        );
        Ok(table)
    }

    /// Parse `nm` output: `<hex value> <type> <name>` per line. Undefined
    /// symbols are skipped; text symbols with an odd value are Thumb.
    pub(crate) fn parse_nm(text: &str) -> SymbolTable {
        let mut table = SymbolTable::default();
        for line in text.lines() {
            let mut parts = line.split_whitespace();
            let (value, kind, name) = match (parts.next(), parts.next(), parts.next()) {
                (Some(v), Some(k), Some(n)) => (v, k, n),
                _ => continue,
            };
            let value = match u32::from_str_radix(value, 16) {
                Ok(v) => v,
                Err(_) => continue,
            };
            let kind = match kind {
                "T" | "t" | "W" | "w" => SymbolKind::Function,
                "D" | "d" | "B" | "b" | "R" | "r" => SymbolKind::Object,
                "A" | "V" | "v" => SymbolKind::Other,
                // U and friends: not defined here.
                _ => continue,
            };
            let thumb = kind == SymbolKind::Function && (value & 1) != 0;
            let address = if thumb { value & !1 } else { value };
            table.insert(FirmwareSymbol {
                name: name.to_owned(),
                address,
                thumb,
                kind,
            });
        }
        table
    }

    pub(crate) fn insert(&mut self, symbol: FirmwareSymbol) {
        if symbol.kind == SymbolKind::Function {
            self.fn_addresses.insert(symbol.address, symbol.thumb);
        }
        self.by_name.insert(symbol.name.clone(), symbol);
    }

    /// Exact lookup by name.
    pub fn lookup(&self, name: &str) -> Option<&FirmwareSymbol> {
        self.by_name.get(name)
    }

    /// Case-insensitive exact lookup, used by multi-function injection to
    /// pair compiled symbols with firmware functions.
    pub fn lookup_ci(&self, name: &str) -> Option<&FirmwareSymbol> {
        self.by_name.get(name).or_else(|| {
            self.by_name
                .values()
                .find(|s| s.name.eq_ignore_ascii_case(name))
        })
    }

    /// Is `address` (bit 0 clear) a known Thumb function entry?
    pub fn is_thumb_function_at(&self, address: u32) -> bool {
        self.fn_addresses.get(&(address & !1)) == Some(&true)
    }

    /// Render every symbol as an absolute linker definition, importing the
    /// firmware's addresses without linking its code. Thumb functions keep
    /// their call bit so direct branches resolve correctly.
    pub fn linker_defs(&self) -> String {
        let mut names: Vec<&String> = self.by_name.keys().collect();
        names.sort();
        let mut out = String::new();
        for name in names {
            let sym = &self.by_name[name];
            let _ = writeln!(out, "PROVIDE({} = 0x{:08X});", sym.name, sym.call_address());
        }
        out
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const NM_OUT: &str = "\
08000400 T main
08000501 T uart_poll
08000600 t idle_task
20000010 D g_ticks
20000020 B g_buffer
         U memcpy
08000700 A __stack_top
";

    #[test]
    fn parse_nm_classifies_and_strips_thumb_bit() {
        let table = SymbolTable::parse_nm(NM_OUT);
        assert_eq!(table.len(), 6);

        let main = table.lookup("main").unwrap();
        assert_eq!(main.address, 0x0800_0400);
        assert!(!main.thumb);

        let uart = table.lookup("uart_poll").unwrap();
        assert_eq!(uart.address, 0x0800_0500);
        assert!(uart.thumb);
        assert_eq!(uart.call_address(), 0x0800_0501);

        assert_eq!(table.lookup("g_ticks").unwrap().kind, SymbolKind::Object);
        assert!(table.lookup("memcpy").is_none());
    }

    #[test]
    fn thumb_function_address_index() {
        let table = SymbolTable::parse_nm(NM_OUT);
        assert!(table.is_thumb_function_at(0x0800_0500));
        assert!(table.is_thumb_function_at(0x0800_0501));
        assert!(!table.is_thumb_function_at(0x0800_0400));
        assert!(!table.is_thumb_function_at(0x2000_0010));
    }

    #[test]
    fn case_insensitive_lookup() {
        let table = SymbolTable::parse_nm(NM_OUT);
        assert!(table.lookup_ci("UART_Poll").is_some());
        assert!(table.lookup_ci("Uart_poll").is_some());
        assert!(table.lookup_ci("nonexistent").is_none());
    }

    #[test]
    fn linker_defs_carry_call_addresses() {
        let table = SymbolTable::parse_nm(NM_OUT);
        let defs = table.linker_defs();
        assert!(defs.contains("PROVIDE(main = 0x08000400);"));
        // Thumb function keeps its call bit.
        assert!(defs.contains("PROVIDE(uart_poll = 0x08000501);"));
        assert!(defs.contains("PROVIDE(g_ticks = 0x20000010);"));
    }
}
