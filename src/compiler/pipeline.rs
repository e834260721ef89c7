//! Compile, link and extract a patch fragment for a given load address.
//!
//! The pipeline is transport-independent: source text plus a load address
//! plus a build configuration go in; a relocatable flat binary plus its
//! symbol table come out. The external toolchain does the real work inside
//! a private scratch directory that is removed on every exit path.
//!
//! Addresses affect linker output, so a patch is compiled twice per
//! injection: once at a placeholder address to learn its size, then again
//! at the real address. Each pass produces a separate immutable
//! [`CompiledPatch`]; addresses from one pass are meaningless outside the
//! base it was built for.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::{debug, info};
use tempfile::TempDir;

use super::build_config::BuildConfig;
use super::firmware::SymbolTable;
use super::toolchain::{run_tool, Toolchain};
use crate::error::{Error, Result};

/// The placeholder base used by the size-discovery pass. Only the relative
/// layout and total size of that pass are ever consumed.
pub const PLACEHOLDER_BASE: u32 = 0x2000_0000;

/// `LDR.W PC, [PC, #0]`, the load-pc-relative-literal instruction a
/// linker-synthesized long-call veneer starts with. The 4-byte literal
/// follows immediately.
const VENEER_LDR_PC: [u8; 4] = [0x5F, 0xF8, 0x00, 0xF0];

// =============================================================================
// Public Interface
// =============================================================================

/// The immutable result of one compile invocation at one base address.
#[derive(Debug, Clone)]
pub struct CompiledPatch {
    /// The base address this patch was linked for.
    pub base: u32,
    /// Flat binary, ready to upload at `base`.
    pub binary: Vec<u8>,
    /// Defined symbols at or above `base`.
    pub symbols: BTreeMap<String, u32>,
    /// The entry symbol the link was anchored on; `None` for
    /// multi-function compiles where every global is a root.
    pub entry: Option<String>,
}

impl CompiledPatch {
    pub fn size(&self) -> usize {
        self.binary.len()
    }

    /// Symbols a user would call their own: veneers and internal symbols
    /// are excluded.
    pub fn user_symbols(&self) -> impl Iterator<Item = (&String, &u32)> {
        self.symbols
            .iter()
            .filter(|(name, _)| !is_internal_symbol(name))
    }
}

/// Veneers (`__foo_veneer`), mapping symbols (`$t`, `$d`) and other
/// compiler-internal names are never injection candidates or redirect
/// targets.
pub fn is_internal_symbol(name: &str) -> bool {
    name.starts_with("__") || name.starts_with('$')
}

/// The patch compiler: stateless aside from the per-invocation scratch
/// directory, so it can run concurrently with device operations.
pub struct PatchCompiler<'a> {
    pub tools: &'a Toolchain,
    pub firmware: &'a SymbolTable,
    pub config: &'a BuildConfig,
}

impl<'a> PatchCompiler<'a> {
    /// Compile `source` to a flat binary placed at `base`, optionally
    /// anchored on an `entry` symbol. `origin` is the fragment's original
    /// location, used for extra include paths; the fragment itself is
    /// compiled from a scratch copy.
    pub fn compile(
        &self,
        source: &str,
        origin: Option<&Path>,
        base: u32,
        entry: Option<&str>,
    ) -> Result<CompiledPatch> {
        let scratch = TempDir::new()?;
        let fragment = scratch.path().join("patch.c");
        let object = scratch.path().join("patch.o");
        let elf = scratch.path().join("patch.elf");
        let bin = scratch.path().join("patch.bin");
        fs::write(&fragment, source)?;

        self.run_compile(&fragment, &object, origin)?;
        let roots = self.object_globals(&object)?;
        self.run_link(scratch.path(), &object, &elf, base, entry, &roots)?;

        run_tool(
            &self.tools.objcopy,
            &[
                "-O".as_ref(),
                "binary".as_ref(),
                elf.as_os_str(),
                bin.as_os_str(),
            ],
            Error::Extract,
        )?;
        let mut binary = fs::read(&bin)?;
        let symbols = self.linked_symbols(&elf, base)?;

        let fixed = fix_thumb_veneers(&mut binary, self.firmware);
        if fixed > 0 {
            debug!("veneer fixup set the Thumb bit on {} literal(s)", fixed);
        }

        info!(
            "compiled patch at 0x{:08X}: {} bytes, {} symbols",
            base,
            binary.len(),
            symbols.len()
        );
        Ok(CompiledPatch {
            base,
            binary,
            symbols,
            entry: entry.map(str::to_owned),
        })
        // `scratch` drops here, removing the directory on every exit path.
    }

    // -------------------------------------------------------------------------
    // Private stuff
    // -------------------------------------------------------------------------

    /// Object-only compile with section splitting, warnings kept
    /// non-fatal. A literal invocation is passed through nearly verbatim;
    /// a reconstructed one carries the safe flag subset.
    fn run_compile(&self, fragment: &Path, object: &Path, origin: Option<&Path>) -> Result<()> {
        let mut config = self.config.clone();
        if let Some(origin_dir) = origin.and_then(Path::parent) {
            config.add_fragment_includes(origin_dir);
        }

        let mut args: Vec<String> = config.args;
        args.extend_from_slice(&[
            "-c".to_owned(),
            "-ffunction-sections".to_owned(),
            "-fdata-sections".to_owned(),
            "-Wno-error".to_owned(),
            fragment.display().to_string(),
            "-o".to_owned(),
            object.display().to_string(),
        ]);
        run_tool(&self.tools.compiler, &args, Error::Compile).map(|_| ())
    }

    /// Defined globals of the compiled object: the garbage-collection
    /// roots. Every symbol following the injected-function naming rules
    /// must survive the link even without internal callers.
    fn object_globals(&self, object: &Path) -> Result<Vec<String>> {
        let out = run_tool(&self.tools.nm, &[object.as_os_str()], Error::Compile)?;
        let mut roots = Vec::new();
        for line in out.lines() {
            let mut parts = line.split_whitespace();
            if let (Some(_), Some(kind), Some(name)) = (parts.next(), parts.next(), parts.next()) {
                // Uppercase = global definition.
                if matches!(kind, "T" | "D" | "B" | "R" | "W") {
                    roots.push(name.to_owned());
                }
            }
        }
        Ok(roots)
    }

    /// Link with a synthesized script placing the output exactly at
    /// `base`, force-keeping the entry and every global, garbage-collecting
    /// the rest, and importing the firmware's symbols as absolute
    /// definitions.
    fn run_link(
        &self,
        scratch: &Path,
        object: &Path,
        elf: &Path,
        base: u32,
        entry: Option<&str>,
        roots: &[String],
    ) -> Result<()> {
        let script = scratch.join("patch.ld");
        let defs = scratch.join("firmware_syms.ld");
        fs::write(&script, link_script(base, entry))?;
        fs::write(&defs, self.firmware.linker_defs())?;

        let mut args: Vec<String> = vec![
            "-nostdlib".to_owned(),
            "-nostartfiles".to_owned(),
            "-Wl,--gc-sections".to_owned(),
            format!("-Wl,-T,{}", script.display()),
            format!("-Wl,-T,{}", defs.display()),
        ];
        if let Some(entry) = entry {
            args.push(format!("-Wl,--undefined={}", entry));
        }
        // The architecture flags matter for the link too (multilib
        // selection, Thumb interwork veneers).
        args.extend(
            self.config
                .args
                .iter()
                .filter(|a| a.starts_with("-m"))
                .cloned(),
        );
        for root in roots {
            args.push(format!("-Wl,--undefined={}", root));
        }
        args.push(object.display().to_string());
        args.push("-o".to_owned());
        args.push(elf.display().to_string());

        run_tool(&self.tools.compiler, &args, Error::Link).map(|_| ())
    }

    /// The defined-symbol table of the linked patch, restricted to
    /// addresses at or above the requested base so imported firmware stubs
    /// drop out.
    fn linked_symbols(&self, elf: &Path, base: u32) -> Result<BTreeMap<String, u32>> {
        let out = run_tool(&self.tools.nm, &[elf.as_os_str()], Error::Extract)?;
        let mut symbols = BTreeMap::new();
        for line in out.lines() {
            let mut parts = line.split_whitespace();
            if let (Some(value), Some(kind), Some(name)) =
                (parts.next(), parts.next(), parts.next())
            {
                // Absolute symbols are the imported firmware definitions.
                if kind == "A" || kind == "a" || kind == "U" {
                    continue;
                }
                if let Ok(value) = u32::from_str_radix(value, 16) {
                    if value >= base {
                        symbols.insert(name.to_owned(), value);
                    }
                }
            }
        }
        if symbols.is_empty() {
            return Err(Error::Extract(format!(
                "no symbols at or above 0x{:08X} in the linked patch",
                base
            )));
        }
        Ok(symbols)
    }
}

/// Fix linker-synthesized long-call veneers that dropped the Thumb bit:
/// scan for the fixed `LDR.W PC, [PC]` byte pattern and, when the 4-byte
/// literal behind it names a known Thumb function with bit 0 clear, set
/// the bit. Purely a byte-level pass; nothing is re-linked and all other
/// bytes stay untouched.
pub fn fix_thumb_veneers(binary: &mut [u8], firmware: &SymbolTable) -> usize {
    let mut fixed = 0;
    if binary.len() < 8 {
        return fixed;
    }
    let mut offset = 0;
    while offset + 8 <= binary.len() {
        if binary[offset..offset + 4] == VENEER_LDR_PC {
            let literal = u32::from_le_bytes([
                binary[offset + 4],
                binary[offset + 5],
                binary[offset + 6],
                binary[offset + 7],
            ]);
            if literal & 1 == 0 && firmware.is_thumb_function_at(literal) {
                binary[offset + 4] |= 1;
                fixed += 1;
            }
            offset += 8;
        } else {
            // Thumb instructions are halfword-aligned.
            offset += 2;
        }
    }
    fixed
}

fn link_script(base: u32, entry: Option<&str>) -> String {
    let mut script = String::new();
    if let Some(entry) = entry {
        script.push_str(&format!("ENTRY({})\n", entry));
    }
    script.push_str("SECTIONS\n{\n");
    script.push_str(&format!("    . = 0x{:08X};\n", base));
    script.push_str("    .patch : {\n");
    if let Some(entry) = entry {
        script.push_str(&format!("        KEEP(*(.text.{}))\n", entry));
    }
    script.push_str(
        "        *(.text*)\n\
         \x20       *(.rodata*)\n\
         \x20       *(.data*)\n\
         \x20       *(.bss*)\n\
         \x20       *(COMMON)\n\
         \x20   }\n}\n",
    );
    script
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::firmware::{FirmwareSymbol, SymbolKind};

    fn firmware_with_thumb_fn(address: u32) -> SymbolTable {
        let mut table = SymbolTable::default();
        table.insert(FirmwareSymbol {
            name: "uart_poll".into(),
            address,
            thumb: true,
            kind: SymbolKind::Function,
        });
        table.insert(FirmwareSymbol {
            name: "main".into(),
            address: 0x0800_0400,
            thumb: false,
            kind: SymbolKind::Function,
        });
        table
    }

    fn veneer_blob(literal: u32) -> Vec<u8> {
        let mut blob = vec![0x00, 0xBF, 0x00, 0xBF]; // two NOPs
        blob.extend_from_slice(&VENEER_LDR_PC);
        blob.extend_from_slice(&literal.to_le_bytes());
        blob.extend_from_slice(&[0x70, 0x47]); // BX LR
        blob
    }

    #[test]
    fn veneer_literal_gets_thumb_bit() {
        let firmware = firmware_with_thumb_fn(0x0800_0500);
        let mut blob = veneer_blob(0x0800_0500);
        let before = blob.clone();

        let fixed = fix_thumb_veneers(&mut blob, &firmware);
        assert_eq!(fixed, 1);
        // Only the low literal byte changed, and only its lowest bit.
        assert_eq!(blob[8], before[8] | 1);
        for (i, (a, b)) in blob.iter().zip(before.iter()).enumerate() {
            if i != 8 {
                assert_eq!(a, b, "byte {} must be untouched", i);
            }
        }
    }

    #[test]
    fn veneer_to_arm_function_is_untouched() {
        let firmware = firmware_with_thumb_fn(0x0800_0500);
        let mut blob = veneer_blob(0x0800_0400); // `main`, not Thumb
        let before = blob.clone();
        assert_eq!(fix_thumb_veneers(&mut blob, &firmware), 0);
        assert_eq!(blob, before);
    }

    #[test]
    fn veneer_with_bit_already_set_is_untouched() {
        let firmware = firmware_with_thumb_fn(0x0800_0500);
        let mut blob = veneer_blob(0x0800_0501);
        let before = blob.clone();
        assert_eq!(fix_thumb_veneers(&mut blob, &firmware), 0);
        assert_eq!(blob, before);
    }

    #[test]
    fn unknown_literal_is_untouched() {
        let firmware = firmware_with_thumb_fn(0x0800_0500);
        let mut blob = veneer_blob(0x0800_9999);
        let before = blob.clone();
        assert_eq!(fix_thumb_veneers(&mut blob, &firmware), 0);
        assert_eq!(blob, before);
    }

    #[test]
    fn short_binary_is_safe() {
        let firmware = firmware_with_thumb_fn(0x0800_0500);
        let mut blob = vec![0x5F, 0xF8, 0x00];
        assert_eq!(fix_thumb_veneers(&mut blob, &firmware), 0);
    }

    #[test]
    fn user_symbols_exclude_veneers_and_internals() {
        let mut symbols = BTreeMap::new();
        symbols.insert("uart_poll".to_owned(), 0x2000_1000_u32);
        symbols.insert("__uart_poll_veneer".to_owned(), 0x2000_1020);
        symbols.insert("$t".to_owned(), 0x2000_1000);
        symbols.insert("helper".to_owned(), 0x2000_1010);
        let patch = CompiledPatch {
            base: 0x2000_1000,
            binary: vec![0; 32],
            symbols,
            entry: Some("uart_poll".into()),
        };
        let names: Vec<_> = patch.user_symbols().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["helper", "uart_poll"]);
    }

    #[test]
    fn link_script_places_base_and_keeps_entry() {
        let script = link_script(0x2000_1100, Some("uart_poll"));
        assert!(script.contains("ENTRY(uart_poll)"));
        assert!(script.contains(". = 0x20001100;"));
        assert!(script.contains("KEEP(*(.text.uart_poll))"));

        let anonymous = link_script(0x2000_1100, None);
        assert!(!anonymous.contains("ENTRY("));
        assert!(anonymous.contains(". = 0x20001100;"));
    }
}
