//! Locating the cross toolchain.
//!
//! The pipeline needs four external tools: the cross compiler itself, its
//! binary-section extractor, its symbol dumper and its disassembler. The
//! companion tools are named after the compiler binary by substring
//! replacement (`arm-none-eabi-gcc` -> `arm-none-eabi-objcopy`), and all
//! of them are looked up in the configured toolchain directory first, then
//! on the search path.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::debug;

use crate::error::{Error, Result};

// =============================================================================
// Public Interface
// =============================================================================

/// Resolved paths of the external tools used by the pipeline.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub compiler: PathBuf,
    pub objcopy: PathBuf,
    pub nm: PathBuf,
    pub objdump: PathBuf,
}

impl Toolchain {
    /// Locate the compiler named by the build configuration and derive its
    /// companion tools.
    pub fn locate(compiler: &str, toolchain_dir: Option<&Path>) -> Result<Toolchain> {
        let compiler_name = Path::new(compiler)
            .file_name()
            .and_then(OsStr::to_str)
            .ok_or_else(|| Error::ConfigNotFound(format!("bad compiler name: {}", compiler)))?
            .to_owned();

        let compiler_path = resolve_tool(compiler, toolchain_dir)?;
        let objcopy = resolve_tool(&companion_name(&compiler_name, "objcopy"), toolchain_dir)?;
        let nm = resolve_tool(&companion_name(&compiler_name, "nm"), toolchain_dir)?;
        let objdump = resolve_tool(&companion_name(&compiler_name, "objdump"), toolchain_dir)?;

        debug!(
            "toolchain: {} / {} / {} / {}",
            compiler_path.display(),
            objcopy.display(),
            nm.display(),
            objdump.display()
        );
        Ok(Toolchain {
            compiler: compiler_path,
            objcopy,
            nm,
            objdump,
        })
    }
}

/// Run an external tool, mapping spawn failures and non-zero exits through
/// `map` (one of the pipeline error constructors). Returns the captured
/// stdout.
pub(crate) fn run_tool<S: AsRef<OsStr>>(
    program: &Path,
    args: &[S],
    map: fn(String) -> Error,
) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| map(format!("failed to run {}: {}", program.display(), e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(map(format!("{}{}", stdout, stderr)));
    }
    Ok(stdout)
}

// =============================================================================
// Private stuff
// =============================================================================

/// Derive a companion tool's binary name from the compiler's. The compiler
/// token inside the name is replaced in place so prefixes and suffixes
/// survive (`arm-none-eabi-gcc-10` -> `arm-none-eabi-objcopy-10`).
fn companion_name(compiler_name: &str, tool: &str) -> String {
    for token in &["gcc", "g++", "clang", "cc"] {
        if let Some(idx) = compiler_name.rfind(token) {
            let mut name = String::with_capacity(compiler_name.len() + tool.len());
            name.push_str(&compiler_name[..idx]);
            name.push_str(tool);
            name.push_str(&compiler_name[idx + token.len()..]);
            return name;
        }
    }
    // No recognizable compiler token: assume a `<prefix>-<tool>` scheme.
    match compiler_name.rfind('-') {
        Some(idx) => format!("{}-{}", &compiler_name[..idx], tool),
        None => tool.to_owned(),
    }
}

fn resolve_tool(name: &str, toolchain_dir: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = toolchain_dir {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    which::which(name)
        .map_err(|_| Error::ConfigNotFound(format!("tool `{}` not found on the search path", name)))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn companion_replaces_gcc_token() {
        assert_eq!(
            companion_name("arm-none-eabi-gcc", "objcopy"),
            "arm-none-eabi-objcopy"
        );
        assert_eq!(companion_name("arm-none-eabi-gcc", "nm"), "arm-none-eabi-nm");
    }

    #[test]
    fn companion_keeps_version_suffix() {
        assert_eq!(
            companion_name("arm-none-eabi-gcc-10", "objdump"),
            "arm-none-eabi-objdump-10"
        );
    }

    #[test]
    fn companion_falls_back_to_prefix_scheme() {
        assert_eq!(
            companion_name("xtensa-esp32-elf-cc1", "nm"),
            // `cc` is found inside `cc1`; replacement is in place.
            "xtensa-esp32-elf-nm1"
        );
        assert_eq!(companion_name("unknown-frontend", "nm"), "unknown-nm");
    }

    #[test]
    fn toolchain_dir_wins_over_search_path() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("arm-none-eabi-gcc");
        std::fs::write(&fake, "#!/bin/sh\n").unwrap();

        let found = resolve_tool("arm-none-eabi-gcc", Some(dir.path())).unwrap();
        assert_eq!(found, fake);
    }

    #[test]
    fn missing_tool_is_config_not_found() {
        let err = resolve_tool("definitely-not-a-real-cross-gcc", None).unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound(_)));
    }
}
