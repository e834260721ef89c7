//! Build-configuration resolution for patch fragments.
//!
//! The firmware's own build writes a database of `{file, command}` pairs
//! (the `compile_commands.json` shape). Given a patch fragment, the
//! resolver recovers a usable compiler invocation by, in order:
//!
//!  1. an entry whose file path matches the fragment's origin exactly,
//!  2. an entry in the same directory, or the nearest ancestor directory,
//!  3. a literal invocation recovered from the per-object dependency file
//!     sitting next to the build output,
//!  4. any C-file entry as a last resort.
//!
//! A recovered literal invocation is preferred nearly verbatim, with only
//! the dependency-generation flags stripped and the fragment/object paths
//! swapped in, because flag reconstruction is lossy.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde::Deserialize;

use crate::error::{Error, Result};

/// How many ancestor directories of the fragment become extra includes.
const FRAGMENT_INCLUDE_ANCESTORS: usize = 4;

/// How deep under the database root the dependency-file scan descends.
const DEPFILE_SCAN_DEPTH: usize = 6;

// =============================================================================
// Public Interface
// =============================================================================

/// One `{file, command}` pair of the build database.
#[derive(Debug, Clone)]
pub struct BuildEntry {
    pub file: PathBuf,
    pub command: String,
}

/// The build-commands database, loaded from disk once and queried per
/// compile.
#[derive(Debug)]
pub struct BuildDatabase {
    entries: Vec<BuildEntry>,
    /// Directory of the database file, the root for dependency-file scans.
    root: PathBuf,
}

/// A compiler invocation recovered for the fragment: the compiler binary
/// plus its arguments, either reconstructed from the safe flag subset or a
/// cleaned literal pass-through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
    pub compiler: String,
    pub args: Vec<String>,
    /// Whether `args` is a literal invocation passed through nearly
    /// verbatim rather than a reconstructed flag set.
    pub literal: bool,
}

impl BuildDatabase {
    /// Load the database from a JSON file of `{file, command}` (optionally
    /// `directory`) objects.
    pub fn load(path: &Path) -> Result<BuildDatabase> {
        #[derive(Deserialize)]
        struct RawEntry {
            file: String,
            command: String,
            #[serde(default)]
            directory: Option<String>,
        }

        let text = fs::read_to_string(path)?;
        let raw: Vec<RawEntry> = serde_json::from_str(&text).map_err(|e| {
            Error::ConfigNotFound(format!(
                "build commands database {} is malformed: {}",
                path.display(),
                e
            ))
        })?;

        let entries = raw
            .into_iter()
            .map(|r| {
                let file = match &r.directory {
                    Some(dir) if Path::new(&r.file).is_relative() => {
                        Path::new(dir).join(&r.file)
                    }
                    _ => PathBuf::from(&r.file),
                };
                BuildEntry {
                    file,
                    command: r.command,
                }
            })
            .collect();

        let root = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(BuildDatabase { entries, root })
    }

    #[cfg(test)]
    pub(crate) fn from_entries(entries: Vec<BuildEntry>, root: PathBuf) -> Self {
        BuildDatabase { entries, root }
    }

    /// Recover a compiler invocation for a fragment originating at
    /// `source` (when known).
    pub fn resolve(&self, source: Option<&Path>) -> Result<BuildConfig> {
        if let Some(src) = source {
            if let Some(entry) = self.exact_match(src) {
                debug!("build config: exact match {}", entry.file.display());
                return BuildConfig::reconstruct(&entry.command);
            }
            if let Some(entry) = self.directory_match(src) {
                debug!("build config: directory match {}", entry.file.display());
                return BuildConfig::reconstruct(&entry.command);
            }
            if let Some(command) = self.recover_from_depfile(src) {
                debug!("build config: literal invocation from dependency file");
                return BuildConfig::passthrough(&command);
            }
        }
        if let Some(entry) = self.any_c_entry() {
            debug!(
                "build config: falling back to any C entry {}",
                entry.file.display()
            );
            return BuildConfig::reconstruct(&entry.command);
        }
        Err(Error::ConfigNotFound(match source {
            Some(src) => format!("no build command matches {}", src.display()),
            None => "the build commands database has no C entries".into(),
        }))
    }

    fn exact_match(&self, src: &Path) -> Option<&BuildEntry> {
        self.entries.iter().find(|e| e.file == src)
    }

    /// Same-directory entry first, then the entry in the deepest ancestor
    /// directory of the source.
    fn directory_match(&self, src: &Path) -> Option<&BuildEntry> {
        let src_dir = src.parent()?;
        if let Some(entry) = self
            .entries
            .iter()
            .find(|e| e.file.parent() == Some(src_dir))
        {
            return Some(entry);
        }
        self.entries
            .iter()
            .filter(|e| {
                e.file
                    .parent()
                    .map_or(false, |dir| src_dir.starts_with(dir))
            })
            .max_by_key(|e| e.file.parent().map_or(0, |d| d.components().count()))
    }

    /// Look for `<stem>.d` under the database root; when its rule mentions
    /// the source, read the literal invocation from the `<stem>.o.cmd`
    /// sidecar the build wrote next to it.
    fn recover_from_depfile(&self, src: &Path) -> Option<String> {
        let stem = src.file_stem()?.to_str()?;
        let source_name = src.file_name()?.to_str()?;

        let depfile = find_file(&self.root, &format!("{}.d", stem), DEPFILE_SCAN_DEPTH)?;
        let rule = fs::read_to_string(&depfile).ok()?;
        if !rule.contains(source_name) {
            return None;
        }

        for sidecar in &[
            depfile.with_file_name(format!("{}.o.cmd", stem)),
            depfile.with_file_name(format!(".{}.o.cmd", stem)),
        ] {
            if let Ok(text) = fs::read_to_string(sidecar) {
                // kbuild-style `cmd_foo.o := <invocation>` or the bare
                // invocation on the first line.
                let line = text.lines().next()?.trim();
                let command = match line.split_once(":=") {
                    Some((_, cmd)) => cmd.trim(),
                    None => line,
                };
                if !command.is_empty() {
                    return Some(command.to_owned());
                }
            }
        }
        None
    }

    fn any_c_entry(&self) -> Option<&BuildEntry> {
        self.entries
            .iter()
            .find(|e| e.file.extension().map_or(false, |ext| ext == "c"))
    }
}

impl BuildConfig {
    /// Reconstruct a configuration out of an invocation: compiler path,
    /// includes, defines and the safe architecture/codegen flag subset. A
    /// size-optimization flag is forced when the invocation had no `-O`.
    pub(crate) fn reconstruct(command: &str) -> Result<BuildConfig> {
        let tokens = shell_split(command);
        let mut iter = tokens.into_iter();
        let compiler = iter
            .next()
            .ok_or_else(|| Error::ConfigNotFound(format!("empty build command: {}", command)))?;

        let mut args = Vec::new();
        let mut has_opt = false;
        while let Some(token) = iter.next() {
            match token.as_str() {
                "-c" | "-S" | "-E" | "-MMD" | "-MD" | "-MP" | "-MG" => {}
                "-o" | "-MF" | "-MT" | "-MQ" => {
                    iter.next();
                }
                "-I" | "-D" => {
                    // Bare form: the value is the next token.
                    if let Some(value) = iter.next() {
                        args.push(token);
                        args.push(value);
                    }
                }
                t if t.starts_with("-I")
                    || t.starts_with("-D")
                    || t.starts_with("-m")
                    || t.starts_with("-f")
                    || t.starts_with("-std=") =>
                {
                    args.push(token);
                }
                t if t.starts_with("-O") => {
                    has_opt = true;
                    args.push(token);
                }
                t if is_source_token(t) => {}
                _ => {}
            }
        }
        if !has_opt {
            args.push("-Os".to_owned());
        }

        Ok(BuildConfig {
            compiler,
            args,
            literal: false,
        })
    }

    /// Use a recovered invocation nearly verbatim: strip only the
    /// dependency-generation flags, the source token and the output pair.
    /// The pipeline appends the fragment and object paths itself.
    pub(crate) fn passthrough(command: &str) -> Result<BuildConfig> {
        let tokens = shell_split(command);
        let mut iter = tokens.into_iter();
        let compiler = iter
            .next()
            .ok_or_else(|| Error::ConfigNotFound(format!("empty build command: {}", command)))?;

        let mut args = Vec::new();
        while let Some(token) = iter.next() {
            match token.as_str() {
                "-c" | "-MMD" | "-MD" | "-MP" | "-MG" => {}
                "-o" | "-MF" | "-MT" | "-MQ" => {
                    iter.next();
                }
                t if is_source_token(t) => {}
                _ => args.push(token),
            }
        }

        Ok(BuildConfig {
            compiler,
            args,
            literal: true,
        })
    }

    /// Append the fragment's own directory and up to four ancestors as
    /// extra include paths, so headers next to the original source keep
    /// resolving from the scratch location.
    pub(crate) fn add_fragment_includes(&mut self, fragment_dir: &Path) {
        let mut dir = Some(fragment_dir);
        for _ in 0..=FRAGMENT_INCLUDE_ANCESTORS {
            match dir {
                Some(d) if !d.as_os_str().is_empty() => {
                    self.args.push(format!("-I{}", d.display()));
                    dir = d.parent();
                }
                _ => break,
            }
        }
    }
}

// =============================================================================
// Private stuff
// =============================================================================

fn is_source_token(token: &str) -> bool {
    let lower = token.to_lowercase();
    !token.starts_with('-')
        && (lower.ends_with(".c")
            || lower.ends_with(".cc")
            || lower.ends_with(".cpp")
            || lower.ends_with(".s"))
}

/// Minimal shell-style splitter: whitespace-separated tokens with single
/// and double quoting.
fn shell_split(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in command.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            None => match c {
                '\'' | '"' => quote = Some(c),
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            },
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Bounded-depth search for a file named `name` under `root`.
fn find_file(root: &Path, name: &str, depth: usize) -> Option<PathBuf> {
    let entries = fs::read_dir(root).ok()?;
    let mut subdirs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() && path.file_name().map_or(false, |f| f == name) {
            return Some(path);
        }
        if path.is_dir() {
            subdirs.push(path);
        }
    }
    if depth == 0 {
        return None;
    }
    subdirs
        .into_iter()
        .find_map(|dir| find_file(&dir, name, depth - 1))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const CMD: &str = "arm-none-eabi-gcc -DSTM32F407xx -I include -Iinc/hal \
                       -mcpu=cortex-m4 -mthumb -O2 -ffast-math -MMD -MF build/uart.d \
                       -c src/uart.c -o build/uart.o";

    fn entry(file: &str, command: &str) -> BuildEntry {
        BuildEntry {
            file: PathBuf::from(file),
            command: command.to_owned(),
        }
    }

    #[test]
    fn shell_split_handles_quotes() {
        let tokens = shell_split(r#"gcc -DVERSION="1.2 beta" -I 'my inc' -c a.c"#);
        assert_eq!(
            tokens,
            vec!["gcc", "-DVERSION=1.2 beta", "-I", "my inc", "-c", "a.c"]
        );
    }

    #[test]
    fn reconstruct_keeps_safe_subset() {
        let config = BuildConfig::reconstruct(CMD).unwrap();
        assert_eq!(config.compiler, "arm-none-eabi-gcc");
        assert!(!config.literal);
        assert!(config.args.contains(&"-DSTM32F407xx".to_owned()));
        assert!(config.args.contains(&"-Iinc/hal".to_owned()));
        assert!(config.args.contains(&"-mcpu=cortex-m4".to_owned()));
        assert!(config.args.contains(&"-mthumb".to_owned()));
        assert!(config.args.contains(&"-O2".to_owned()));
        assert!(config.args.contains(&"-ffast-math".to_owned()));
        // Output, source and dependency flags are gone.
        assert!(!config.args.iter().any(|a| a.contains("uart")));
        assert!(!config.args.contains(&"-MMD".to_owned()));
        assert!(!config.args.contains(&"-c".to_owned()));
    }

    #[test]
    fn reconstruct_forces_size_optimization() {
        let config =
            BuildConfig::reconstruct("arm-none-eabi-gcc -mthumb -c src/a.c -o a.o").unwrap();
        assert!(config.args.contains(&"-Os".to_owned()));

        let with_opt = BuildConfig::reconstruct(CMD).unwrap();
        assert!(!with_opt.args.contains(&"-Os".to_owned()));
    }

    #[test]
    fn passthrough_strips_only_dep_source_and_output() {
        let config = BuildConfig::passthrough(CMD).unwrap();
        assert!(config.literal);
        // Everything survives except -c, -o pair, -MMD/-MF pair, source.
        assert!(config.args.contains(&"-O2".to_owned()));
        assert!(config.args.contains(&"-ffast-math".to_owned()));
        assert!(!config.args.iter().any(|a| a.contains("uart")));
        assert!(!config.args.contains(&"-MMD".to_owned()));
        assert!(!config.args.contains(&"-MF".to_owned()));
    }

    #[test]
    fn fragment_includes_walk_ancestors() {
        let mut config = BuildConfig::reconstruct("gcc -c x.c").unwrap();
        config.add_fragment_includes(Path::new("/work/fw/app/patches"));
        let includes: Vec<_> = config
            .args
            .iter()
            .filter(|a| a.starts_with("-I"))
            .collect();
        assert_eq!(
            includes,
            vec![
                "-I/work/fw/app/patches",
                "-I/work/fw/app",
                "-I/work/fw",
                "-I/work",
                "-I/"
            ]
        );
    }

    #[test]
    fn exact_match_wins_over_same_directory() {
        let db = BuildDatabase::from_entries(
            vec![
                entry("src/other.c", "gcc -DFROM_OTHER -c src/other.c -o other.o"),
                entry("src/uart.c", "gcc -DFROM_EXACT -c src/uart.c -o uart.o"),
            ],
            PathBuf::from("."),
        );
        let config = db.resolve(Some(Path::new("src/uart.c"))).unwrap();
        assert!(config.args.contains(&"-DFROM_EXACT".to_owned()));
    }

    #[test]
    fn same_directory_fallback() {
        let db = BuildDatabase::from_entries(
            vec![entry("src/other.c", "gcc -DFROM_DIR -c src/other.c -o o.o")],
            PathBuf::from("."),
        );
        let config = db.resolve(Some(Path::new("src/brand_new.c"))).unwrap();
        assert!(config.args.contains(&"-DFROM_DIR".to_owned()));
    }

    #[test]
    fn ancestor_directory_prefers_deepest() {
        let db = BuildDatabase::from_entries(
            vec![
                entry("fw/a.c", "gcc -DSHALLOW -c fw/a.c -o a.o"),
                entry("fw/drivers/b.c", "gcc -DDEEP -c fw/drivers/b.c -o b.o"),
            ],
            PathBuf::from("."),
        );
        let config = db
            .resolve(Some(Path::new("fw/drivers/uart/brand_new.c")))
            .unwrap();
        assert!(config.args.contains(&"-DDEEP".to_owned()));
    }

    #[test]
    fn any_c_entry_as_last_resort() {
        let db = BuildDatabase::from_entries(
            vec![
                entry("fw/startup.s", "as fw/startup.s -o s.o"),
                entry("fw/main.c", "gcc -DANY_C -c fw/main.c -o m.o"),
            ],
            PathBuf::from("."),
        );
        let config = db.resolve(Some(Path::new("elsewhere/frag.c"))).unwrap();
        assert!(config.args.contains(&"-DANY_C".to_owned()));
    }

    #[test]
    fn no_match_is_config_not_found() {
        let db = BuildDatabase::from_entries(
            vec![entry("fw/startup.s", "as fw/startup.s -o s.o")],
            PathBuf::from("."),
        );
        let err = db.resolve(Some(Path::new("elsewhere/frag.c"))).unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound(_)));
    }

    #[test]
    fn depfile_recovery_passes_literal_through() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("build");
        std::fs::create_dir(&build).unwrap();
        std::fs::write(build.join("special.d"), "special.o: ../src/special.c ../inc/api.h\n")
            .unwrap();
        std::fs::write(
            build.join("special.o.cmd"),
            "cmd_special.o := arm-none-eabi-gcc -DFROM_DEPFILE -O1 -MMD -c ../src/special.c -o special.o\n",
        )
        .unwrap();

        let db = BuildDatabase::from_entries(
            vec![entry("lib/unrelated.c", "gcc -DUNRELATED -c lib/unrelated.c -o u.o")],
            dir.path().to_path_buf(),
        );
        let config = db
            .resolve(Some(Path::new("../src/special.c")))
            .unwrap();
        assert!(config.literal);
        assert!(config.args.contains(&"-DFROM_DEPFILE".to_owned()));
        assert!(!config.args.contains(&"-MMD".to_owned()));
    }

    #[test]
    fn load_rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compile_commands.json");
        std::fs::write(&path, "not json at all").unwrap();
        let err = BuildDatabase::load(&path).unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound(_)));
    }

    #[test]
    fn load_resolves_relative_files_against_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("compile_commands.json");
        std::fs::write(
            &path,
            r#"[{"file": "src/uart.c", "directory": "/work/fw", "command": "gcc -DX -c src/uart.c -o u.o"}]"#,
        )
        .unwrap();
        let db = BuildDatabase::load(&path).unwrap();
        let config = db.resolve(Some(Path::new("/work/fw/src/uart.c"))).unwrap();
        assert!(config.args.contains(&"-DX".to_owned()));
    }
}
