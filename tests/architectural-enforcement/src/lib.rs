//! Architectural Enforcement Helpers
//!
//! Shared scanning code for the integration tests in `tests/`. They enforce
//! rules on the relay core's production code:
//! - No sleep calls (the run loop waits in `poll`, nowhere else)
//! - No `unsafe`
//! - No `.unwrap()` / `.expect(` outside tests
//! - No lock types in the single-threaded core
//!
//! Production code is everything in a file before its `#[cfg(test)]` marker.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// A rule broken on one line
#[derive(Debug, Clone)]
pub struct Violation {
    /// File containing the line
    pub path: PathBuf,
    /// 1-based line number
    pub line_number: usize,
    /// The offending line, trimmed
    pub line: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.path.display(), self.line_number, self.line)
    }
}

/// Repository root, resolved from this crate's manifest directory
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("..")
}

/// The relay core's source directory
#[must_use]
pub fn core_src() -> PathBuf {
    workspace_root().join("streamrelay").join("core").join("src")
}

/// Every `.rs` file under `dir`
#[must_use]
pub fn rust_files(dir: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(|e| e.into_path())
        .collect()
}

/// Production lines of a file: `(line_number, code)` with comments stripped
///
/// Stops at the first `#[cfg(test)]`.
#[must_use]
pub fn production_lines(path: &Path) -> Vec<(usize, String)> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };

    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| line.trim() != "#[cfg(test)]")
        .map(|(idx, line)| {
            let code = line.split("//").next().unwrap_or(line);
            (idx + 1, code.to_string())
        })
        .filter(|(_, code)| !code.trim().is_empty())
        .collect()
}

/// Scan the core's production code for lines matching `is_violation`
#[must_use]
pub fn scan_core(is_violation: impl Fn(&str) -> bool) -> Vec<Violation> {
    let mut violations = Vec::new();

    for path in rust_files(&core_src()) {
        for (line_number, code) in production_lines(&path) {
            if is_violation(&code) {
                violations.push(Violation {
                    path: path.clone(),
                    line_number,
                    line: code.trim().to_string(),
                });
            }
        }
    }

    violations
}

/// Fail with every violation listed
///
/// # Panics
///
/// Panics when `violations` is not empty.
pub fn assert_clean(rule: &str, violations: &[Violation]) {
    if violations.is_empty() {
        return;
    }

    eprintln!("\n❌ {rule}\n");
    for violation in violations {
        eprintln!("  ❌ {violation}");
    }
    panic!(
        "\nFound {} violation(s) of: {rule}\nFix these before merging!",
        violations.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let dir = std::env::temp_dir().join(format!("arch-enforcement-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let file = dir.join("sample.rs");
        fs::write(
            &file,
            "fn a() {} // trailing\n/// doc\n\n#[cfg(test)]\nfn b() { x.unwrap(); }\n",
        )
        .unwrap();

        let lines = production_lines(&file);
        assert_eq!(lines, vec![(1, "fn a() {} ".to_string())]);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_core_src_exists() {
        assert!(core_src().join("lib.rs").exists());
    }
}
