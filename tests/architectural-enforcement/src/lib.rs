//! Architectural Enforcement Integration Tests
//!
//! Source-level checks over the production code of the workspace:
//! - No sleep() calls (rate limiting and timeouts are driven by stored
//!   instants and I/O, never by waiting)
//! - No unwrap()/expect() outside tests
//!
//! The helpers here walk the production source trees and yield the lines
//! that belong to production code, i.e. everything before a file's
//! `#[cfg(test)]` section, with comment lines dropped.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source directories, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["relay/core/src", "relay/daemon/src", "widget/src"];

/// Workspace root, derived from this crate's manifest directory
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// One production line of a source file
#[derive(Debug, Clone)]
pub struct SourceLine {
    /// File the line belongs to
    pub path: PathBuf,
    /// 1-based line number
    pub number: usize,
    /// Line text with any trailing `//` comment removed
    pub code: String,
}

/// Every `.rs` file under the production directories
///
/// # Panics
///
/// When a production directory is missing, so a moved crate cannot
/// silently disable the checks.
#[must_use]
pub fn production_files() -> Vec<PathBuf> {
    let root = workspace_root();
    let mut files = Vec::new();

    for dir in PRODUCTION_DIRS {
        let path = root.join(dir);
        assert!(path.is_dir(), "Missing source directory: {}", path.display());

        for entry in walkdir::WalkDir::new(&path)
            .into_iter()
            .filter_map(Result::ok)
        {
            if entry.path().extension().and_then(|s| s.to_str()) == Some("rs") {
                files.push(entry.into_path());
            }
        }
    }

    files.sort();
    files
}

/// Production lines of one file
#[must_use]
pub fn production_lines(path: &Path) -> Vec<SourceLine> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };

    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| !line.trim_start().starts_with("#[cfg(test)]"))
        .filter(|(_, line)| !line.trim_start().starts_with("//"))
        .map(|(idx, line)| SourceLine {
            path: path.to_path_buf(),
            number: idx + 1,
            code: strip_comment(line).to_string(),
        })
        .collect()
}

/// Drop a trailing `//` comment, leaving string literals containing `//`
/// (URLs) alone
fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut prev = '\0';
    for (idx, c) in line.char_indices() {
        match c {
            '"' if prev != '\\' => in_string = !in_string,
            '/' if !in_string && prev == '/' => return &line[..idx - 1],
            _ => {}
        }
        prev = c;
    }
    line
}

/// Production lines matching `predicate`, formatted for a failure report
#[must_use]
pub fn find_violations<F>(predicate: F) -> Vec<String>
where
    F: Fn(&str) -> bool,
{
    production_files()
        .iter()
        .flat_map(|path| production_lines(path))
        .filter(|line| predicate(&line.code))
        .map(|line| {
            format!(
                "{}:{} - {}",
                line.path.display(),
                line.number,
                line.code.trim()
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_comment_keeps_urls() {
        assert_eq!(
            strip_comment(r#"let url = "http://localhost"; // note"#),
            r#"let url = "http://localhost"; "#
        );
        assert_eq!(strip_comment("call(); // sleep(1)"), "call(); ");
        assert_eq!(strip_comment("plain"), "plain");
    }

    #[test]
    fn test_production_sources_found() {
        let files = production_files();
        assert!(files.iter().any(|f| f.ends_with("relay/core/src/lib.rs")));
        assert!(files.iter().any(|f| f.ends_with("widget/src/transcript.rs")));
    }
}
