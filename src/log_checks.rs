use crate::error::RunnerError;
use crate::registry::LogCheck;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// How much of the end of a log is searched by the checks.
pub const CHECK_WINDOW_BYTES: u64 = 400_000;

/// Result of evaluating one [`LogCheck`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub pattern: String,
    pub count: u64,
    pub matched: bool,
    pub min: Option<u64>,
    pub max: Option<u64>,
}

/// Reads at most the last `max_bytes` of a file as lossy UTF-8.
pub fn tail_bytes(path: &Path, max_bytes: u64) -> io::Result<String> {
    let mut file = File::open(path)?;
    let size = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(size.saturating_sub(max_bytes)))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Last `max_lines` non-empty lines of a file, or `None` if it is missing or blank.
pub fn tail_lines(path: &Path, max_lines: usize) -> Option<String> {
    let text = tail_bytes(path, 8192).ok()?;
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return None;
    }
    Some(lines[lines.len().saturating_sub(max_lines)..].join("\n"))
}

/// Compiles a case-insensitive check pattern.
pub fn compile(pattern: &str) -> Result<Regex, RunnerError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| RunnerError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
}

/// Counts each check's matches in `content` and compares against its bounds.
pub fn evaluate(checks: &[LogCheck], content: &str) -> Result<Vec<CheckOutcome>, RunnerError> {
    checks
        .iter()
        .map(|check| {
            let count = compile(&check.pattern)?.find_iter(content).count() as u64;
            let matched = check.min.map_or(true, |min| count >= min)
                && check.max.map_or(true, |max| count <= max);
            Ok(CheckOutcome {
                pattern: check.pattern.clone(),
                count,
                matched,
                min: check.min,
                max: check.max,
            })
        })
        .collect()
}

/// First file in `dir` whose name matches `pattern`, in name order.
pub fn find_log(dir: &Path, pattern: &Regex) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|name| pattern.is_match(name))
        })
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}
