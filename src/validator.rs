use crate::error::RunnerError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const DEFAULT_PATTERN: &str = "shm_*_05_*_*";

/// Splits `shm_<MAC 12 hex>_05_<t0 us>_<t1 us>` into its start and end times.
fn parse_shm_name(name: &str) -> Option<(u64, u64)> {
    let mut parts = name.strip_prefix("shm_")?.split('_');
    let (mac, kind, t0, t1) = (parts.next()?, parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() || kind != "05" {
        return None;
    }
    if mac.len() != 12 || !mac.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let micros = |s: &str| {
        (10..=20).contains(&s.len()) && s.chars().all(|c| c.is_ascii_digit())
    };
    if !(micros(t0) && micros(t1)) {
        return None;
    }
    Some((t0.parse().ok()?, t1.parse().ok()?))
}

/// Translates a shell glob (`*`, `?`, literals) into a regex matching a whole file name.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, RunnerError> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| RunnerError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Inclusive numeric bounds for one sample field
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldRange {
    pub min: f64,
    pub max: f64,
}

impl FieldRange {
    pub fn new(min: f64, max: f64) -> Result<Self, RunnerError> {
        if !(min.is_finite() && max.is_finite()) || min > max {
            return Err(RunnerError::InvalidConfig(format!(
                "invalid range {}..{}",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

impl fmt::Display for FieldRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.min, self.max)
    }
}

/// Ranges to enforce; `None` skips the range check for that field.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FieldRanges {
    pub acc: Option<FieldRange>,
    pub temp: Option<FieldRange>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidateOptions {
    /// Allowed drift between the name's end time and `t0 + last deltaT`
    pub tolerance_us: u64,
    pub strict: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    BadFilename,
    TokenCount,
    BadHex,
    NonMonotonic,
    NonFinite,
    AccOutOfRange,
    TempOutOfRange,
    EmptyFile,
    EndTimeMismatch,
}

impl ViolationKind {
    pub fn severity(self) -> Severity {
        match self {
            ViolationKind::AccOutOfRange
            | ViolationKind::TempOutOfRange
            | ViolationKind::EmptyFile => Severity::Warning,
            _ => Severity::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    /// 1-based line number, absent for whole-file violations
    pub line: Option<usize>,
    pub kind: ViolationKind,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Ok,
    Warn,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStats {
    pub lines: usize,
    pub bad_lines: usize,
    pub max_delta_us: u32,
    pub first_delta_us: Option<u32>,
    pub last_delta_us: Option<u32>,
    pub t0_us: Option<u64>,
    pub t1_us: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileReport {
    pub status: FileStatus,
    pub stats: FileStats,
    pub violations: Vec<Violation>,
}

impl FileReport {
    fn new() -> Self {
        Self {
            status: FileStatus::Ok,
            stats: FileStats::default(),
            violations: Vec::new(),
        }
    }

    fn push(&mut self, line: Option<usize>, kind: ViolationKind, message: String) {
        let severity = kind.severity();
        self.status = match (self.status, severity) {
            (_, Severity::Error) | (FileStatus::Error, _) => FileStatus::Error,
            (_, Severity::Warning) => FileStatus::Warn,
        };
        self.violations.push(Violation {
            line,
            kind,
            severity,
            message,
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
}

/// Outcome of a validation pass, keyed by file path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub strict: bool,
    pub verdict: Verdict,
    pub files_total: usize,
    pub files_ok: usize,
    pub files_warn: usize,
    pub files_error: usize,
    pub files: BTreeMap<String, FileReport>,
}

impl ValidationReport {
    fn from_files(files: BTreeMap<String, FileReport>, strict: bool) -> Self {
        let count = |status| files.values().filter(|f| f.status == status).count();
        let files_ok = count(FileStatus::Ok);
        let files_warn = count(FileStatus::Warn);
        let files_error = count(FileStatus::Error);
        let verdict = if strict && files_ok != files.len() {
            Verdict::Fail
        } else {
            Verdict::Pass
        };
        Self {
            strict,
            verdict,
            files_total: files.len(),
            files_ok,
            files_warn,
            files_error,
            files,
        }
    }

    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }

    pub fn violation_count(&self) -> usize {
        self.files.values().map(|f| f.violations.len()).sum()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn write_json(&self, path: &Path) -> crate::Result<()> {
        let json = self.to_json()?;
        crate::report::write_file(path, &json)
    }
}

/// Scans `data_dir` recursively for files named like `file_pattern` and checks each one.
pub fn validate(
    data_dir: &Path,
    file_pattern: &str,
    ranges: &FieldRanges,
    options: &ValidateOptions,
) -> Result<ValidationReport, RunnerError> {
    if !data_dir.is_dir() {
        return Err(RunnerError::MissingDataDir(data_dir.to_path_buf()));
    }
    let matcher = glob_to_regex(file_pattern)?;

    let mut paths: Vec<_> = WalkDir::new(data_dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.file_name().to_str().is_some_and(|n| matcher.is_match(n)))
        .map(|entry| entry.into_path())
        .collect();
    paths.sort();

    if paths.is_empty() {
        if options.strict {
            return Err(RunnerError::NoFilesMatched {
                dir: data_dir.to_path_buf(),
                pattern: file_pattern.to_string(),
            });
        }
        warn!(
            "No files matching {} under {}",
            file_pattern,
            data_dir.display()
        );
    }

    let files = paths
        .iter()
        .map(|path| {
            let report = validate_file(path, ranges, options.tolerance_us);
            debug!("{}: {:?} ({} lines)", path.display(), report.status, report.stats.lines);
            (path.display().to_string(), report)
        })
        .collect();

    let report = ValidationReport::from_files(files, options.strict);
    info!(
        "Validation: total={} ok={} warn={} error={} verdict={:?}",
        report.files_total, report.files_ok, report.files_warn, report.files_error, report.verdict
    );
    Ok(report)
}

/// Checks one SHM file's name and contents.
pub fn validate_file(path: &Path, ranges: &FieldRanges, tolerance_us: u64) -> FileReport {
    let mut report = FileReport::new();
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();

    let Some((t0, t1)) = parse_shm_name(name) else {
        report.push(
            None,
            ViolationKind::BadFilename,
            "file name does not match shm_<MAC12>_05_<t0>_<t1>".to_string(),
        );
        return report;
    };
    report.stats.t0_us = Some(t0);
    report.stats.t1_us = Some(t1);

    let content = match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            report.push(None, ViolationKind::BadFilename, format!("unreadable: {}", e));
            return report;
        }
    };

    for (idx, line) in content.lines().enumerate() {
        let line_no = idx + 1;
        if line.trim().is_empty() {
            continue;
        }
        report.stats.lines += 1;
        check_line(&mut report, line_no, line, ranges);
    }

    match report.stats.last_delta_us {
        None => report.push(
            None,
            ViolationKind::EmptyFile,
            "empty file or no valid lines".to_string(),
        ),
        Some(last) => {
            let expected = t0.saturating_add(u64::from(last));
            if expected.abs_diff(t1) > tolerance_us {
                report.push(
                    None,
                    ViolationKind::EndTimeMismatch,
                    format!(
                        "t1 in name ({}) does not match t0 + last deltaT ({}) within {}us",
                        t1, expected, tolerance_us
                    ),
                );
            }
        }
    }

    report
}

fn check_line(report: &mut FileReport, line_no: usize, line: &str, ranges: &FieldRanges) {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    // Trailing tokens after the five record words are ignored.
    if tokens.len() < 5 {
        report.stats.bad_lines += 1;
        report.push(
            Some(line_no),
            ViolationKind::TokenCount,
            format!("expected 5 tokens, found {}", tokens.len()),
        );
        return;
    }

    let delta = match decode_word(tokens[0]) {
        Ok(word) => word,
        Err(message) => {
            report.stats.bad_lines += 1;
            report.push(Some(line_no), ViolationKind::BadHex, format!("deltaT {}", message));
            return;
        }
    };

    if let Some(previous) = report.stats.last_delta_us {
        if delta < previous {
            report.push(
                Some(line_no),
                ViolationKind::NonMonotonic,
                format!("deltaT not monotonic ({} < {})", delta, previous),
            );
        }
    }
    report.stats.first_delta_us.get_or_insert(delta);
    report.stats.last_delta_us = Some(delta);
    report.stats.max_delta_us = report.stats.max_delta_us.max(delta);

    let mut values = [0f32; 4];
    for (slot, token) in values.iter_mut().zip(&tokens[1..]) {
        match decode_word(token) {
            Ok(bits) => *slot = f32::from_bits(bits),
            Err(message) => {
                report.stats.bad_lines += 1;
                report.push(Some(line_no), ViolationKind::BadHex, format!("float32 {}", message));
                return;
            }
        }
    }

    let [ax, ay, az, temp] = values;
    for (label, value) in [("ax", ax), ("ay", ay), ("az", az), ("temperature", temp)] {
        let value = f64::from(value);
        if !value.is_finite() {
            report.push(
                Some(line_no),
                ViolationKind::NonFinite,
                format!("{} is not finite", label),
            );
            continue;
        }
        let (range, kind) = if label == "temperature" {
            (ranges.temp, ViolationKind::TempOutOfRange)
        } else {
            (ranges.acc, ViolationKind::AccOutOfRange)
        };
        if let Some(range) = range.filter(|r| !r.contains(value)) {
            report.push(
                Some(line_no),
                kind,
                format!("{} out of range {}: {}", label, range, value),
            );
        }
    }
}

/// Decodes one big-endian 32-bit word written as exactly 8 hex digits.
fn decode_word(token: &str) -> Result<u32, String> {
    if token.len() != 8 {
        return Err(format!("is not 8 hex digits (len={})", token.len()));
    }
    u32::from_str_radix(token, 16).map_err(|_| format!("is not valid hex: {}", token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const T0: u64 = 1_700_000_000_000_000;

    fn line(delta: u32, ax: f32, ay: f32, az: f32, temp: f32) -> String {
        format!(
            "{:08X} {:08X} {:08X} {:08X} {:08X}\n",
            delta,
            ax.to_bits(),
            ay.to_bits(),
            az.to_bits(),
            temp.to_bits()
        )
    }

    fn write_shm(dir: &Path, last_delta: u32, body: &str) -> PathBuf {
        let path = dir.join(format!(
            "shm_A1B2C3D4E5F6_05_{}_{}",
            T0,
            T0 + u64::from(last_delta)
        ));
        fs::write(&path, body).unwrap();
        path
    }

    fn standard_ranges() -> FieldRanges {
        FieldRanges {
            acc: Some(FieldRange::new(-16.0, 16.0).unwrap()),
            temp: Some(FieldRange::new(-40.0, 125.0).unwrap()),
        }
    }

    fn strict() -> ValidateOptions {
        ValidateOptions {
            tolerance_us: 0,
            strict: true,
        }
    }

    #[test]
    fn test_glob_to_regex() {
        let re = glob_to_regex("shm_*_05_*_*").unwrap();
        assert!(re.is_match("shm_A1B2C3D4E5F6_05_1_2"));
        assert!(!re.is_match("xshm_A_05_1_2"));
        let re = glob_to_regex("sensor_?.log").unwrap();
        assert!(re.is_match("sensor_1.log"));
        assert!(!re.is_match("sensor_1xlog"));
        assert!(!re.is_match("sensor_12.log"));
    }

    #[test]
    fn test_parse_shm_name() {
        assert_eq!(
            parse_shm_name("shm_a1b2c3d4e5f6_05_1700000000_1700000010"),
            Some((1_700_000_000, 1_700_000_010))
        );
        assert_eq!(parse_shm_name("shm_a1b2c3d4e5f6_06_1700000000_1700000010"), None);
        assert_eq!(parse_shm_name("shm_a1b2c3d4e5f6_05_170000000_1700000010"), None);
        assert_eq!(parse_shm_name("shm_a1b2c3d4e5f6_05_1700000000_1700000010_x"), None);
    }

    #[test]
    fn test_in_range_file_is_clean() {
        let dir = TempDir::new().unwrap();
        let body = line(0, 0.0, -1.0, 9.81, 25.0) + &line(1000, 16.0, -16.0, 0.5, 125.0);
        write_shm(dir.path(), 1000, &body);

        let report = validate(dir.path(), DEFAULT_PATTERN, &standard_ranges(), &strict()).unwrap();
        assert_eq!(report.files_total, 1);
        assert_eq!(report.files_ok, 1);
        assert_eq!(report.violation_count(), 0);
        assert!(report.passed());
    }

    #[test]
    fn test_boundary_values_are_inclusive() {
        let dir = TempDir::new().unwrap();
        let body = line(0, -16.0, 16.0, 0.0, -40.0) + &line(10, 0.0, 0.0, 0.0, 125.0);
        let path = write_shm(dir.path(), 10, &body);

        let report = validate_file(&path, &standard_ranges(), 0);
        assert!(report.violations.is_empty(), "{:?}", report.violations);
        assert_eq!(report.status, FileStatus::Ok);
    }

    #[test]
    fn test_out_of_range_fails_strict_only() {
        let dir = TempDir::new().unwrap();
        let body = line(0, 17.0, 0.0, 0.0, 20.0) + &line(5, 0.0, 0.0, 0.0, 126.0);
        write_shm(dir.path(), 5, &body);

        let report = validate(dir.path(), DEFAULT_PATTERN, &standard_ranges(), &strict()).unwrap();
        assert_eq!(report.verdict, Verdict::Fail);
        assert_eq!(report.files_warn, 1);
        let file = report.files.values().next().unwrap();
        let kinds: Vec<_> = file.violations.iter().map(|v| (v.line, v.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                (Some(1), ViolationKind::AccOutOfRange),
                (Some(2), ViolationKind::TempOutOfRange)
            ]
        );

        let lenient = ValidateOptions::default();
        let report = validate(dir.path(), DEFAULT_PATTERN, &standard_ranges(), &lenient).unwrap();
        assert_eq!(report.verdict, Verdict::Pass);
        assert_eq!(report.violation_count(), 2);
    }

    #[test]
    fn test_structural_errors() {
        let dir = TempDir::new().unwrap();
        let body = line(100, 0.0, 0.0, 0.0, 20.0)
            + &line(50, 0.0, 0.0, 0.0, 20.0)
            + "0000000A 00000000\n"
            + "ZZZZZZZZ 00000000 00000000 00000000 00000000\n"
            + &line(60, f32::NAN, 0.0, 0.0, 20.0);
        let path = write_shm(dir.path(), 60, &body);

        let report = validate_file(&path, &FieldRanges::default(), 0);
        let kinds: Vec<_> = report.violations.iter().map(|v| v.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ViolationKind::NonMonotonic,
                ViolationKind::TokenCount,
                ViolationKind::BadHex,
                ViolationKind::NonFinite
            ]
        );
        assert_eq!(report.status, FileStatus::Error);
        assert_eq!(report.stats.lines, 5);
        assert_eq!(report.stats.bad_lines, 2);
        assert_eq!(report.stats.max_delta_us, 100);
    }

    #[test]
    fn test_trailing_tokens_are_ignored() {
        let dir = TempDir::new().unwrap();
        let body = line(0, 0.0, 0.0, 0.0, 20.0).trim_end().to_string() + " DEADBEEF extra\n"
            + &line(60, 0.0, 0.0, 0.0, 20.0);
        let path = write_shm(dir.path(), 60, &body);

        let report = validate_file(&path, &FieldRanges::default(), 0);
        assert!(report.violations.is_empty(), "{:?}", report.violations);
        assert_eq!(report.stats.bad_lines, 0);
        assert_eq!(report.status, FileStatus::Ok);
    }

    #[test]
    fn test_end_time_tolerance() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(format!("shm_A1B2C3D4E5F6_05_{}_{}", T0, T0 + 1003));
        fs::write(&path, line(0, 0.0, 0.0, 0.0, 0.0) + &line(1000, 0.0, 0.0, 0.0, 0.0)).unwrap();

        let report = validate_file(&path, &FieldRanges::default(), 0);
        assert_eq!(report.violations[0].kind, ViolationKind::EndTimeMismatch);
        let report = validate_file(&path, &FieldRanges::default(), 5);
        assert!(report.violations.is_empty());
    }

    #[test]
    fn test_bad_filename_and_empty_file() {
        let dir = TempDir::new().unwrap();
        let bad = dir.path().join("shm_nothex_05_1_2");
        fs::write(&bad, "").unwrap();
        let report = validate_file(&bad, &FieldRanges::default(), 0);
        assert_eq!(report.violations[0].kind, ViolationKind::BadFilename);
        assert_eq!(report.status, FileStatus::Error);

        let empty = write_shm(dir.path(), 0, "\n\n");
        let report = validate_file(&empty, &FieldRanges::default(), 0);
        assert_eq!(report.violations[0].kind, ViolationKind::EmptyFile);
        assert_eq!(report.status, FileStatus::Warn);
    }

    #[test]
    fn test_no_files_matched() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("unrelated.txt"), "x").unwrap();

        let err = validate(dir.path(), DEFAULT_PATTERN, &standard_ranges(), &strict()).unwrap_err();
        assert!(matches!(err, RunnerError::NoFilesMatched { .. }));

        let report =
            validate(dir.path(), DEFAULT_PATTERN, &standard_ranges(), &ValidateOptions::default())
                .unwrap();
        assert_eq!(report.files_total, 0);
        assert!(report.passed());
    }

    #[test]
    fn test_recursive_scan_and_missing_dir() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b");
        fs::create_dir_all(&nested).unwrap();
        write_shm(&nested, 0, &line(0, 0.0, 0.0, 0.0, 0.0));

        let report = validate(dir.path(), DEFAULT_PATTERN, &standard_ranges(), &strict()).unwrap();
        assert_eq!(report.files_total, 1);
        assert!(report.files.keys().next().unwrap().contains("a/b"));

        let missing = dir.path().join("missing");
        assert!(matches!(
            validate(&missing, DEFAULT_PATTERN, &standard_ranges(), &strict()),
            Err(RunnerError::MissingDataDir(_))
        ));
    }

    #[test]
    fn test_invalid_range() {
        assert!(FieldRange::new(5.0, -5.0).is_err());
        assert!(FieldRange::new(f64::NAN, 1.0).is_err());
    }
}
