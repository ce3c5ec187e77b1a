use super::Result;
use crate::collector::Summary;
use crate::supervisor::{RunResult, RunStatus};
use eyre::WrapErr;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use tracing::info;

/// Canonical, machine-readable run report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportDocument {
    pub summary: Summary,
    /// Scenario ids in execution order
    pub run_order: Vec<String>,
    /// Results keyed by scenario id
    pub scenarios: BTreeMap<String, RunResult>,
}

/// A built report in both renderings
#[derive(Debug, Clone)]
pub struct Report {
    pub document: ReportDocument,
    pub json: String,
    pub html: String,
}

/// Renders the summary and results. Identical inputs give byte-identical JSON.
pub fn build(summary: &Summary, results: &[RunResult]) -> Result<Report> {
    let document = ReportDocument {
        summary: summary.clone(),
        run_order: results.iter().map(|r| r.scenario.clone()).collect(),
        scenarios: results
            .iter()
            .map(|r| (r.scenario.clone(), r.clone()))
            .collect(),
    };
    let json = serde_json::to_string_pretty(&document).wrap_err("failed to serialize report")?;
    let html = render_html(&document);
    Ok(Report { document, json, html })
}

/// Reads a JSON report back.
pub fn parse_json(json: &str) -> Result<ReportDocument> {
    serde_json::from_str(json).wrap_err("failed to parse report JSON")
}

/// Writes whichever renderings have a destination, creating parent directories.
pub fn write_reports(report: &Report, json_path: Option<&Path>, html_path: Option<&Path>) -> Result<()> {
    if let Some(path) = json_path {
        write_file(path, &report.json)?;
        info!("JSON report written to {}", path.display());
    }
    if let Some(path) = html_path {
        write_file(path, &report.html)?;
        info!("HTML report written to {}", path.display());
    }
    Ok(())
}

pub(crate) fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .wrap_err_with(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, contents).wrap_err_with(|| format!("failed to write {}", path.display()))
}

const STYLE: &str = "
body { font-family: sans-serif; margin: 24px; }
table { border-collapse: collapse; width: 100%; }
th, td { padding: 8px 10px; border-bottom: 1px solid #eee; vertical-align: top; }
.status { font-weight: 600; }
.pass { color: #0a8a0a; }
.fail { color: #b30000; }
.dot { display: inline-block; width: 10px; height: 10px; border-radius: 50%; margin-right: 6px; }
.dot.pass { background: #15c215; }
.dot.fail { background: #e01616; }
.small { color: #666; font-size: 12px; }
pre.tail { max-width: 520px; max-height: 8em; overflow: auto; font-size: 12px; background: #222; color: #fafafa; padding: 6px 8px; }
";

fn render_html(document: &ReportDocument) -> String {
    let summary = &document.summary;
    let mut rows = String::new();

    for id in &document.run_order {
        let Some(result) = document.scenarios.get(id) else {
            continue;
        };
        let class = match result.status {
            RunStatus::Pass => "pass",
            RunStatus::Fail => "fail",
        };

        let mut details = String::new();
        let _ = write!(details, "<div class=\"small\">UUID: <code>{}</code></div>", escape_html(&result.uuid));
        if let Some(reason) = &result.reason {
            let _ = write!(details, "<div class=\"small\">Reason: {}</div>", escape_html(&reason.to_string()));
        }
        if result.timed_out {
            details.push_str("<div class=\"small\">Timed out</div>");
        }
        if let Some(log) = &result.log {
            let _ = write!(details, "<div class=\"small\">Log: <code>{}</code></div>", escape_html(&log.display().to_string()));
        }
        for check in &result.checks {
            let _ = write!(
                details,
                "<div class=\"small\"><code>{}</code> count={} {}{}{}</div>",
                escape_html(&check.pattern),
                check.count,
                if check.matched { "ok" } else { "FAILED" },
                check.min.map(|m| format!(" (min={})", m)).unwrap_or_default(),
                check.max.map(|m| format!(" (max={})", m)).unwrap_or_default(),
            );
        }

        let tail = result
            .diagnostic
            .as_deref()
            .map(|d| format!("<pre class=\"tail\">{}</pre>", escape_html(d)))
            .unwrap_or_default();

        let _ = write!(
            rows,
            "<tr><td>{id}</td><td class=\"status {class}\"><span class=\"dot {class}\"></span>{status}</td>\
             <td>{name} ({elapsed:.1}s)<details><summary>Details</summary>{details}</details></td><td>{tail}</td></tr>\n",
            id = escape_html(&result.scenario),
            class = class,
            status = class.to_uppercase(),
            name = escape_html(&result.name),
            elapsed = result.elapsed_secs,
            details = details,
            tail = tail,
        );
    }

    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Sensor Stress Report</title>\
         <style>{style}</style></head><body>\n<h1>Sensor Stress Report</h1>\n\
         <div>Summary: <b>{passed} PASS</b> / <b>{failed} FAIL</b> of {total} ({duration:.1}s)</div>\n\
         <table><thead><tr><th>Scenario</th><th>Status</th><th>Details</th><th>stderr tail</th></tr></thead>\n\
         <tbody>\n{rows}</tbody></table>\n</body></html>\n",
        style = STYLE,
        passed = summary.passed,
        failed = summary.failed,
        total = summary.total,
        duration = summary.total_duration_secs,
        rows = rows,
    )
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    out
}
