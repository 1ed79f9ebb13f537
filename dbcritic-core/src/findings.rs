//! Structured review findings and the tolerant parser that extracts them
//! from raw model output.
//!
//! The model is instructed to emit one finding per line as
//! `SEVERITY | file:line | rationale`, or the single word `NONE` when the
//! diff is clean. Small models drift, so the parser skips prose, tolerates
//! bullet markers and missing anchors, and only reports a parse failure
//! when the output contains neither a finding nor the clean marker. A parse
//! failure is deliberately distinct from an empty finding list.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a finding, ordered least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Some(Severity::Info),
            "warning" | "warn" => Some(Severity::Warning),
            "critical" | "crit" => Some(Severity::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One piece of review feedback tied to a severity and, when the model
/// supplied one, a location in the diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub file: Option<String>,
    pub line: Option<u64>,
    pub note: String,
}

/// Result of parsing one chunk's worth of model output.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    /// Structured findings; empty when the model reported a clean chunk.
    Findings(Vec<Finding>),
    /// Nothing recognisable came back. The note is a snippet for the logs.
    ParseFailure { note: String },
}

fn parse_anchor(s: &str) -> (Option<String>, Option<u64>) {
    let s = s.trim().trim_matches('`').trim();
    if s.is_empty() || s == "-" {
        return (None, None);
    }
    if let Some((path, num)) = s.rsplit_once(':') {
        if let Ok(line) = num.trim().parse::<u64>() {
            return (Some(path.trim().to_string()), Some(line));
        }
    }
    (Some(s.to_string()), None)
}

fn parse_finding_line(line: &str) -> Option<Finding> {
    let mut parts = line.splitn(3, '|');
    let severity = Severity::parse(parts.next()?)?;
    let second = parts.next()?.trim();
    match parts.next() {
        Some(note) => {
            let (file, line) = parse_anchor(second);
            let note = note.trim();
            if note.is_empty() {
                return None;
            }
            Some(Finding {
                severity,
                file,
                line,
                note: note.to_string(),
            })
        }
        // Two fields only: treat the second as the rationale.
        None => {
            if second.is_empty() {
                return None;
            }
            Some(Finding {
                severity,
                file: None,
                line: None,
                note: second.to_string(),
            })
        }
    }
}

fn is_clean_marker(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    let lower = lower.trim_end_matches(['.', '!']).trim();
    lower == "none"
}

/// Extract findings from raw model output.
pub fn parse_model_output(text: &str) -> ChunkOutcome {
    let mut findings = Vec::new();
    let mut saw_clean_marker = false;

    for raw_line in text.lines() {
        let line = raw_line.trim().trim_start_matches(['-', '*', '•']).trim();
        if line.is_empty() {
            continue;
        }
        if is_clean_marker(line) {
            saw_clean_marker = true;
            continue;
        }
        if let Some(finding) = parse_finding_line(line) {
            findings.push(finding);
        }
    }

    if !findings.is_empty() {
        return ChunkOutcome::Findings(findings);
    }
    if saw_clean_marker {
        return ChunkOutcome::Findings(Vec::new());
    }

    let mut snippet: String = text.trim().chars().take(120).collect();
    if snippet.len() < text.trim().len() {
        snippet.push_str("...");
    }
    if snippet.is_empty() {
        snippet.push_str("empty output");
    }
    ChunkOutcome::ParseFailure { note: snippet }
}
