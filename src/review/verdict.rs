use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Review rating for a file or a whole pull request, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Rating {
    Good,
    NeedsTriage,
    Bad,
}

impl Rating {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rating::Good => "GOOD",
            Rating::NeedsTriage => "NEEDS FURTHER TRIAGE",
            Rating::Bad => "BAD",
        }
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FindingSeverity {
    Error,
    Warning,
    Info,
    Suggestion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub line_ref: Option<u32>,
    pub message: String,
    pub severity: FindingSeverity,
}

impl Finding {
    pub fn new(line_ref: Option<u32>, message: impl Into<String>) -> Self {
        let message = message.into();
        let severity = determine_severity(&message);
        Finding {
            line_ref,
            message,
            severity,
        }
    }
}

/// Structured result extracted from one model response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelVerdict {
    pub rating: Rating,
    pub findings: Vec<Finding>,
    pub raw_output: String,
}

static RATING_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^\s*(?:overall\s+)?(?:rating|verdict)\b[:\s\-]*(.+)$").unwrap());
static BAD_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bBAD\b").unwrap());
static TRIAGE_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bNEEDS[\s_](?:FURTHER\s+)?TRIAGE\b").unwrap()
});
static GOOD_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bGOOD\b").unwrap());
static LINE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)line\s+(\d+):\s*(.+)").unwrap());

impl ModelVerdict {
    /// Extracts a rating and findings from free-form model text.
    ///
    /// A `Rating:` style line wins when it carries a recognizable token;
    /// otherwise the whole text is scanned and the worst token found wins.
    /// Text with no recognizable token is never treated as clean.
    pub fn parse(raw: &str) -> Self {
        let rating = RATING_LINE
            .captures(raw)
            .and_then(|caps| scan_rating_tokens(caps.get(1).map_or("", |m| m.as_str())))
            .or_else(|| scan_rating_tokens(raw))
            .unwrap_or(Rating::NeedsTriage);

        ModelVerdict {
            rating,
            findings: extract_findings(raw),
            raw_output: raw.to_string(),
        }
    }
}

fn scan_rating_tokens(text: &str) -> Option<Rating> {
    if BAD_TOKEN.is_match(text) {
        Some(Rating::Bad)
    } else if TRIAGE_TOKEN.is_match(text) {
        Some(Rating::NeedsTriage)
    } else if GOOD_TOKEN.is_match(text) {
        Some(Rating::Good)
    } else {
        None
    }
}

fn extract_findings(content: &str) -> Vec<Finding> {
    let mut findings = Vec::new();
    let mut in_fence = false;

    for line in content.lines() {
        let trimmed = line.trim();

        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }

        if in_fence
            || trimmed.is_empty()
            || trimmed.starts_with('#')
            || trimmed.starts_with('<')
            || trimmed.contains("Here are")
            || trimmed.contains("Here is")
        {
            continue;
        }

        if let Some(caps) = LINE_PATTERN.captures(line) {
            let line_ref = caps.get(1).and_then(|m| m.as_str().parse().ok());
            let message = caps.get(2).map_or("", |m| m.as_str()).trim();
            if !message.is_empty() {
                findings.push(Finding::new(line_ref, message));
            }
        }
    }

    findings
}

fn determine_severity(message: &str) -> FindingSeverity {
    let lower = message.to_lowercase();
    if lower.contains("error") || lower.contains("critical") || lower.contains("vulnerab") {
        FindingSeverity::Error
    } else if lower.contains("warning") || lower.contains("issue") || lower.contains("bug") {
        FindingSeverity::Warning
    } else if lower.contains("consider") || lower.contains("suggest") {
        FindingSeverity::Suggestion
    } else {
        FindingSeverity::Info
    }
}

/// Final review outcome for one changed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileVerdict {
    pub path: String,
    pub rating: Rating,
    pub findings: Vec<Finding>,
    pub raw_model_output: String,
}

impl FileVerdict {
    /// Verdict for a file the pipeline could not review. Always triaged,
    /// never clean, with a single finding explaining the failure.
    pub fn unreviewed(path: impl Into<String>, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        FileVerdict {
            path: path.into(),
            rating: Rating::NeedsTriage,
            findings: vec![Finding {
                line_ref: None,
                message: reason,
                severity: FindingSeverity::Warning,
            }],
            raw_model_output: String::new(),
        }
    }
}

/// Aggregated outcome for one pull request at one head SHA.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestVerdict {
    pub pull_number: u64,
    pub overall_rating: Rating,
    pub summary_text: String,
    pub per_file: BTreeMap<String, FileVerdict>,
}
