use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One changed file of a pull request, content taken at the head SHA.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: String,
    pub full_content: String,
    pub diff_hunks: Vec<DiffHunk>,
    pub language_hint: Option<String>,
}

impl ChangedFile {
    /// Rebuilds the unified diff text for prompt rendering.
    pub fn diff_text(&self) -> String {
        self.diff_hunks
            .iter()
            .map(DiffHunk::to_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffHunk {
    pub old_start: usize,
    pub old_lines: usize,
    pub new_start: usize,
    pub new_lines: usize,
    pub header: String,
    pub lines: Vec<DiffLine>,
}

impl DiffHunk {
    pub fn to_text(&self) -> String {
        let mut out = String::with_capacity(self.header.len() + self.lines.len() * 40);
        out.push_str(&self.header);
        for line in &self.lines {
            out.push('\n');
            out.push(match line.kind {
                LineKind::Added => '+',
                LineKind::Removed => '-',
                LineKind::Context => ' ',
            });
            out.push_str(&line.content);
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffLine {
    pub old_line_no: Option<usize>,
    pub new_line_no: Option<usize>,
    pub kind: LineKind,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LineKind {
    Added,
    Removed,
    Context,
}

/// Parses the `patch` text the GitHub files API returns for one file.
///
/// That text is a bare sequence of `@@` hunks with no file headers.
pub fn parse_patch(patch: &str) -> Result<Vec<DiffHunk>> {
    let lines: Vec<&str> = patch.lines().collect();
    let mut hunks = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        if lines[i].starts_with("@@") {
            hunks.push(parse_hunk(&lines, &mut i)?);
        } else {
            i += 1;
        }
    }

    Ok(hunks)
}

fn parse_hunk(lines: &[&str], i: &mut usize) -> Result<DiffHunk> {
    let header = lines[*i];
    let (old_start, old_lines, new_start, new_lines) = parse_hunk_header(header)?;
    *i += 1;

    let mut changes = Vec::new();
    let mut old_line = old_start;
    let mut new_line = new_start;

    while *i < lines.len() && !lines[*i].starts_with("@@") {
        let line = lines[*i];

        let (kind, content) = match line.chars().next() {
            Some('+') => (LineKind::Added, &line[1..]),
            Some('-') => (LineKind::Removed, &line[1..]),
            Some(' ') => (LineKind::Context, &line[1..]),
            Some('\\') => {
                // "\ No newline at end of file" markers carry no line
                *i += 1;
                continue;
            }
            _ => (LineKind::Context, line),
        };

        let diff_line = match kind {
            LineKind::Added => {
                let line_no = new_line;
                new_line += 1;
                DiffLine {
                    old_line_no: None,
                    new_line_no: Some(line_no),
                    kind,
                    content: content.to_string(),
                }
            }
            LineKind::Removed => {
                let line_no = old_line;
                old_line += 1;
                DiffLine {
                    old_line_no: Some(line_no),
                    new_line_no: None,
                    kind,
                    content: content.to_string(),
                }
            }
            LineKind::Context => {
                let old_no = old_line;
                let new_no = new_line;
                old_line += 1;
                new_line += 1;
                DiffLine {
                    old_line_no: Some(old_no),
                    new_line_no: Some(new_no),
                    kind,
                    content: content.to_string(),
                }
            }
        };

        changes.push(diff_line);
        *i += 1;
    }

    Ok(DiffHunk {
        old_start,
        old_lines,
        new_start,
        new_lines,
        header: header.to_string(),
        lines: changes,
    })
}

fn parse_hunk_header(header: &str) -> Result<(usize, usize, usize, usize)> {
    let re = regex::Regex::new(r"@@ -(\d+),?(\d*) \+(\d+),?(\d*) @@")?;
    let caps = re
        .captures(header)
        .ok_or_else(|| anyhow::anyhow!("invalid hunk header: {}", header))?;

    let old_start = caps.get(1).map_or("1", |m| m.as_str()).parse()?;
    let old_lines = caps.get(2).map_or(1, |m| m.as_str().parse().unwrap_or(1));
    let new_start = caps.get(3).map_or("1", |m| m.as_str()).parse()?;
    let new_lines = caps.get(4).map_or(1, |m| m.as_str().parse().unwrap_or(1));

    Ok((old_start, old_lines, new_start, new_lines))
}

const LANGUAGE_EXTENSIONS: &[(&str, &[&str])] = &[
    ("rust", &["rs"]),
    ("typescript", &["ts", "tsx"]),
    ("javascript", &["js", "jsx", "mjs"]),
    ("python", &["py", "pyi"]),
    ("go", &["go"]),
    ("java", &["java"]),
    ("kotlin", &["kt"]),
    ("c", &["c", "h"]),
    ("cpp", &["cc", "cpp", "cxx", "hpp"]),
    ("csharp", &["cs"]),
    ("ruby", &["rb"]),
    ("php", &["php"]),
    ("shell", &["sh", "bash"]),
    ("yaml", &["yml", "yaml"]),
    ("markdown", &["md"]),
];

pub fn language_hint(path: &str) -> Option<String> {
    let extension = Path::new(path).extension().and_then(|ext| ext.to_str())?;
    let extension = extension.to_lowercase();
    LANGUAGE_EXTENSIONS
        .iter()
        .find(|(_, exts)| exts.contains(&extension.as_str()))
        .map(|(language, _)| (*language).to_string())
}
