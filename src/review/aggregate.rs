use crate::review::verdict::{FileVerdict, PullRequestVerdict, Rating};

/// Folds per-file verdicts into one pull request verdict.
///
/// The overall rating is the worst file rating and does not depend on
/// input order. The digest groups files by rating, keeping the fetch
/// order within each group.
pub fn aggregate(pull_number: u64, verdicts: Vec<FileVerdict>) -> PullRequestVerdict {
    let overall_rating = verdicts
        .iter()
        .map(|v| v.rating)
        .max()
        .unwrap_or(Rating::Good);
    let summary_text = render_summary(&verdicts, overall_rating);
    let per_file = verdicts.into_iter().map(|v| (v.path.clone(), v)).collect();

    PullRequestVerdict {
        pull_number,
        overall_rating,
        summary_text,
        per_file,
    }
}

fn render_summary(verdicts: &[FileVerdict], overall: Rating) -> String {
    if verdicts.is_empty() {
        return format!(
            "No reviewable files in this pull request.\n\n### Rating: {}\n",
            Rating::Good.as_str()
        );
    }

    let mut out = String::from("### Review Summary\n");

    for rating in [Rating::Bad, Rating::NeedsTriage, Rating::Good] {
        let group: Vec<&FileVerdict> = verdicts.iter().filter(|v| v.rating == rating).collect();
        if group.is_empty() {
            continue;
        }

        out.push_str(&format!("\n#### {}\n", rating.as_str()));
        for verdict in group {
            if verdict.findings.is_empty() {
                out.push_str(&format!("- **{}**: no findings\n", verdict.path));
                continue;
            }

            out.push_str(&format!(
                "- **{}**: {} finding(s)\n",
                verdict.path,
                verdict.findings.len()
            ));
            for finding in &verdict.findings {
                match finding.line_ref {
                    Some(line) => {
                        out.push_str(&format!("  - Line {}: {}\n", line, finding.message))
                    }
                    None => out.push_str(&format!("  - {}\n", finding.message)),
                }
            }
        }
    }

    out.push_str(&format!("\n### Rating: {}\n", overall.as_str()));
    out
}
