//! Rewrites the target page in place from a fetched snapshot.
//!
//! The core is pure: `rewrite_document` maps old text to new text or to a
//! typed refusal. File plumbing (backup, temp-and-rename commit) sits on top
//! in `apply_to_file`, so the visible file is either fully updated or left
//! byte-identical.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Local;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::snapshot::CitationSnapshot;

/// The summary shape: the leading publication count is the author's own and
/// is preserved verbatim; only the three fetched metrics are substituted.
static SUMMARY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\((\d+\+) publications, \d+\+ citations, h-index: \d+, i-10 index: \d+\)")
        .unwrap()
});

/// Loose chart boundary, used only when the depth scan fails to balance:
/// the panel historically ends at a run of four closing divs.
static CHART_FALLBACK_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?is)(<div class="gsc_rsb_s gsc_prf_pnl" id="gsc_rsb_cit"[^>]*>).*?(</div></div></div></div>)"#,
    )
    .unwrap()
});

/// The chart container is located by this attribute, which is unique in the
/// target page.
const CHART_ANCHOR: &str = r#"id="gsc_rsb_cit""#;

/// Why the whole rewrite was refused. No partial state is ever written.
#[derive(Debug)]
pub enum RewriteError {
    /// Neither the summary pattern nor the chart container matched.
    MarkersNotFound,
    /// The size change tripped the corruption guard.
    SafetyAbort {
        old_len: usize,
        new_len: usize,
        delta_pct: f64,
        threshold_pct: f64,
    },
}

impl fmt::Display for RewriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RewriteError::MarkersNotFound => {
                write!(f, "no citation summary or chart container found in target")
            }
            RewriteError::SafetyAbort {
                old_len,
                new_len,
                delta_pct,
                threshold_pct,
            } => write!(
                f,
                "size change {delta_pct:.2}% ({old_len} -> {new_len} chars) is at or above the {threshold_pct:.2}% guard"
            ),
        }
    }
}

impl std::error::Error for RewriteError {}

/// How the chart region fared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartOutcome {
    /// Inner content swapped inside the balanced container.
    Spliced,
    /// Depth scan would not balance; the loose boundary matched instead.
    SplicedLoose,
    /// Snapshot carried no fragment, region left alone.
    NoFragment,
    /// Neither boundary strategy matched; region left alone, summary still counts.
    NotFound,
}

/// A successful rewrite: the new text plus what was touched.
#[derive(Debug)]
pub struct Rewrite {
    pub text: String,
    pub summaries_replaced: usize,
    pub chart: ChartOutcome,
}

/// A committed rewrite, with the backup that preceded it.
#[derive(Debug)]
pub struct Applied {
    pub rewrite: Rewrite,
    pub backup_path: PathBuf,
}

/// Produce the updated document text, or refuse.
///
/// Every occurrence of the summary is replaced with the same three metrics;
/// the chart container's inner content is swapped for the snapshot's
/// fragment. The result is only returned when at least one region was
/// updated and the length delta stays under the threshold.
pub fn rewrite_document(
    original: &str,
    snapshot: &CitationSnapshot,
    threshold_pct: f64,
) -> Result<Rewrite, RewriteError> {
    let mut summaries_replaced = 0usize;
    let replaced = SUMMARY_RE.replace_all(original, |caps: &Captures| {
        summaries_replaced += 1;
        format!(
            "({} publications, {}+ citations, h-index: {}, i-10 index: {})",
            &caps[1], snapshot.citations, snapshot.h_index, snapshot.i10_index
        )
    });

    let (text, chart) = if snapshot.chart.is_empty() {
        (replaced.into_owned(), ChartOutcome::NoFragment)
    } else {
        splice_chart(&replaced, &snapshot.chart)
    };

    if summaries_replaced == 0 && !matches!(chart, ChartOutcome::Spliced | ChartOutcome::SplicedLoose)
    {
        return Err(RewriteError::MarkersNotFound);
    }

    let old_len = original.chars().count();
    let new_len = text.chars().count();
    let delta_pct = if old_len == 0 {
        0.0
    } else {
        new_len.abs_diff(old_len) as f64 * 100.0 / old_len as f64
    };
    if delta_pct >= threshold_pct {
        return Err(RewriteError::SafetyAbort {
            old_len,
            new_len,
            delta_pct,
            threshold_pct,
        });
    }

    Ok(Rewrite {
        text,
        summaries_replaced,
        chart,
    })
}

/// Rewrite `path` in place: read, transform, back up, commit.
///
/// The backup copy is only made once the rewrite is known to be safe, and
/// the new text lands via a sibling temp file renamed over the original.
pub fn apply_to_file(
    path: &Path,
    snapshot: &CitationSnapshot,
    threshold_pct: f64,
) -> anyhow::Result<Applied> {
    let original = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let rewrite = rewrite_document(&original, snapshot, threshold_pct)?;

    let backup_path = backup_path_for(path);
    fs::copy(path, &backup_path)
        .with_context(|| format!("failed to write backup {}", backup_path.display()))?;

    let tmp_path = sibling_with_suffix(path, ".new");
    fs::write(&tmp_path, rewrite.text.as_bytes())
        .with_context(|| format!("failed to stage {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to commit {}", path.display()))?;

    Ok(Applied {
        rewrite,
        backup_path,
    })
}

/// Swap the chart container's inner content for `fragment`, keeping the
/// container's own opening tag and matching closing tag.
fn splice_chart(text: &str, fragment: &str) -> (String, ChartOutcome) {
    if let Some((inner_start, close_start)) = chart_bounds(text) {
        let mut out = String::with_capacity(text.len() + fragment.len());
        out.push_str(&text[..inner_start]);
        out.push_str(fragment);
        out.push_str(&text[close_start..]);
        return (out, ChartOutcome::Spliced);
    }

    if CHART_FALLBACK_RE.is_match(text) {
        let out = CHART_FALLBACK_RE
            .replace(text, |caps: &Captures| {
                format!("{}{}{}", &caps[1], fragment, &caps[2])
            })
            .into_owned();
        return (out, ChartOutcome::SplicedLoose);
    }

    (text.to_string(), ChartOutcome::NotFound)
}

/// Find the container's inner span: byte offsets of the first char after
/// its opening tag and of its matching `</div>`.
///
/// Balancing nested divs is done with an explicit depth counter rather than
/// a pattern, since the inner markup nests arbitrarily.
fn chart_bounds(text: &str) -> Option<(usize, usize)> {
    let anchor = text.find(CHART_ANCHOR)?;
    let tag_start = text[..anchor].rfind("<div")?;
    // The attribute must sit inside that tag, not a later one.
    if text[tag_start..anchor].contains('>') {
        return None;
    }
    let open_end = tag_start + text[tag_start..].find('>')? + 1;

    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut i = tag_start;
    while i < bytes.len() {
        if is_open_div(bytes, i) {
            depth += 1;
            i += 4;
        } else if bytes[i..].starts_with(b"</div>") {
            if depth == 0 {
                return None;
            }
            depth -= 1;
            if depth == 0 {
                return Some((open_end, i));
            }
            i += 6;
        } else {
            i += 1;
        }
    }
    None
}

fn is_open_div(bytes: &[u8], i: usize) -> bool {
    bytes[i..].starts_with(b"<div")
        && matches!(bytes.get(i + 4), Some(b' ' | b'\t' | b'\n' | b'\r' | b'>'))
}

fn backup_path_for(path: &Path) -> PathBuf {
    let stamp = Local::now().format("%Y-%m-%d-%H-%M-%S");
    sibling_with_suffix(path, &format!(".backup.{stamp}"))
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;

    fn snap(citations: u64, h_index: u64, i10_index: u64, chart: &str) -> CitationSnapshot {
        CitationSnapshot {
            citations,
            h_index,
            i10_index,
            chart: chart.to_string(),
            source_url: Url::parse("https://scholar.google.com/citations?user=x&hl=en")
                .unwrap(),
        }
    }

    /// Filler so small edits stay inside the default 2% guard.
    fn padded(body: &str) -> String {
        format!("<html><body>{body}{}</body></html>", "<p>filler</p>".repeat(400))
    }

    const SUMMARY: &str = "(12+ publications, 340+ citations, h-index: 9, i-10 index: 7)";

    const CHART_DIV: &str = concat!(
        r#"<div class="gsc_rsb_s gsc_prf_pnl" id="gsc_rsb_cit" role="region">"#,
        r#"<div class="gsc_md_hist_b"><div class="bar">old</div></div>"#,
        r#"</div>"#,
    );

    #[test]
    fn substitutes_metrics_and_preserves_publication_token() {
        let doc = padded(SUMMARY);
        let out = rewrite_document(&doc, &snap(365, 10, 8, ""), 2.0).expect("rewrite");
        assert!(out
            .text
            .contains("(12+ publications, 365+ citations, h-index: 10, i-10 index: 8)"));
        assert!(!out.text.contains("340+"));
        assert_eq!(out.summaries_replaced, 1);
        assert_eq!(out.chart, ChartOutcome::NoFragment);
    }

    #[test]
    fn replaces_every_summary_occurrence_identically() {
        proptest::proptest!(|(n in 1usize..8, first_pub in 1u64..500, second_pub in 1u64..500)| {
            let mut body = String::new();
            for i in 0..n {
                let pubs = if i % 2 == 0 { first_pub } else { second_pub };
                body.push_str(&format!(
                    "<p>({pubs}+ publications, 340+ citations, h-index: 9, i-10 index: 7)</p>"
                ));
            }
            let doc = padded(&body);
            let out = rewrite_document(&doc, &snap(365, 10, 8, ""), 50.0).expect("rewrite");
            proptest::prop_assert_eq!(out.summaries_replaced, n);
            // Old metric values are gone, each publication token survives.
            proptest::prop_assert!(!out.text.contains("340+ citations"));
            proptest::prop_assert_eq!(
                out.text.matches("365+ citations, h-index: 10, i-10 index: 8").count(),
                n
            );
            proptest::prop_assert!(out.text.contains(&format!("({first_pub}+ publications")), "publications token did not survive rewrite");
        })
    }

    #[test]
    fn rewrite_is_idempotent() {
        let doc = padded(&format!("{SUMMARY}{CHART_DIV}"));
        let fragment = r#"<div class="gsc_md_hist_b"><div class="bar">new</div></div>"#;
        let snapshot = snap(365, 10, 8, fragment);
        let once = rewrite_document(&doc, &snapshot, 10.0).expect("first pass");
        let twice = rewrite_document(&once.text, &snapshot, 10.0).expect("second pass");
        assert_eq!(once.text, twice.text);
    }

    #[test]
    fn chart_splice_preserves_container_structure() {
        let doc = padded(&format!("{SUMMARY}{CHART_DIV}"));
        let fragment = r#"<div class="gsc_md_hist_b"><div class="bar">new</div></div>"#;
        let out = rewrite_document(&doc, &snap(365, 10, 8, fragment), 10.0).expect("rewrite");
        assert_eq!(out.chart, ChartOutcome::Spliced);
        let expected = format!(
            r#"<div class="gsc_rsb_s gsc_prf_pnl" id="gsc_rsb_cit" role="region">{fragment}</div>"#
        );
        assert!(out.text.contains(&expected), "container mangled: {}", out.text);
        assert!(!out.text.contains("old"));
    }

    #[test]
    fn chart_splice_balances_nested_divs() {
        let nested = concat!(
            r#"<div class="gsc_rsb_s gsc_prf_pnl" id="gsc_rsb_cit">"#,
            r#"<div a="1"><div b="2">deep</div><div c="3">deep</div></div>"#,
            r#"</div><div class="after">tail</div>"#,
        );
        let doc = padded(&format!("{SUMMARY}{nested}"));
        let out = rewrite_document(&doc, &snap(1, 2, 3, "<span>flat</span>"), 10.0)
            .expect("rewrite");
        assert_eq!(out.chart, ChartOutcome::Spliced);
        assert!(out.text.contains(
            r#"<div class="gsc_rsb_s gsc_prf_pnl" id="gsc_rsb_cit"><span>flat</span></div><div class="after">tail</div>"#
        ));
    }

    #[test]
    fn chart_splice_falls_back_to_loose_boundary() {
        // Five opens against four closes never balance, so the depth scan
        // gives up; the four-close run still bounds the region loosely.
        let unbalanced = concat!(
            r#"<div class="gsc_rsb_s gsc_prf_pnl" id="gsc_rsb_cit" role="region">"#,
            r#"<div a="1"><div b="2"><div c="3"><div d="4"><div e="5">old bars"#,
            r#"</div></div></div></div>"#,
        );
        let doc = padded(unbalanced);
        let out = rewrite_document(&doc, &snap(1, 2, 3, "<span>flat</span>"), 10.0)
            .expect("rewrite");
        assert_eq!(out.chart, ChartOutcome::SplicedLoose);
        assert!(out.text.contains(
            r#"id="gsc_rsb_cit" role="region"><span>flat</span></div></div></div></div>"#
        ));
    }

    #[test]
    fn chart_not_found_is_reported_but_summary_still_applies() {
        let doc = padded(SUMMARY);
        let out = rewrite_document(&doc, &snap(365, 10, 8, "<span>x</span>"), 10.0)
            .expect("rewrite");
        assert_eq!(out.chart, ChartOutcome::NotFound);
        assert_eq!(out.summaries_replaced, 1);
    }

    #[test]
    fn refuses_document_without_any_marker() {
        let doc = padded("<p>nothing to see</p>");
        match rewrite_document(&doc, &snap(1, 2, 3, ""), 2.0) {
            Err(RewriteError::MarkersNotFound) => {}
            other => panic!("expected MarkersNotFound, got {other:?}"),
        }
    }

    #[test]
    fn refuses_size_change_at_or_above_threshold() {
        let doc = format!("<html>{SUMMARY}{CHART_DIV}</html>");
        // Tiny document: a large fragment blows well past 2% of its length.
        let big_fragment = "<span>bars</span>".repeat(50);
        match rewrite_document(&doc, &snap(365, 10, 8, &big_fragment), 2.0) {
            Err(RewriteError::SafetyAbort {
                delta_pct,
                threshold_pct,
                ..
            }) => {
                assert!(delta_pct >= threshold_pct);
            }
            other => panic!("expected SafetyAbort, got {other:?}"),
        }
    }

    #[test]
    fn accepts_size_change_below_threshold() {
        let doc = padded(&format!("{SUMMARY}{CHART_DIV}"));
        let fragment = r#"<div class="gsc_md_hist_b"><div class="bar">new</div></div>"#;
        assert!(rewrite_document(&doc, &snap(365, 10, 8, fragment), 2.0).is_ok());
    }

    #[test]
    fn zero_threshold_refuses_even_a_no_op() {
        let doc = padded(SUMMARY);
        match rewrite_document(&doc, &snap(340, 9, 7, ""), 0.0) {
            Err(RewriteError::SafetyAbort { .. }) => {}
            other => panic!("expected SafetyAbort, got {other:?}"),
        }
    }

    mod file {
        use super::*;

        #[test]
        fn commits_update_and_leaves_backup() {
            let dir = tempfile::tempdir().expect("tempdir");
            let target = dir.path().join("index.html");
            fs::write(&target, padded(SUMMARY)).expect("seed");

            let applied = apply_to_file(&target, &snap(365, 10, 8, ""), 2.0).expect("apply");

            let updated = fs::read_to_string(&target).expect("read back");
            assert!(updated.contains("365+ citations"));
            assert!(applied
                .backup_path
                .file_name()
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("index.html.backup."));
            let backup = fs::read_to_string(&applied.backup_path).expect("backup");
            assert!(backup.contains("340+ citations"));
        }

        #[test]
        fn refused_rewrite_leaves_file_and_makes_no_backup() {
            let dir = tempfile::tempdir().expect("tempdir");
            let target = dir.path().join("index.html");
            let seed = padded("<p>no markers here</p>");
            fs::write(&target, &seed).expect("seed");

            let err = apply_to_file(&target, &snap(365, 10, 8, ""), 2.0).unwrap_err();
            assert!(err.downcast_ref::<RewriteError>().is_some());

            assert_eq!(fs::read_to_string(&target).expect("read back"), seed);
            let leftovers: Vec<_> = fs::read_dir(dir.path())
                .expect("dir")
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|n| n != "index.html")
                .collect();
            assert!(leftovers.is_empty(), "unexpected files: {leftovers:?}");
        }
    }
}
