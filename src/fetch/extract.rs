//! Pulls the citation metrics and chart fragment out of a raw profile page.
//!
//! Everything here works on the page as one string. The cell patterns are
//! anchored on the label text rather than on document structure, so a page
//! that drops a metric simply yields 0 for it instead of failing the fetch.

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::snapshot::CitationSnapshot;

static CITATIONS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)Citations</a></td><td class="gsc_rsb_std">(\d+)</td>"#).unwrap()
});
static H_INDEX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)h-index</a></td><td class="gsc_rsb_std">(\d+)</td>"#).unwrap()
});
static I10_INDEX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)i10-index</a></td><td class="gsc_rsb_std">(\d+)</td>"#).unwrap()
});

/// The chart lives in the `gsc_rsb_cit` panel; its end is marked by the next
/// sibling panel's start tag.
static CHART_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?is)<div class="gsc_rsb_s gsc_prf_pnl" id="gsc_rsb_cit"[^>]*>(.*?)</div><div class="gsc_rsb_s gsc_prf_pnl""#,
    )
    .unwrap()
});

static HEADING_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<h3[^>]*>.*?</h3>").unwrap());
static DETAIL_TABLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<table[^>]*>.*?</table>").unwrap());

/// The decorative no-break-space marker shows up inside CSS `content` rules
/// as `A0` wrapped in any mix of whitespace, control bytes, or other
/// non-printable characters, depending on how the page was served.
static MARKER_RULE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"content:\s*"(?:\s|[^\x20-\x7E])*A0(?:\s|[^\x20-\x7E])*";?"#).unwrap()
});
/// Same marker as a literal backslash escape in inline styles.
static MARKER_ESCAPE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\\00A0").unwrap());

/// Scrape one fetched page into a snapshot. Missing pieces become defaults,
/// never errors.
pub fn snapshot_from_page(html: &str, source_url: Url) -> CitationSnapshot {
    let chart = CHART_RE
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| sanitize_chart(m.as_str()))
        .unwrap_or_default();

    CitationSnapshot {
        citations: metric(html, &CITATIONS_RE),
        h_index: metric(html, &H_INDEX_RE),
        i10_index: metric(html, &I10_INDEX_RE),
        chart,
        source_url,
    }
}

fn metric(html: &str, re: &Regex) -> u64 {
    re.captures(html)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// Strip the per-request pieces out of the raw chart markup: the heading and
/// detail table vary between fetches and are not wanted in the target page,
/// and the no-break-space marker must vanish in every encoding it takes.
pub fn sanitize_chart(raw: &str) -> String {
    let cleaned = HEADING_RE.replace_all(raw, "");
    let cleaned = DETAIL_TABLE_RE.replace_all(&cleaned, "");
    let cleaned = MARKER_RULE_RE.replace_all(&cleaned, r#"content:"";"#);
    let cleaned = MARKER_ESCAPE_RE.replace_all(&cleaned, "");
    cleaned.replace("&nbsp;", "").replace('\u{a0}', "")
}
