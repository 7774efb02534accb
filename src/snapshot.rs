use url::Url;

/// Metrics and chart markup captured from one successful profile fetch.
///
/// Lives for a single run: the fetcher builds it, the rewriter consumes it,
/// nothing persists it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CitationSnapshot {
    /// Total citation count; 0 when the page did not expose it.
    pub citations: u64,
    /// h-index; 0 when the page did not expose it.
    pub h_index: u64,
    /// i10-index; 0 when the page did not expose it.
    pub i10_index: u64,
    /// Sanitized chart markup, opaque to everything but the sanitizer.
    /// Empty when the profile page carried no chart container.
    pub chart: String,
    /// The mirror URL that produced this snapshot. Diagnostic only.
    pub source_url: Url,
}
