use std::fmt;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use ureq::tls::TlsConfig;
use url::Url;

use crate::snapshot::CitationSnapshot;

pub mod extract;

/// Mirror hosts tried in order when none are configured.
///
/// NOTE: Ordering is priority. The first mirror to return a usable page
/// wins and the rest are never contacted.
pub const DEFAULT_MIRRORS: &[&str] = &["scholar.google.com", "scholar.google.co.in"];

/// Browser identities rotated per attempt so repeated runs don't present a
/// constant fingerprint.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.10 Safari/605.1.1",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

/// What one fetch run needs to know. Built from CLI arguments.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub user: String,
    pub lang: String,
    pub mirrors: Vec<String>,
    /// Upper bound in seconds for the randomized pre-request pause; 0 disables it.
    pub max_delay: u64,
}

/// Why a single mirror attempt failed.
#[derive(Debug)]
pub enum MirrorError {
    /// The mirror answered 403. On this service that means the request was
    /// taken for automated traffic, so the caller should expect every retry
    /// against the same host to fail for a while.
    Blocked { host: String },
    /// Anything else: DNS, connect, TLS, timeout, non-403 status, body read.
    Network { host: String, source: anyhow::Error },
}

impl fmt::Display for MirrorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorError::Blocked { host } => {
                write!(f, "{host} answered 403 (rate limited or blocked)")
            }
            MirrorError::Network { host, source } => {
                write!(f, "{host} unreachable: {source:#}")
            }
        }
    }
}

impl std::error::Error for MirrorError {}

/// Try each configured mirror in order and return the first snapshot.
///
/// Per-mirror failures are reported to stderr and swallowed; exhausting the
/// list yields `None` rather than an error, matching the contract that a
/// failed fetch is a reportable outcome, not a crash.
pub fn fetch_snapshot(opts: &FetchOptions) -> Option<CitationSnapshot> {
    let agent = build_agent();
    for host in &opts.mirrors {
        let spinner = attempt_spinner(host);
        let outcome = fetch_mirror(&agent, host, opts);
        spinner.finish_and_clear();
        match outcome {
            Ok(snapshot) => return Some(snapshot),
            Err(err @ MirrorError::Blocked { .. }) => {
                eprintln!("{} {err}; moving on to the next mirror", "!".yellow());
            }
            Err(err) => {
                eprintln!("{} {err}", "✗".red());
            }
        }
    }
    None
}

/// One GET against one mirror, decompressed and scraped into a snapshot.
fn fetch_mirror(
    agent: &ureq::Agent,
    host: &str,
    opts: &FetchOptions,
) -> Result<CitationSnapshot, MirrorError> {
    let url = profile_url(host, &opts.user, &opts.lang)
        .map_err(|e| network(host, e))?;

    if opts.max_delay > 0 {
        // Jitter so periodic invocations don't land on the exact same schedule.
        let pause = fastrand::u64(1..=opts.max_delay * 1000);
        thread::sleep(Duration::from_millis(pause));
    }

    let response = agent
        .get(url.as_str())
        .header("User-Agent", USER_AGENTS[fastrand::usize(..USER_AGENTS.len())])
        .header(
            "Accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
        )
        .header("Accept-Language", opts.lang.as_str())
        .call()
        .map_err(|e| classify(host, e))?;

    let raw = response
        .into_body()
        .read_to_vec()
        .map_err(|e| classify(host, e))?;
    let bytes = inflate(raw).map_err(|e| network(host, e))?;
    let html = String::from_utf8_lossy(&bytes);

    Ok(extract::snapshot_from_page(&html, url))
}

fn network(host: &str, source: anyhow::Error) -> MirrorError {
    MirrorError::Network {
        host: host.to_string(),
        source,
    }
}

fn classify(host: &str, err: ureq::Error) -> MirrorError {
    match err {
        ureq::Error::StatusCode(403) => MirrorError::Blocked {
            host: host.to_string(),
        },
        other => network(host, anyhow::Error::new(other)),
    }
}

/// Build the profile URL for one mirror. Bare values get the https scheme;
/// a mirror given with an explicit scheme is used as-is.
fn profile_url(host: &str, user: &str, lang: &str) -> anyhow::Result<Url> {
    let base = if host.contains("://") {
        format!("{}/citations", host.trim_end_matches('/'))
    } else {
        format!("https://{host}/citations")
    };
    let mut url =
        Url::parse(&base).with_context(|| format!("invalid mirror host {host}"))?;
    url.query_pairs_mut()
        .append_pair("user", user)
        .append_pair("hl", lang);
    Ok(url)
}

fn build_agent() -> ureq::Agent {
    // Certificate verification stays off for parity with the mirrors, some
    // of which front regional hosts with mismatched certificates.
    let tls = TlsConfig::builder().disable_verification(true).build();
    let config = ureq::Agent::config_builder()
        .timeout_connect(Some(Duration::from_secs(10)))
        .timeout_global(Some(Duration::from_secs(30)))
        .tls_config(tls)
        .build();
    ureq::Agent::new_with_config(config)
}

/// Undo gzip/zlib framing by sniffing magic bytes. Some mirrors compress
/// without announcing it in `Content-Encoding`, so the header is never
/// consulted.
fn inflate(raw: Vec<u8>) -> anyhow::Result<Vec<u8>> {
    use std::io::Read;

    use flate2::read::{GzDecoder, ZlibDecoder};

    if raw.starts_with(&[0x1f, 0x8b]) {
        let mut out = Vec::new();
        GzDecoder::new(raw.as_slice())
            .read_to_end(&mut out)
            .context("gzip body would not inflate")?;
        return Ok(out);
    }
    if raw.len() >= 2 && raw[0] == 0x78 && matches!(raw[1], 0x01 | 0x5e | 0x9c | 0xda) {
        let mut out = Vec::new();
        ZlibDecoder::new(raw.as_slice())
            .read_to_end(&mut out)
            .context("zlib body would not inflate")?;
        return Ok(out);
    }
    Ok(raw)
}

fn attempt_spinner(host: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(ProgressStyle::with_template("{spinner} {msg}").unwrap());
    bar.enable_steady_tick(Duration::from_millis(120));
    bar.set_message(format!("querying {host}"));
    bar
}
