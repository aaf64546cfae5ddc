/// Best-effort evidence snapshot of a reported target.
///
/// The target is untrusted: it may be unresponsive, hostile, or not a URL at
/// all (wallet addresses are reported too). A snapshot therefore never fails.
/// Any problem yields an empty [`Snapshot`] and the pipeline continues with
/// less evidence.
use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::redirect::Policy;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AnchorError, Result};

/// Appended to a body that was cut at the byte budget.
pub const TRUNCATION_MARKER: &str = "...[truncated]";

/// Default body budget (8 KiB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024;

/// Response headers kept as evidence.
pub const CAPTURED_HEADERS: &[&str] = &[
    "content-type",
    "content-length",
    "content-security-policy",
    "date",
    "last-modified",
    "location",
    "server",
    "set-cookie",
    "strict-transport-security",
    "x-frame-options",
    "x-powered-by",
];

const MAX_REDIRECTS: usize = 10;

/// Transport-level evidence for a target. All fields empty on failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub http_status: Option<u16>,
    pub headers: BTreeMap<String, String>,
    /// `[original, final]` when the fetch succeeded.
    pub redirect_chain: Vec<String>,
    /// Body truncated to the byte budget.
    pub body: Option<String>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.http_status.is_none() && self.body.is_none()
    }
}

/// Source of evidence snapshots.
#[async_trait]
pub trait EvidenceSource: Send + Sync {
    /// Capture the target. Never fails; see module docs.
    async fn capture(&self, target: &str) -> Snapshot;

    /// Longest a capture may take.
    fn time_budget(&self) -> Duration;
}

/// Truncate `text` to at most `budget` bytes plus [`TRUNCATION_MARKER`].
///
/// Text within budget is returned verbatim. The cut backs off to the nearest
/// char boundary. Re-truncating an already truncated string is a no-op.
pub fn truncate_text(text: &str, budget: usize) -> String {
    if text.len() <= budget || is_truncated(text, budget) {
        return text.to_string();
    }
    let mut cut = budget;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{TRUNCATION_MARKER}", &text[..cut])
}

fn is_truncated(text: &str, budget: usize) -> bool {
    text.strip_suffix(TRUNCATION_MARKER)
        .is_some_and(|head| head.len() <= budget)
}

/// Snapshotter that performs a single HTTP GET, following redirects.
pub struct HttpSnapshotter {
    client: Client,
    timeout: Duration,
    max_body_bytes: usize,
}

impl HttpSnapshotter {
    pub fn new(timeout: Duration, max_body_bytes: usize) -> Result<Self> {
        let client = Client::builder()
            .redirect(Policy::limited(MAX_REDIRECTS))
            .timeout(timeout)
            .user_agent(concat!("phishblock-anchor/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AnchorError::Http(format!("Snapshot client build failed: {e}")))?;

        Ok(Self {
            client,
            timeout,
            max_body_bytes,
        })
    }

    async fn fetch(&self, url: Url) -> Result<Snapshot> {
        let original = url.to_string();
        let mut resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AnchorError::Http(e.to_string()))?;

        let status = resp.status().as_u16();
        let final_url = resp.url().to_string();
        let headers = resp
            .headers()
            .iter()
            .filter(|(name, _)| CAPTURED_HEADERS.contains(&name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        // Read a few bytes past the budget so a cut mid-character still
        // leaves the budgeted prefix intact.
        let read_limit = self.max_body_bytes + 4;
        let mut buf = Vec::new();
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| AnchorError::Http(e.to_string()))?
        {
            buf.extend_from_slice(&chunk);
            if buf.len() > read_limit {
                break;
            }
        }

        let text = String::from_utf8_lossy(&buf);
        Ok(Snapshot {
            http_status: Some(status),
            headers,
            redirect_chain: vec![original, final_url],
            body: Some(truncate_text(&text, self.max_body_bytes)),
        })
    }
}

#[async_trait]
impl EvidenceSource for HttpSnapshotter {
    fn time_budget(&self) -> Duration {
        self.timeout
    }

    async fn capture(&self, target: &str) -> Snapshot {
        let url = match Url::parse(target.trim()) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => url,
            _ => {
                debug!(target = %target, "Target is not an HTTP URL, skipping snapshot");
                return Snapshot::default();
            }
        };

        match self.fetch(url).await {
            Ok(snapshot) => {
                info!(
                    target = %target,
                    status = snapshot.http_status,
                    "Snapshot captured"
                );
                snapshot
            }
            Err(e) => {
                warn!(target = %target, error = %e, "Snapshot fetch failed, continuing without");
                Snapshot::default()
            }
        }
    }
}
