use crate::{
    config::LibraryConfig,
    model::{ModelFileRef, ModelMetadataRecord},
    preview,
    store::MetadataStore,
};
use anyhow::Result;
use log::{info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::path::Path;
use thiserror::Error;

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

pub const LIBLIB_MARKER: &str = "=== 从Liblib抓取的描述 ===";
pub const CIVITAI_MARKER: &str = "=== 从Civitai抓取的描述 ===";

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("no information found for this model")]
    NotFound,
    #[error("request to {0} timed out")]
    Timeout(String),
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("network request failed: {0}")]
    Transport(String),
    #[error("not a valid page address: {0}")]
    InvalidUrl(String),
}

impl ScrapeError {
    fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ScrapeError::Timeout(url.to_string())
        } else {
            ScrapeError::Transport(err.to_string())
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScrapeSource {
    Liblib,
    Civitai,
}

impl ScrapeSource {
    pub fn label(self) -> &'static str {
        match self {
            ScrapeSource::Liblib => "Liblib",
            ScrapeSource::Civitai => "Civitai",
        }
    }

    pub fn marker(self) -> &'static str {
        match self {
            ScrapeSource::Liblib => LIBLIB_MARKER,
            ScrapeSource::Civitai => CIVITAI_MARKER,
        }
    }

    fn other(self) -> Self {
        match self {
            ScrapeSource::Liblib => ScrapeSource::Civitai,
            ScrapeSource::Civitai => ScrapeSource::Liblib,
        }
    }
}

/// Whether a fetched preview may overwrite the one already on disk. The
/// presentation layer decides, typically after asking the user.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PreviewPolicy {
    Replace,
    #[default]
    OnlyIfMissing,
}

impl PreviewPolicy {
    pub fn wants_preview(self, has_preview: bool) -> bool {
        match self {
            PreviewPolicy::Replace => true,
            PreviewPolicy::OnlyIfMissing => !has_preview,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ScrapeResult {
    pub source_url: Option<String>,
    pub preview_url: Option<String>,
    pub preview_image: Option<Vec<u8>>,
    pub trigger_words: Option<String>,
    pub description: Option<String>,
}

impl ScrapeResult {
    pub fn is_empty(&self) -> bool {
        self.source_url.is_none()
            && self.preview_image.is_none()
            && self.trigger_words.is_none()
            && self.description.is_none()
    }

    pub fn apply_to(&self, record: &mut ModelMetadataRecord, source: ScrapeSource) {
        if let Some(url) = &self.source_url {
            record.url = url.clone();
        }
        if let Some(words) = &self.trigger_words {
            record.trigger_words = words.clone();
        }
        if let Some(fragment) = &self.description {
            record.description = merge_description(&record.description, source, fragment);
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub preview_saved: bool,
    pub trigger_words: bool,
    pub description: bool,
}

pub fn commit(
    store: &MetadataStore,
    root: &Path,
    model: &ModelFileRef,
    source: ScrapeSource,
    result: &ScrapeResult,
) -> Result<CommitSummary> {
    let mut summary = CommitSummary::default();
    if let Some(bytes) = &result.preview_image {
        match preview::replace_preview(&model.absolute_path(root), bytes) {
            Ok(_) => summary.preview_saved = true,
            Err(err) => warn!("Could not save fetched preview for {model}: {err:#}"),
        }
    }
    summary.trigger_words = result.trigger_words.is_some();
    summary.description = result.description.is_some();
    store.update(&model.key(), |record| result.apply_to(record, source))?;
    info!("Saved {} information for {model}", source.label());
    Ok(summary)
}

/// Replaces this source's block in `current`, or appends one. Text before the
/// block and the other source's block are kept.
pub fn merge_description(current: &str, source: ScrapeSource, fragment: &str) -> String {
    let marker = source.marker();
    let block = format!("{marker}\n{}", fragment.trim());
    let current = current.trim();
    if current.is_empty() {
        return block;
    }

    let Some(start) = current.find(marker) else {
        return format!("{current}\n\n{block}");
    };

    let before = current[..start].trim();
    let after = &current[start + marker.len()..];
    let other = after
        .find(source.other().marker())
        .map(|index| after[index..].trim())
        .unwrap_or("");

    [before, block.as_str(), other]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

static HTML_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<!--.*?-->|<(/?)([a-zA-Z][a-zA-Z0-9]*)[^>]*>|[^<]+|<").expect("valid token pattern"));

const BREAKING_TAGS: &[&str] = &["p", "br", "div", "li", "h1", "h2", "h3", "h4", "h5", "h6"];

pub fn html_text_lines(html: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut skip_depth = 0usize;
    for captures in HTML_TOKEN.captures_iter(html) {
        let token = captures.get(0).map(|m| m.as_str()).unwrap_or_default();
        if let Some(tag) = captures.get(2) {
            let tag = tag.as_str().to_ascii_lowercase();
            let closing = captures.get(1).is_some_and(|m| !m.as_str().is_empty());
            if tag == "script" || tag == "style" {
                if closing {
                    skip_depth = skip_depth.saturating_sub(1);
                } else {
                    skip_depth += 1;
                }
            } else if BREAKING_TAGS.contains(&tag.as_str()) {
                lines.push(String::new());
            }
            continue;
        }
        if token.starts_with("<!--") || skip_depth > 0 {
            continue;
        }
        let text = decode_entities(token.trim());
        if !text.is_empty() {
            lines.push(text);
        }
    }
    lines
}

pub fn collapse_paragraphs(lines: &[String]) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut previous_blank = false;
    for line in lines {
        if line.is_empty() {
            if !previous_blank {
                out.push("");
            }
            previous_blank = true;
        } else {
            out.push(line);
            previous_blank = false;
        }
    }
    out.join("\n").trim().to_string()
}

pub fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(index) = rest.find('&') {
        out.push_str(&rest[..index]);
        rest = &rest[index..];
        let Some(end) = rest.find(';').filter(|end| *end <= 10) else {
            out.push('&');
            rest = &rest[1..];
            continue;
        };
        let entity = &rest[1..end];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" | "#39" => Some('\''),
            "nbsp" => Some(' '),
            _ => entity
                .strip_prefix("#x")
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(ch) => {
                out.push(ch);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

#[derive(Clone, Debug)]
pub struct Scraper {
    client: Client,
    offline: bool,
}

impl Scraper {
    pub fn new(config: &LibraryConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .timeout(config.http_timeout)
            .build()?;
        Ok(Self {
            client,
            offline: config.offline,
        })
    }

    async fn send(&self, url: &str) -> Result<reqwest::Response, ScrapeError> {
        if self.offline {
            return Err(ScrapeError::Transport("offline mode is enabled".to_string()));
        }
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| ScrapeError::from_reqwest(url, err))?;
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::NOT_FOUND => Err(ScrapeError::NotFound),
            status => Err(ScrapeError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            }),
        }
    }

    pub async fn get_text(&self, url: &str) -> Result<String, ScrapeError> {
        self.send(url)
            .await?
            .text()
            .await
            .map_err(|err| ScrapeError::from_reqwest(url, err))
    }

    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, ScrapeError> {
        self.send(url)
            .await?
            .bytes()
            .await
            .map(|bytes| bytes.to_vec())
            .map_err(|err| ScrapeError::from_reqwest(url, err))
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, ScrapeError> {
        self.send(url)
            .await?
            .json()
            .await
            .map_err(|err| ScrapeError::from_reqwest(url, err))
    }

    pub async fn fetch_preview(&self, url: &str) -> Option<Vec<u8>> {
        match self.get_bytes(url).await {
            Ok(bytes) if !bytes.is_empty() => Some(bytes),
            Ok(_) => {
                warn!("Preview at {url} was empty");
                None
            }
            Err(err) => {
                warn!("Failed to download preview {url}: {err}");
                None
            }
        }
    }
}
