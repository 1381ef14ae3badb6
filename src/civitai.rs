use crate::scrape::{collapse_paragraphs, html_text_lines, ScrapeError, ScrapeResult, Scraper};
use log::{debug, warn};
use serde::Deserialize;
use serde_json::Value;

pub const CIVITAI_API_BASE: &str = "https://civitai.com/api/v1";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CivitaiVersionByHash {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub model_id: Option<u64>,
    #[serde(default)]
    pub base_model: Option<String>,
    #[serde(default)]
    pub trained_words: Option<Vec<String>>,
    #[serde(default)]
    pub images: Vec<CivitaiImage>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CivitaiImage {
    #[serde(default)]
    pub url: Option<String>,
}

impl CivitaiVersionByHash {
    pub fn model_page_url(&self) -> Option<String> {
        match (self.model_id, self.id) {
            (Some(model_id), Some(version_id)) => Some(format!(
                "https://civitai.com/models/{model_id}?modelVersionId={version_id}"
            )),
            _ => None,
        }
    }

    pub fn first_image_url(&self) -> Option<&str> {
        self.images
            .iter()
            .filter_map(|image| image.url.as_deref())
            .find(|url| !url.is_empty() && !is_video_url(url))
    }

    pub fn trigger_words(&self) -> Option<String> {
        self.trained_words
            .as_ref()
            .map(|words| words.join(", "))
            .filter(|words| !words.trim().is_empty())
    }
}

pub fn by_hash_url(hash: &str) -> String {
    format!("{CIVITAI_API_BASE}/model-versions/by-hash/{}", hash.trim())
}

fn is_video_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.ends_with(".mp4") || lower.ends_with(".webm") || lower.ends_with(".mov")
}

pub fn parse_jsonld_description(html: &str) -> Option<String> {
    let mut rest = html;
    while let Some(start) = rest.find("<script") {
        let after = &rest[start..];
        let tag_end = after.find('>')?;
        let tag = &after[..tag_end];
        let body_start = tag_end + 1;
        let body_len = after[body_start..].find("</script>")?;
        let body = &after[body_start..body_start + body_len];
        rest = &after[body_start + body_len..];

        if !tag.contains("application/ld+json") {
            continue;
        }
        let value: Value = match serde_json::from_str(body.trim()) {
            Ok(value) => value,
            Err(err) => {
                debug!("Skipping unreadable JSON-LD block: {err}");
                continue;
            }
        };
        let description = value
            .get("description")
            .and_then(Value::as_str)
            .map(|html| collapse_paragraphs(&html_text_lines(html)))
            .filter(|text| !text.is_empty());
        if description.is_some() {
            return description;
        }
    }
    None
}

impl Scraper {
    /// Looks a model up by content hash. A 404 from the hash endpoint, or a
    /// payload without model ids, reads as [`ScrapeError::NotFound`].
    pub async fn fetch_civitai(
        &self,
        hash: &str,
        want_preview: bool,
    ) -> Result<ScrapeResult, ScrapeError> {
        let hash = hash.trim();
        if hash.is_empty() {
            return Err(ScrapeError::NotFound);
        }

        let payload: CivitaiVersionByHash = self.get_json(&by_hash_url(hash)).await?;
        let Some(page_url) = payload.model_page_url() else {
            return Err(ScrapeError::NotFound);
        };

        let mut result = ScrapeResult {
            source_url: Some(page_url.clone()),
            trigger_words: payload.trigger_words(),
            ..Default::default()
        };

        if want_preview {
            if let Some(image_url) = payload.first_image_url() {
                result.preview_url = Some(image_url.to_string());
                result.preview_image = self.fetch_preview(image_url).await;
            }
        }

        result.description = match self.get_text(&page_url).await {
            Ok(html) => parse_jsonld_description(&html),
            Err(err) => {
                warn!("Failed to load Civitai page {page_url}: {err}");
                None
            }
        }
        .or_else(|| {
            payload
                .description
                .as_deref()
                .map(|html| collapse_paragraphs(&html_text_lines(html)))
                .filter(|text| !text.is_empty())
        });

        if result.is_empty() {
            return Err(ScrapeError::NotFound);
        }
        Ok(result)
    }
}
