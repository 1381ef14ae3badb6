use crate::{
    model::file_stem,
    scrape::{decode_entities, html_text_lines, ScrapeError, ScrapeResult, Scraper},
};
use log::warn;
use once_cell::sync::Lazy;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::Regex;

pub const LIBLIB_PAGE_PREFIX: &str = "https://www.liblib.art/";
const LIBLIB_SEARCH: &str = "https://www.liblib.art/search?keyword=";

const PREVIEW_CLASS: &str = "ModelVersion_modelVersion__";
const TRIGGER_CLASS: &str = "ModelDetailCard_triggerTxt__";
const DESCRIPTION_CLASS: &str = "ModelDescription_desc__";

const KEYWORD_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'.')
    .remove(b'-')
    .remove(b'~')
    .remove(b'/');

static VERSION_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(_v\d+(\.\d+)?|_\d+(\.\d+)?)").expect("valid version pattern"));
static IMG_SRC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<img\b[^>]*?\bsrc="([^"]+)""#).expect("valid img pattern"));
static OG_IMAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<meta\b[^>]*property="og:image"[^>]*content="([^"]+)""#).expect("valid og pattern")
});

pub fn liblib_search_url(file_name: &str) -> String {
    let keyword = VERSION_SUFFIX.replace_all(file_stem(file_name), "");
    format!(
        "{LIBLIB_SEARCH}{}",
        utf8_percent_encode(&keyword, KEYWORD_SET)
    )
}

pub fn validate_page_url(url: &str) -> Result<&str, ScrapeError> {
    let url = url.trim();
    if url.is_empty() || !url.starts_with(LIBLIB_PAGE_PREFIX) {
        return Err(ScrapeError::InvalidUrl(url.to_string()));
    }
    Ok(url)
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LiblibPage {
    pub preview_url: Option<String>,
    pub trigger_words: Vec<String>,
    pub description: Option<String>,
}

impl LiblibPage {
    pub fn parse(html: &str) -> Self {
        Self {
            preview_url: extract_preview_url(html),
            trigger_words: extract_trigger_words(html),
            description: extract_description(html),
        }
    }
}

/// Inner HTML of every element whose class list has an entry starting with
/// `class_prefix`. The build hash suffix of CSS-module classes is ignored.
fn elements_by_class_prefix<'a>(html: &'a str, class_prefix: &str) -> Vec<&'a str> {
    let pattern = format!(
        r#"<([a-zA-Z][a-zA-Z0-9]*)\b[^>]*\bclass="[^"]*\b{}[^"]*"[^>]*>"#,
        regex::escape(class_prefix)
    );
    let Ok(opening) = Regex::new(&pattern) else {
        return Vec::new();
    };

    let mut found = Vec::new();
    for captures in opening.captures_iter(html) {
        let (Some(whole), Some(tag)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let start = whole.end();
        if let Some(end) = matching_close(html, start, tag.as_str()) {
            found.push(&html[start..end]);
        }
    }
    found
}

/// Byte offset of the `</tag>` closing the element whose content starts at
/// `start`.
fn matching_close(html: &str, start: usize, tag: &str) -> Option<usize> {
    let open = format!("<{tag}");
    let close = format!("</{tag}");
    let mut depth = 1usize;
    let mut cursor = start;
    loop {
        let rest = &html[cursor..];
        let next_close = rest.find(&close)?;
        let next_open = rest[..next_close]
            .match_indices(&open)
            .find(|(index, _)| {
                rest[index + open.len()..]
                    .chars()
                    .next()
                    .is_some_and(|ch| ch == '>' || ch.is_whitespace())
            })
            .map(|(index, _)| index);
        match next_open {
            Some(index) => {
                depth += 1;
                cursor += index + open.len();
            }
            None => {
                depth -= 1;
                if depth == 0 {
                    return Some(cursor + next_close);
                }
                cursor += next_close + close.len();
            }
        }
    }
}

pub fn extract_preview_url(html: &str) -> Option<String> {
    elements_by_class_prefix(html, PREVIEW_CLASS)
        .into_iter()
        .find_map(|inner| IMG_SRC.captures(inner))
        .or_else(|| OG_IMAGE.captures(html))
        .and_then(|captures| captures.get(1))
        .map(|src| decode_entities(src.as_str()))
        .filter(|src| src.starts_with("http"))
}

pub fn extract_trigger_words(html: &str) -> Vec<String> {
    elements_by_class_prefix(html, TRIGGER_CLASS)
        .into_iter()
        .map(|inner| {
            html_text_lines(inner)
                .into_iter()
                .filter(|line| !line.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|word| !word.is_empty())
        .collect()
}

pub fn extract_description(html: &str) -> Option<String> {
    let inner = elements_by_class_prefix(html, DESCRIPTION_CLASS)
        .into_iter()
        .next()?;
    let lines: Vec<String> = html_text_lines(inner)
        .into_iter()
        .filter(|line| !line.is_empty())
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n\n"))
    }
}

impl Scraper {
    pub async fn fetch_liblib(
        &self,
        url: &str,
        want_preview: bool,
    ) -> Result<ScrapeResult, ScrapeError> {
        let url = validate_page_url(url)?;
        let html = self.get_text(url).await?;
        let page = LiblibPage::parse(&html);

        let mut result = ScrapeResult {
            trigger_words: Some(page.trigger_words.join(", ")).filter(|words| !words.is_empty()),
            description: page.description,
            ..Default::default()
        };

        if want_preview {
            match page.preview_url {
                Some(image_url) => {
                    result.preview_image = self.fetch_preview(&image_url).await;
                    result.preview_url = Some(image_url);
                }
                None => warn!("No preview image found on {url}"),
            }
        }

        if result.is_empty() {
            return Err(ScrapeError::NotFound);
        }
        Ok(result)
    }
}
