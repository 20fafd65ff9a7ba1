//! HTML extraction for the scraped portal
//!
//! Pure functions over page markup; everything network related lives in the
//! parent module.

use crate::providers::{ContentKind, ProviderError, SeriesStructure, TranslationSet};
use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::LazyLock;

// Selectors and patterns are compile-time constants; parsing cannot fail on them.
static POST_ID: LazyLock<Selector> = LazyLock::new(|| selector("#post_id"));
static TITLE: LazyLock<Selector> = LazyLock::new(|| selector(".b-post__title"));
static OG_TYPE: LazyLock<Selector> = LazyLock::new(|| selector(r#"meta[property="og:type"]"#));
static IMAGE: LazyLock<Selector> = LazyLock::new(|| selector("img[src]"));
static TRANSLATORS: LazyLock<Selector> = LazyLock::new(|| selector("#translators-list"));
static INFO_ROWS: LazyLock<Selector> = LazyLock::new(|| selector(".b-post__info tr"));
static INFO_LINKS: LazyLock<Selector> =
    LazyLock::new(|| selector(r#"table.b-post__info a[target="_blank"]"#));
static SEASON_ITEM: LazyLock<Selector> = LazyLock::new(|| selector(".b-simple_season__item"));
static EPISODE_ITEM: LazyLock<Selector> = LazyLock::new(|| selector(".b-simple_episode__item"));
static SEARCH_ITEM: LazyLock<Selector> = LazyLock::new(|| selector(".b-content__inline_item"));
static SEARCH_LINK: LazyLock<Selector> = LazyLock::new(|| selector("div a[href]"));
static PART_ITEM: LazyLock<Selector> = LazyLock::new(|| selector(".b-post__partcontent_item"));
static PART_TITLE: LazyLock<Selector> = LazyLock::new(|| selector(".title"));
static CDN_EVENTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"sof\.tv\.(initCDNSeriesEvents|initCDNMoviesEvents)\(([^{]*)")
        .expect("invalid CDN events regex")
});

/// Row markers of the metadata table entry naming the translation
const TRANSLATION_MARKERS: [&str; 2] = ["В переводе:", "In translation:"];

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("invalid built-in selector")
}

fn text_of(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// Identity of a content page
#[derive(Debug, Clone, PartialEq)]
pub(super) struct PageInfo {
    pub post_id: String,
    pub title: String,
    pub kind: ContentKind,
    pub poster_url: Option<String>,
}

pub(super) fn parse_page(html: &str) -> Result<PageInfo, ProviderError> {
    let document = Html::parse_document(html);

    let post_id = document
        .select(&POST_ID)
        .next()
        .and_then(|e| e.value().attr("value"))
        .ok_or_else(|| ProviderError::Upstream("content page has no post id".to_string()))?
        .to_string();

    let title = document
        .select(&TITLE)
        .next()
        .map(text_of)
        .ok_or_else(|| ProviderError::Upstream("content page has no title".to_string()))?;

    let og_type = document
        .select(&OG_TYPE)
        .next()
        .and_then(|e| e.value().attr("content"))
        .unwrap_or_default();
    let kind = match og_type {
        "video.tv_series" => ContentKind::Series,
        "video.movie" => ContentKind::Movie,
        other => {
            return Err(ProviderError::Upstream(format!(
                "Undefined content type '{other}'"
            )));
        }
    };

    let poster_url = document
        .select(&IMAGE)
        .next()
        .and_then(|e| e.value().attr("src"))
        .map(str::to_string);

    Ok(PageInfo {
        post_id,
        title,
        kind,
        poster_url,
    })
}

/// Reads the translation list of a content page
///
/// Titles with a single translation have no selectable list; for those the
/// label comes from the metadata table and the id from the player
/// initialisation script.
pub(super) fn translations(html: &str, kind: ContentKind) -> TranslationSet {
    let document = Html::parse_document(html);
    let mut set = TranslationSet::new();

    if let Some(list) = document.select(&TRANSLATORS).next() {
        for item in list.child_elements() {
            let label = text_of(item);
            if label.is_empty() {
                continue;
            }
            if let Some(id) = item.value().attr("data-translator_id") {
                set.insert(label, id);
            }
        }
    }

    if set.is_empty() {
        if let Some(id) = detect_translation_id(html, kind) {
            let label = detect_translation_label(&document).unwrap_or_else(|| id.clone());
            set.insert(label, id);
        }
    }

    set
}

fn detect_translation_label(document: &Html) -> Option<String> {
    document.select(&INFO_ROWS).find_map(|row| {
        let text = row.text().collect::<String>();
        TRANSLATION_MARKERS.iter().find_map(|marker| {
            text.rfind(marker)
                .map(|pos| text[pos + marker.len()..].trim().to_string())
        })
    })
}

fn detect_translation_id(html: &str, kind: ContentKind) -> Option<String> {
    let wanted = match kind {
        ContentKind::Series => "initCDNSeriesEvents",
        ContentKind::Movie => "initCDNMoviesEvents",
    };

    let calls: Vec<_> = CDN_EVENTS.captures_iter(html).collect();
    let call = calls
        .iter()
        .rev()
        .find(|c| &c[1] == wanted)
        .or_else(|| calls.last())?;

    call[2]
        .split(',')
        .nth(1)
        .map(|arg| arg.trim().trim_matches(|c| c == '"' || c == '\'').to_string())
        .filter(|id| !id.is_empty())
}

/// Cross-indexes the season tab list and the episode tab list
pub(super) fn series_structure(seasons_html: &str, episodes_html: &str) -> SeriesStructure {
    let mut structure = SeriesStructure::default();

    for season in Html::parse_fragment(seasons_html).select(&SEASON_ITEM) {
        if let Some(id) = season.value().attr("data-tab_id") {
            structure.seasons.insert(id.to_string(), text_of(season));
        }
    }

    for episode in Html::parse_fragment(episodes_html).select(&EPISODE_ITEM) {
        let attrs = episode.value();
        if let (Some(season), Some(id)) = (attrs.attr("data-season_id"), attrs.attr("data-episode_id")) {
            structure
                .episodes
                .entry(season.to_string())
                .or_default()
                .insert(id.to_string(), text_of(episode));
        }
    }

    structure
}

/// Absolute URLs of the first `limit` search hits
pub(super) fn search_results(html: &str, base_url: &str, limit: usize) -> Vec<String> {
    Html::parse_document(html)
        .select(&SEARCH_ITEM)
        .take(limit)
        .filter_map(|item| item.select(&SEARCH_LINK).next())
        .filter_map(|link| link.value().attr("href"))
        .map(|href| {
            if href.starts_with('/') {
                format!("{base_url}{href}")
            } else {
                href.to_string()
            }
        })
        .collect()
}

/// Extracts the external cross-reference id from a content page
///
/// The second outbound link of the info table is a redirect whose path
/// segment after `/help/` is a base64-encoded, percent-encoded URL of the
/// external database entry; the id is its last path segment.
pub(super) fn cross_ref_id(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let href = document
        .select(&INFO_LINKS)
        .nth(1)?
        .value()
        .attr("href")?;

    let encoded = href.split("/help/").nth(1)?.split('/').next()?;
    let encoded = encoded.replace("%3D", "=").replace("%3d", "=");
    let decoded = STANDARD_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())?;

    let segments: Vec<&str> = decoded.split("%2F").collect();
    if segments.len() < 2 {
        return None;
    }
    Some(segments[segments.len() - 2].to_string()).filter(|id| !id.is_empty())
}

/// Other parts of the same franchise as `(title, url)` pairs
pub(super) fn other_parts(html: &str, own_url: &str) -> Vec<(String, String)> {
    Html::parse_document(html)
        .select(&PART_ITEM)
        .filter_map(|item| {
            let title = item.select(&PART_TITLE).next().map(text_of)?;
            if item.value().classes().any(|c| c == "current") {
                Some((title, own_url.to_string()))
            } else {
                item.value()
                    .attr("data-url")
                    .map(|url| (title, url.to_string()))
            }
        })
        .collect()
}
