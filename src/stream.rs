//! Resolved streams and subtitles
//!
//! A `StreamSet` is the value handed back for one (translation, season,
//! episode) selection. It is built once from the manifest and never changed
//! afterwards.

use crate::providers::{EpisodeKey, ProviderError};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::HashMap;

/// Labels upstream uses for its adaptive proxy entry, lowercase; parsing stops there
pub(crate) const AUTO_LABELS: [&str; 2] = ["авто", "auto"];

pub(crate) fn is_auto_label(label: &str) -> bool {
    let label = label.trim().to_lowercase();
    AUTO_LABELS.contains(&label.as_str())
}

/// Resolution -> URL mapping plus subtitles for one selection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamSet {
    /// Season id, for series content
    pub season: Option<String>,
    /// Episode id, for series content
    pub episode: Option<String>,
    /// Resolution label -> playable URL, in display order
    pub resolutions: IndexMap<String, String>,
    /// Subtitle tracks, empty when upstream supplies none
    pub subtitles: SubtitleSet,
}

impl StreamSet {
    pub(crate) fn new(
        episode: Option<&EpisodeKey>,
        resolutions: IndexMap<String, String>,
        subtitles: SubtitleSet,
    ) -> Self {
        Self {
            season: episode.map(|key| key.season.clone()),
            episode: episode.map(|key| key.episode.clone()),
            resolutions,
            subtitles,
        }
    }

    /// Returns the URL of the first resolution whose label contains `resolution`
    pub fn url_for(&self, resolution: &str) -> Result<&str, ProviderError> {
        self.resolutions
            .iter()
            .find(|(label, _)| label.contains(resolution))
            .map(|(_, url)| url.as_str())
            .ok_or_else(|| ProviderError::undefined("Resolution", resolution))
    }
}

/// A single subtitle track
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubtitleTrack {
    pub label: String,
    pub url: String,
}

/// Subtitle tracks keyed by language code
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SubtitleSet {
    tracks: IndexMap<String, SubtitleTrack>,
}

impl SubtitleSet {
    /// Parses a `[Language]url,[Language]url` list
    ///
    /// Language labels are mapped to codes through `codes`; a label missing
    /// from the table is used as its own code. A repeated language replaces
    /// the earlier entry.
    pub fn parse(data: &str, codes: &HashMap<String, String>) -> Result<Self, ProviderError> {
        let mut tracks = IndexMap::new();

        for entry in data.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (label, url) = split_bracketed(entry).ok_or_else(|| {
                ProviderError::Decode(format!("malformed subtitle entry: {entry}"))
            })?;
            let code = codes.get(label).cloned().unwrap_or_else(|| label.to_string());
            tracks.insert(
                code,
                SubtitleTrack {
                    label: label.to_string(),
                    url: url.trim().to_string(),
                },
            );
        }

        Ok(Self { tracks })
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    /// Language codes in upstream order
    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.tracks.keys().map(String::as_str)
    }

    /// Iterates `(code, track)` pairs in upstream order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &SubtitleTrack)> {
        self.tracks.iter().map(|(code, track)| (code.as_str(), track))
    }

    /// Looks a track up by code, then by label, then by position
    pub fn link(&self, id: &str) -> Result<&str, ProviderError> {
        if let Some(track) = self.tracks.get(id) {
            return Ok(&track.url);
        }

        if let Some(track) = self.tracks.values().find(|track| track.label == id) {
            return Ok(&track.url);
        }

        id.parse::<usize>()
            .ok()
            .and_then(|index| self.tracks.get_index(index))
            .map(|(_, track)| track.url.as_str())
            .ok_or_else(|| ProviderError::undefined("Subtitles", id))
    }
}

/// Parses the scraped portal's clear-text manifest
///
/// Entries are comma separated and shaped `resolution[label]url or url`
/// (the resolution may also be the bracketed label itself, as in
/// `[720p]url or url`). The second alternative is the primary URL. An entry
/// labelled "Auto" ends the list.
pub fn parse_scraped_manifest(text: &str) -> Result<IndexMap<String, String>, ProviderError> {
    let mut resolutions = IndexMap::new();

    for entry in text.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let open = entry
            .find('[')
            .ok_or_else(|| ProviderError::Decode(format!("malformed manifest entry: {entry}")))?;
        let (label, rest) = split_bracketed(&entry[open..])
            .ok_or_else(|| ProviderError::Decode(format!("malformed manifest entry: {entry}")))?;

        let prefix = entry[..open].trim();
        let resolution = if prefix.is_empty() { label.trim() } else { prefix };
        if is_auto_label(resolution) {
            break;
        }

        let mut alternatives = rest.split(" or ").map(str::trim);
        let first = alternatives.next().unwrap_or_default();
        let url = alternatives.next().unwrap_or(first);
        if url.is_empty() {
            return Err(ProviderError::Decode(format!(
                "manifest entry without URL: {entry}"
            )));
        }

        resolutions.insert(resolution.to_string(), url.to_string());
    }

    Ok(resolutions)
}

/// Splits `[label]rest` into `(label, rest)`
pub(crate) fn split_bracketed(entry: &str) -> Option<(&str, &str)> {
    let rest = entry.strip_prefix('[')?;
    let close = rest.find(']')?;
    Some((&rest[..close], &rest[close + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_takes_second_alternative() {
        let resolutions = parse_scraped_manifest(
            "720p[Server1]http://a or http://b,480p[Server1]http://c or http://d",
        )
        .unwrap();
        let pairs: Vec<(String, String)> = resolutions.into_iter().collect();
        assert_eq!(
            pairs,
            vec![
                ("720p".to_string(), "http://b".to_string()),
                ("480p".to_string(), "http://d".to_string()),
            ]
        );
    }

    #[test]
    fn test_manifest_bracketed_resolution() {
        let resolutions = parse_scraped_manifest(
            "[360p]https://x/360.mp4:hls:manifest.m3u8 or https://x/360.mp4,[1080p Ultra]https://x/1080.mp4",
        )
        .unwrap();
        assert_eq!(resolutions["360p"], "https://x/360.mp4");
        assert_eq!(resolutions["1080p Ultra"], "https://x/1080.mp4");
    }

    #[test]
    fn test_manifest_stops_at_auto() {
        let resolutions =
            parse_scraped_manifest("[480p]http://a or http://b,[Авто]http://auto,[1080p]http://c")
                .unwrap();
        assert_eq!(resolutions.len(), 1);
        assert!(!resolutions.contains_key("Авто"));
        assert!(!resolutions.contains_key("1080p"));
    }

    #[test]
    fn test_auto_label_in_any_case() {
        for label in ["Авто", "АВТО", "авто", "Auto", "AUTO", " auto "] {
            assert!(is_auto_label(label), "{label}");
        }
        assert!(!is_auto_label("Автоматически"));
        assert!(!is_auto_label("720p"));

        let resolutions =
            parse_scraped_manifest("[720p]http://a or http://b,[АВТО]http://auto,[1080p]http://c")
                .unwrap();
        assert_eq!(resolutions.keys().collect::<Vec<_>>(), vec!["720p"]);
    }

    #[test]
    fn test_manifest_malformed() {
        assert!(matches!(
            parse_scraped_manifest("no brackets here"),
            Err(ProviderError::Decode(_))
        ));
    }

    fn subtitles() -> SubtitleSet {
        let mut codes = HashMap::new();
        codes.insert("Русский".to_string(), "ru".to_string());
        codes.insert("English".to_string(), "en".to_string());
        SubtitleSet::parse(
            "[Русский]http://s/ru-old.vtt,[English]http://s/en.vtt,[Русский]http://s/ru.vtt",
            &codes,
        )
        .unwrap()
    }

    #[test]
    fn test_subtitle_lookup_by_code_label_and_index() {
        let subs = subtitles();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs.codes().collect::<Vec<_>>(), vec!["ru", "en"]);

        assert_eq!(subs.link("en").unwrap(), "http://s/en.vtt");
        assert_eq!(subs.link("English").unwrap(), "http://s/en.vtt");
        assert_eq!(subs.link("1").unwrap(), "http://s/en.vtt");
        // last duplicate wins
        assert_eq!(subs.link("ru").unwrap(), "http://s/ru.vtt");
        assert_eq!(subs.link("0").unwrap(), "http://s/ru.vtt");
    }

    #[test]
    fn test_subtitle_lookup_undefined() {
        let err = subtitles().link("de").unwrap_err();
        assert_eq!(err.to_string(), "Subtitles \"de\" is not defined");
        assert!(SubtitleSet::default().link("0").is_err());
    }

    #[test]
    fn test_subtitle_unknown_language_keeps_label() {
        let subs = SubtitleSet::parse("[Suomi]http://s/fi.vtt", &HashMap::new()).unwrap();
        assert_eq!(subs.link("Suomi").unwrap(), "http://s/fi.vtt");
    }

    #[test]
    fn test_url_for_matches_substring() {
        let mut resolutions = IndexMap::new();
        resolutions.insert("1080p Ultra".to_string(), "http://u".to_string());
        let stream = StreamSet::new(None, resolutions, SubtitleSet::default());
        assert_eq!(stream.url_for("1080").unwrap(), "http://u");
        assert!(stream.url_for("720").is_err());
    }
}
