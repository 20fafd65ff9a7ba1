//! Iframe-embed providers
//!
//! Both embed sites serve a page whose player is configured by a JSON
//! literal passed to `new Playerjs(...)`. The literal is a tree of
//! `{title, file, folder}` nodes whose nesting order differs per site;
//! each site module maps its tree onto the normalized [`EmbedLayout`] and
//! the shared [`EmbedContent`] implements the provider operations on top.
//!
//! Leaf `file` fields are comma-separated `[resolution]url` lists. When a
//! leaf carries every translation at once, each URL is further split into
//! `{label}url` alternatives separated by `;`.

mod turbo;
mod vibix;

pub use turbo::TurboProvider;
pub use vibix::VibixProvider;

use super::{
    ContentKind, ContentRef, EpisodeKey, ProviderError, ProviderKind, TranslationChoice,
    TranslationSet,
};
use crate::session::ProviderSession;
use crate::stream::{StreamSet, SubtitleSet, is_auto_label, split_bracketed};
use indexmap::IndexMap;
use scraper::{Html, Selector};
use serde::Deserialize;
use std::sync::LazyLock;
use tracing::debug;

static SCRIPT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("script").expect("invalid built-in selector"));

const PLAYER_CALL: &str = "Playerjs(";
const PLAYER_CALL_END: &str = ");";

/// Referer the embed hosts expect from the balancer front end
pub(crate) const EMBED_REFERER: &str = "https://reyohoho.serv00.net/";

/// Top level of the `Playerjs(...)` configuration
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PlayerConfig {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub poster: Option<String>,
    pub file: PlayerFile,
}

/// The `file` field: either a node list or a single leaf string
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum PlayerFile {
    Nodes(Vec<PlayerNode>),
    Leaf(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct PlayerNode {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub folder: Option<Vec<PlayerNode>>,
}

impl PlayerNode {
    pub fn children(&self) -> &[PlayerNode] {
        self.folder.as_deref().unwrap_or_default()
    }
}

/// One selectable translation of a movie or an episode
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Track {
    pub label: String,
    /// `[resolution]url` list for this translation only
    pub file: String,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Episode {
    pub label: String,
    pub tracks: Vec<Track>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Season {
    pub label: String,
    pub episodes: IndexMap<String, Episode>,
}

/// Site-independent shape of an embed payload
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum EmbedLayout {
    Movie { tracks: Vec<Track> },
    Series { seasons: IndexMap<String, Season> },
}

/// Fetches an embed page and extracts its player configuration
pub(crate) fn fetch_player(
    session: &ProviderSession,
    iframe_url: &str,
) -> Result<PlayerConfig, ProviderError> {
    let response = session.get(iframe_url, &[])?;
    extract_player_config(&response.body)
}

/// Extracts the object literal passed to `Playerjs(...)` in the first script
/// that calls it
///
/// The literal is JavaScript rather than strict JSON: keys may be unquoted
/// and strings single-quoted.
pub(crate) fn extract_player_config(html: &str) -> Result<PlayerConfig, ProviderError> {
    let document = Html::parse_document(html);
    let script = document
        .select(&SCRIPT)
        .map(|s| s.text().collect::<String>())
        .find(|text| text.contains(PLAYER_CALL))
        .ok_or_else(|| ProviderError::Upstream("embed page has no player".to_string()))?;

    let start = script.find(PLAYER_CALL).unwrap_or_default() + PLAYER_CALL.len();
    let argument = &script[start..];
    let literal = match argument.find(PLAYER_CALL_END) {
        Some(end) => &argument[..end],
        None => argument,
    };

    json5::from_str(literal.trim())
        .map_err(|e| ProviderError::Decode(format!("player configuration: {e}")))
}

/// Parses a leaf `[resolution]url,[resolution]url` list
///
/// A "MP4" marker is dropped from the resolution label. The list ends at
/// the adaptive "Auto" entry and is returned in reverse upstream order.
pub(crate) fn parse_quality_list(file: &str) -> Result<IndexMap<String, String>, ProviderError> {
    let mut entries = Vec::new();

    for entry in file.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (label, url) = split_bracketed(entry)
            .ok_or_else(|| ProviderError::Decode(format!("malformed stream entry: {entry}")))?;
        let resolution = label.replace("MP4", "").trim().to_string();
        if is_auto_label(&resolution) {
            break;
        }
        entries.push((resolution, url.trim().to_string()));
    }

    Ok(entries.into_iter().rev().collect())
}

/// Translation labels of a combined leaf, in order of first appearance
pub(crate) fn brace_labels(file: &str) -> Vec<String> {
    let mut labels: Vec<String> = Vec::new();
    for part in file.split([',', ';']) {
        let part = part.trim_start();
        let part = match split_bracketed(part) {
            Some((_, rest)) => rest,
            None => part,
        };
        if let Some(label) = part
            .strip_prefix('{')
            .and_then(|rest| rest.split_once('}'))
            .map(|(label, _)| label.trim())
        {
            if !labels.iter().any(|l| l == label) {
                labels.push(label.to_string());
            }
        }
    }
    labels
}

/// Keeps only the `{label}` alternative of every entry of a combined leaf
fn select_labelled(file: &str, label: &str) -> String {
    let tag = format!("{{{label}}}");
    file.split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            let (resolution, urls) = split_bracketed(entry)?;
            urls.split(';')
                .map(str::trim)
                .find_map(|alt| alt.strip_prefix(tag.as_str()))
                .map(|url| format!("[{resolution}]{url}"))
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Splits a leaf into tracks: one per `{label}` when the leaf is combined,
/// otherwise a single track named `fallback`
pub(crate) fn split_combined(file: &str, fallback: &str) -> Vec<Track> {
    let labels = brace_labels(file);
    if labels.is_empty() {
        return vec![Track {
            label: fallback.to_string(),
            file: file.to_string(),
        }];
    }
    labels
        .into_iter()
        .map(|label| Track {
            file: select_labelled(file, &label),
            label,
        })
        .collect()
}

/// Tracks of a node list whose nodes are translations
///
/// A node whose leaf is itself combined contributes one track per label.
pub(crate) fn tracks_of(nodes: &[PlayerNode]) -> Vec<Track> {
    nodes
        .iter()
        .filter_map(|node| node.file.as_deref().map(|file| split_combined(file, node.title.trim())))
        .flatten()
        .collect()
}

/// Nesting depth of a node list; a list of leaves has depth 1
pub(crate) fn depth(nodes: &[PlayerNode]) -> usize {
    nodes
        .iter()
        .map(|node| 1 + depth(node.children()))
        .max()
        .unwrap_or_default()
}

/// Maps a season -> episode -> (translations | combined leaf) tree
pub(crate) fn season_first_layout(nodes: &[PlayerNode]) -> EmbedLayout {
    let mut seasons = IndexMap::new();

    for (season_pos, season) in nodes.iter().enumerate() {
        let mut episodes = IndexMap::new();
        for (episode_pos, episode) in season.children().iter().enumerate() {
            let tracks = match (&episode.folder, &episode.file) {
                (Some(translations), _) => tracks_of(translations),
                (None, Some(file)) => split_combined(file, episode.title.trim()),
                (None, None) => Vec::new(),
            };
            episodes.insert(
                position_id(episode_pos),
                Episode {
                    label: episode.title.trim().to_string(),
                    tracks,
                },
            );
        }
        seasons.insert(
            position_id(season_pos),
            Season {
                label: season.title.trim().to_string(),
                episodes,
            },
        );
    }

    EmbedLayout::Series { seasons }
}

/// Id of a season or episode node: its 1-based position among its siblings
///
/// Titles are free text ("Серия 1 (режиссёрская версия)", "Спецвыпуск") and
/// may repeat, so they never take part in the id.
pub(crate) fn position_id(position: usize) -> String {
    (position + 1).to_string()
}

/// Resolved embed content, shared by every embed site
#[derive(Debug, Clone)]
pub(crate) struct EmbedContent {
    pub content: ContentRef,
    pub layout: EmbedLayout,
}

impl EmbedContent {
    pub fn new(
        provider: ProviderKind,
        iframe_url: &str,
        internal_id: &str,
        config: &PlayerConfig,
        layout: EmbedLayout,
    ) -> Self {
        let kind = match layout {
            EmbedLayout::Movie { .. } => ContentKind::Movie,
            EmbedLayout::Series { .. } => ContentKind::Series,
        };
        debug!(%provider, ?kind, "parsed embed layout");

        Self {
            content: ContentRef {
                provider,
                canonical_url: iframe_url.to_string(),
                internal_id: internal_id.to_string(),
                display_name: config.title.clone().unwrap_or_default(),
                kind,
                poster_url: config.poster.clone().filter(|p| !p.is_empty()),
            },
            layout,
        }
    }

    fn season(&self, season_id: &str) -> Result<&Season, ProviderError> {
        match &self.layout {
            EmbedLayout::Series { seasons } => seasons
                .get(season_id)
                .ok_or_else(|| ProviderError::undefined("Season", season_id)),
            EmbedLayout::Movie { .. } => Err(ProviderError::undefined("Season", season_id)),
        }
    }

    fn episode(&self, key: &EpisodeKey) -> Result<&Episode, ProviderError> {
        self.season(&key.season)?
            .episodes
            .get(&key.episode)
            .ok_or_else(|| ProviderError::undefined("Episode", &key.episode))
    }

    /// Tracks of the movie, or of the selected episode (first one when unset)
    fn tracks(&self, at: Option<&EpisodeKey>) -> Result<&[Track], ProviderError> {
        match (&self.layout, at) {
            (EmbedLayout::Movie { tracks }, _) => Ok(tracks.as_slice()),
            (EmbedLayout::Series { .. }, Some(key)) => Ok(self.episode(key)?.tracks.as_slice()),
            (EmbedLayout::Series { seasons }, None) => Ok(seasons
                .values()
                .next()
                .and_then(|season| season.episodes.values().next())
                .map(|episode| episode.tracks.as_slice())
                .unwrap_or_default()),
        }
    }

    /// Translation label -> position within the track list
    pub fn translations(&self, at: Option<&EpisodeKey>) -> Result<TranslationSet, ProviderError> {
        let mut set = TranslationSet::new();
        for (index, track) in self.tracks(at)?.iter().enumerate() {
            let mut label = if track.label.is_empty() {
                format!("Track {}", index + 1)
            } else {
                track.label.clone()
            };
            if set.iter().any(|(existing, _)| existing == label) {
                label = format!("{label} ({})", index + 1);
            }
            set.insert(label, index.to_string());
        }
        Ok(set)
    }

    pub fn seasons(&self) -> IndexMap<String, String> {
        match &self.layout {
            EmbedLayout::Series { seasons } => seasons
                .iter()
                .map(|(id, season)| (id.clone(), season.label.clone()))
                .collect(),
            EmbedLayout::Movie { .. } => IndexMap::new(),
        }
    }

    pub fn episodes(&self, season_id: &str) -> Result<IndexMap<String, String>, ProviderError> {
        Ok(self
            .season(season_id)?
            .episodes
            .iter()
            .map(|(id, episode)| (id.clone(), episode.label.clone()))
            .collect())
    }

    pub fn streams(
        &self,
        translation: &TranslationChoice,
        episode: Option<&EpisodeKey>,
    ) -> Result<StreamSet, ProviderError> {
        let episode = match self.content.kind {
            ContentKind::Series => Some(episode.ok_or(ProviderError::SelectionRequired)?),
            ContentKind::Movie => None,
        };

        let (_, index) = self.translations(episode)?.resolve(translation)?;
        let track = index
            .parse::<usize>()
            .ok()
            .and_then(|i| self.tracks(episode).ok()?.get(i))
            .ok_or_else(|| ProviderError::undefined("Translation", index.as_str()))?;

        let resolutions = parse_quality_list(&track.file)?;
        Ok(StreamSet::new(episode, resolutions, SubtitleSet::default()))
    }
}

/// Builds a session for an embed host from its iframe URL
pub(crate) fn embed_session(
    provider: ProviderKind,
    iframe_url: &str,
    transport: std::sync::Arc<dyn crate::session::Transport>,
) -> Result<ProviderSession, ProviderError> {
    let parsed = url::Url::parse(iframe_url)
        .map_err(|e| ProviderError::NotFound(format!("invalid iframe URL '{iframe_url}': {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| ProviderError::NotFound(format!("iframe URL without host: {iframe_url}")))?;

    Ok(ProviderSession::new(provider.name(), host, transport)
        .with_header(
            "Accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
        )
        .with_header("Accept-Language", "ru-RU,ru;q=0.8,en-US;q=0.5,en;q=0.3")
        .with_header("Referer", EMBED_REFERER))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_player_config() {
        let html = r#"<html><body>
            <script>var x = 1;</script>
            <script>var player = new Playerjs({"title":"Film","poster":"p.jpg","file":[{"title":"Дубляж","file":"[720p]u"}]}); player.play();</script>
            </body></html>"#;
        let config = extract_player_config(html).unwrap();
        assert_eq!(config.title.as_deref(), Some("Film"));
        let PlayerFile::Nodes(nodes) = config.file else {
            panic!("expected nodes");
        };
        assert_eq!(nodes[0].title, "Дубляж");
    }

    #[test]
    fn test_extract_javascript_literal() {
        let config = extract_player_config(
            r#"<script>var player = new Playerjs({id:"player", title:'Heat', file:'[720p]http://a',});</script>"#,
        )
        .unwrap();
        assert_eq!(config.title.as_deref(), Some("Heat"));
        assert!(matches!(config.file, PlayerFile::Leaf(ref file) if file == "[720p]http://a"));

        let config = extract_player_config(
            "<script>new Playerjs({file: [{title: 'Дубляж', file: '[480p]http://b'}]});</script>",
        )
        .unwrap();
        let PlayerFile::Nodes(nodes) = config.file else {
            panic!("expected nodes");
        };
        assert_eq!(nodes[0].title, "Дубляж");
    }

    #[test]
    fn test_extract_player_config_errors() {
        assert!(matches!(
            extract_player_config("<script>nothing</script>"),
            Err(ProviderError::Upstream(_))
        ));
        assert!(matches!(
            extract_player_config("<script>new Playerjs({file: [});</script>"),
            Err(ProviderError::Decode(_))
        ));
    }

    #[test]
    fn test_quality_list_reversed_and_cut_at_auto() {
        let resolutions = parse_quality_list(
            "[1080p MP4]http://hd,[720p]http://md,[480p]http://sd,[Авто]http://auto,[360p]http://ld",
        )
        .unwrap();
        let pairs: Vec<(String, String)> = resolutions.into_iter().collect();
        assert_eq!(
            pairs,
            vec![
                ("480p".to_string(), "http://sd".to_string()),
                ("720p".to_string(), "http://md".to_string()),
                ("1080p".to_string(), "http://hd".to_string()),
            ]
        );
    }

    #[test]
    fn test_quality_list_malformed() {
        assert!(matches!(
            parse_quality_list("http://no-label"),
            Err(ProviderError::Decode(_))
        ));
    }

    #[test]
    fn test_split_combined_leaf() {
        let file = "[480p]{Дубляж}http://a480;{Оригинал}http://b480,[720p]{Дубляж}http://a720;{Оригинал}http://b720";
        assert_eq!(brace_labels(file), vec!["Дубляж", "Оригинал"]);

        let tracks = split_combined(file, "unused");
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[1].label, "Оригинал");
        assert_eq!(tracks[1].file, "[480p]http://b480,[720p]http://b720");
    }

    #[test]
    fn test_split_plain_leaf() {
        let tracks = split_combined("[720p]http://a", "Default");
        assert_eq!(
            tracks,
            vec![Track {
                label: "Default".into(),
                file: "[720p]http://a".into()
            }]
        );
    }

    #[test]
    fn test_every_episode_gets_its_own_id() {
        let leaf = |title: &str, url: &str| PlayerNode {
            title: title.into(),
            file: Some(format!("[720p]{url}")),
            folder: None,
        };
        let season = PlayerNode {
            title: "Сезон 3".into(),
            file: None,
            folder: Some(vec![
                leaf("Серия 1", "http://e1"),
                leaf("Серия 1 (режиссёрская версия)", "http://e1dc"),
                leaf("Спецвыпуск", "http://special"),
                leaf("Серия 3", "http://e3"),
            ]),
        };

        let EmbedLayout::Series { seasons } = season_first_layout(&[season]) else {
            panic!("expected a series");
        };
        assert_eq!(seasons.keys().collect::<Vec<_>>(), vec!["1"]);

        let episodes: Vec<(&str, &str)> = seasons["1"]
            .episodes
            .iter()
            .map(|(id, episode)| (id.as_str(), episode.label.as_str()))
            .collect();
        assert_eq!(
            episodes,
            vec![
                ("1", "Серия 1"),
                ("2", "Серия 1 (режиссёрская версия)"),
                ("3", "Спецвыпуск"),
                ("4", "Серия 3"),
            ]
        );
        assert_eq!(seasons["1"].episodes["3"].tracks[0].file, "[720p]http://special");
    }

    fn series() -> EmbedContent {
        let track = |label: &str, file: &str| Track {
            label: label.into(),
            file: file.into(),
        };
        let mut episodes = IndexMap::new();
        episodes.insert(
            "1".to_string(),
            Episode {
                label: "Серия 1".into(),
                tracks: vec![
                    track("Дубляж", "[480p]http://d480,[720p]http://d720"),
                    track("Дубляж", "[480p]http://x480"),
                ],
            },
        );
        let mut seasons = IndexMap::new();
        seasons.insert(
            "1".to_string(),
            Season {
                label: "Сезон 1".into(),
                episodes,
            },
        );
        let config = PlayerConfig {
            title: Some("Show".into()),
            poster: None,
            file: PlayerFile::Leaf(String::new()),
        };
        EmbedContent::new(
            ProviderKind::Vibix,
            "https://embed.test/1",
            "361",
            &config,
            EmbedLayout::Series { seasons },
        )
    }

    #[test]
    fn test_series_operations() {
        let content = series();
        assert_eq!(content.content.kind, ContentKind::Series);
        assert_eq!(content.seasons()["1"], "Сезон 1");
        assert_eq!(content.episodes("1").unwrap()["1"], "Серия 1");
        assert_eq!(
            content.episodes("2").unwrap_err().to_string(),
            "Season \"2\" is not defined"
        );

        let translations = content.translations(None).unwrap();
        assert_eq!(
            translations.iter().collect::<Vec<_>>(),
            vec![("Дубляж", "0"), ("Дубляж (2)", "1")]
        );

        let stream = content
            .streams(&TranslationChoice::Index(0), Some(&EpisodeKey::new("1", "1")))
            .unwrap();
        assert_eq!(stream.resolutions.keys().collect::<Vec<_>>(), vec!["720p", "480p"]);

        assert!(matches!(
            content.streams(&TranslationChoice::Index(0), None),
            Err(ProviderError::SelectionRequired)
        ));
        assert_eq!(
            content
                .streams(&TranslationChoice::Index(0), Some(&EpisodeKey::new("1", "7")))
                .unwrap_err()
                .to_string(),
            "Episode \"7\" is not defined"
        );
    }
}
