//! Translation-first embed provider
//!
//! Series payloads nest translation -> season -> episode, or season ->
//! episode with all translations combined in one `{label}`-tagged leaf.
//! Either way the tree is regrouped so translations sit under episodes.

use super::{
    EmbedContent, EmbedLayout, Episode, PlayerConfig, PlayerFile, PlayerNode, Season, Track,
    depth, embed_session, fetch_player, position_id, season_first_layout, split_combined, tracks_of,
};
use crate::providers::{
    Capability, ContentRef, EpisodeKey, ProviderError, ProviderKind, StreamProvider,
    TranslationChoice, TranslationSet,
};
use crate::session::{Transport, USER_AGENT};
use crate::stream::StreamSet;
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::info;

pub struct TurboProvider {
    embed: EmbedContent,
}

impl TurboProvider {
    /// Loads the embed page behind `iframe_url`
    pub fn open(
        transport: Arc<dyn Transport>,
        iframe_url: &str,
        cross_ref_id: &str,
    ) -> Result<Self, ProviderError> {
        let session = embed_session(Self::KIND, iframe_url, transport)?
            .with_header("User-Agent", USER_AGENT);
        let config = fetch_player(&session, iframe_url)?;
        let provider = Self::from_config(iframe_url, cross_ref_id, &config);
        info!(title = %provider.embed.content.display_name, "opened turbo embed");
        Ok(provider)
    }

    pub(crate) fn from_config(iframe_url: &str, cross_ref_id: &str, config: &PlayerConfig) -> Self {
        Self {
            embed: EmbedContent::new(Self::KIND, iframe_url, cross_ref_id, config, layout(config)),
        }
    }
}

fn layout(config: &PlayerConfig) -> EmbedLayout {
    match &config.file {
        PlayerFile::Leaf(file) => EmbedLayout::Movie {
            tracks: split_combined(file, config.title.as_deref().unwrap_or_default()),
        },
        PlayerFile::Nodes(nodes) => match depth(nodes) {
            0 | 1 => EmbedLayout::Movie {
                tracks: tracks_of(nodes),
            },
            2 => season_first_layout(nodes),
            _ => translation_first_layout(nodes),
        },
    }
}

/// Regroups a translation -> season -> episode tree by season and episode
///
/// Nodes are matched across translations by position, so the n-th episode
/// of every translation lands in the same `Episode`.
fn translation_first_layout(nodes: &[PlayerNode]) -> EmbedLayout {
    let mut seasons: IndexMap<String, Season> = IndexMap::new();

    for translation in nodes {
        let label = translation.title.trim();
        for (season_pos, season_node) in translation.children().iter().enumerate() {
            let season = seasons
                .entry(position_id(season_pos))
                .or_insert_with(|| Season {
                    label: season_node.title.trim().to_string(),
                    episodes: IndexMap::new(),
                });

            for (episode_pos, episode_node) in season_node.children().iter().enumerate() {
                let Some(file) = &episode_node.file else {
                    continue;
                };
                season
                    .episodes
                    .entry(position_id(episode_pos))
                    .or_insert_with(|| Episode {
                        label: episode_node.title.trim().to_string(),
                        tracks: Vec::new(),
                    })
                    .tracks
                    .push(Track {
                        label: label.to_string(),
                        file: file.clone(),
                    });
            }
        }
    }

    EmbedLayout::Series { seasons }
}

impl StreamProvider for TurboProvider {
    const KIND: ProviderKind = ProviderKind::Turbo;
    const CAPABILITIES: &'static [Capability] = &[
        Capability::Translations,
        Capability::Seasons,
        Capability::Episodes,
        Capability::Streams,
        Capability::PlayableUrl,
    ];

    fn content(&self) -> &ContentRef {
        &self.embed.content
    }

    fn translations(&self, at: Option<&EpisodeKey>) -> Result<TranslationSet, ProviderError> {
        self.embed.translations(at)
    }

    fn seasons(&self, _translation_id: &str) -> Result<IndexMap<String, String>, ProviderError> {
        Ok(self.embed.seasons())
    }

    fn episodes(
        &self,
        _translation_id: &str,
        season_id: &str,
    ) -> Result<IndexMap<String, String>, ProviderError> {
        self.embed.episodes(season_id)
    }

    fn streams(
        &self,
        translation: &TranslationChoice,
        episode: Option<&EpisodeKey>,
    ) -> Result<StreamSet, ProviderError> {
        self.embed.streams(translation, episode)
    }
}
