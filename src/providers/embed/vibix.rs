//! Season-first embed provider
//!
//! Series payloads nest season -> episode -> translation; movie payloads
//! are a flat translation list.

use super::{
    EmbedContent, EmbedLayout, PlayerConfig, PlayerFile, depth, embed_session, fetch_player,
    season_first_layout, split_combined, tracks_of,
};
use crate::providers::{
    Capability, ContentRef, EpisodeKey, ProviderError, ProviderKind, StreamProvider,
    TranslationChoice, TranslationSet,
};
use crate::session::Transport;
use crate::stream::StreamSet;
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::info;

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:133.0) Gecko/20100101 Firefox/133.0";

pub struct VibixProvider {
    embed: EmbedContent,
}

impl VibixProvider {
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
        info!(title = %provider.embed.content.display_name, "opened vibix embed");
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
        PlayerFile::Nodes(nodes) if depth(nodes) <= 1 => EmbedLayout::Movie {
            tracks: tracks_of(nodes),
        },
        PlayerFile::Nodes(nodes) => season_first_layout(nodes),
    }
}

impl StreamProvider for VibixProvider {
    const KIND: ProviderKind = ProviderKind::Vibix;
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
