//! Stream providers
//!
//! This module defines the data model shared by every upstream site
//! (content references, translation sets, series structure) and the
//! `StreamProvider` trait each site implements. `Provider` is the closed set
//! of supported sites; callers dispatch through it and query
//! `Provider::supports` before using an optional capability.

pub mod embed;
pub mod rezka;

pub use embed::{TurboProvider, VibixProvider};
pub use rezka::{RezkaOptions, RezkaProvider};

use crate::codec::CodecError;
use crate::stream::StreamSet;
use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur while resolving content on a provider
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The query or URL did not lead to any content
    #[error("Not found: {0}")]
    NotFound(String),

    /// A caller-supplied identifier is absent from the already fetched structure
    #[error("{kind} \"{id}\" is not defined")]
    Validation { kind: &'static str, id: String },

    /// Series content needs both a season and an episode
    #[error("Series content requires a season and an episode")]
    SelectionRequired,

    /// The login endpoint reported failure
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Network failure or an unexpected reply shape
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// The manifest could not be decoded
    #[error("Failed to decode manifest: {0}")]
    Decode(String),

    /// The provider variant does not offer this capability
    #[error("Provider {provider} does not support {capability}")]
    Unsupported {
        provider: ProviderKind,
        capability: Capability,
    },
}

impl ProviderError {
    /// Shorthand for a `Validation` error
    pub fn undefined(kind: &'static str, id: impl Into<String>) -> Self {
        ProviderError::Validation {
            kind,
            id: id.into(),
        }
    }
}

impl From<CodecError> for ProviderError {
    fn from(e: CodecError) -> Self {
        ProviderError::Decode(e.to_string())
    }
}

/// The supported upstream sites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// HTML-scraped streaming portal
    #[serde(rename = "hdrezka")]
    Rezka,
    /// Playerjs iframe embed, season-first layout
    Vibix,
    /// Playerjs iframe embed, translation-first layout
    Turbo,
}

impl ProviderKind {
    /// Name used by the catalog and on the command line
    pub fn name(self) -> &'static str {
        match self {
            ProviderKind::Rezka => "hdrezka",
            ProviderKind::Vibix => "vibix",
            ProviderKind::Turbo => "turbo",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProviderKind {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hdrezka" | "rezka" => Ok(ProviderKind::Rezka),
            "vibix" => Ok(ProviderKind::Vibix),
            "turbo" => Ok(ProviderKind::Turbo),
            _ => Err(ProviderError::NotFound(format!("unknown provider '{s}'"))),
        }
    }
}

/// One operation of the uniform provider surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Capability {
    Translations,
    Seasons,
    Episodes,
    Streams,
    PlayableUrl,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Translations => "translations",
            Capability::Seasons => "seasons",
            Capability::Episodes => "episodes",
            Capability::Streams => "streams",
            Capability::PlayableUrl => "playable url",
        };
        f.write_str(name)
    }
}

/// Whether a title is a single movie or an episodic series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Movie,
    Series,
}

/// Resolved identity of a title on one provider
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContentRef {
    /// The provider this reference belongs to
    pub provider: ProviderKind,
    /// Canonical page or iframe URL
    pub canonical_url: String,
    /// Provider-internal id used by every follow-up request
    pub internal_id: String,
    /// Human readable title
    pub display_name: String,
    /// Movie or series
    pub kind: ContentKind,
    /// Poster image, when the page exposes one
    pub poster_url: Option<String>,
}

/// Ordered mapping from translation label to translation id
///
/// Insertion order is the order upstream presents the translations in.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TranslationSet(IndexMap<String, String>);

impl TranslationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a translation; a repeated label keeps its position and takes the new id
    pub fn insert(&mut self, label: impl Into<String>, id: impl Into<String>) {
        self.0.insert(label.into(), id.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates `(label, id)` pairs in presentation order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(l, i)| (l.as_str(), i.as_str()))
    }

    /// Looks up the label of a translation id
    pub fn label_of(&self, id: &str) -> Option<&str> {
        self.iter().find(|(_, i)| *i == id).map(|(l, _)| l)
    }

    /// Resolves a caller's choice into a `(label, id)` pair
    pub fn resolve(&self, choice: &TranslationChoice) -> Result<(String, String), ProviderError> {
        let found = match choice {
            TranslationChoice::Id(id) => self.label_of(id).map(|label| (label, id.as_str())),
            TranslationChoice::Label(label) => self
                .0
                .get_key_value(label)
                .map(|(l, i)| (l.as_str(), i.as_str())),
            TranslationChoice::Index(index) => self
                .0
                .get_index(*index)
                .map(|(l, i)| (l.as_str(), i.as_str())),
        };

        found
            .map(|(label, id)| (label.to_string(), id.to_string()))
            .ok_or_else(|| ProviderError::undefined("Translation", choice.to_string()))
    }
}

/// How a caller picks a translation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslationChoice {
    /// Provider translation id
    Id(String),
    /// Human readable label
    Label(String),
    /// Position in the translation set
    Index(usize),
}

impl TranslationChoice {
    /// Interprets user input: all-digit text is an id, anything else a label
    pub fn from_user(input: &str) -> Self {
        if !input.is_empty() && input.chars().all(|c| c.is_ascii_digit()) {
            TranslationChoice::Id(input.to_string())
        } else {
            TranslationChoice::Label(input.to_string())
        }
    }
}

impl Default for TranslationChoice {
    fn default() -> Self {
        TranslationChoice::Index(0)
    }
}

impl fmt::Display for TranslationChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranslationChoice::Id(id) => f.write_str(id),
            TranslationChoice::Label(label) => f.write_str(label),
            TranslationChoice::Index(index) => write!(f, "{index}"),
        }
    }
}

/// A season and episode selection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EpisodeKey {
    pub season: String,
    pub episode: String,
}

impl EpisodeKey {
    pub fn new(season: impl Into<String>, episode: impl Into<String>) -> Self {
        Self {
            season: season.into(),
            episode: episode.into(),
        }
    }
}

/// Seasons and episodes available for one translation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SeriesStructure {
    /// season id -> label
    pub seasons: IndexMap<String, String>,
    /// season id -> (episode id -> label), in upstream order
    pub episodes: IndexMap<String, IndexMap<String, String>>,
}

impl SeriesStructure {
    /// Episodes of one season, or a `Validation` error naming the season
    pub fn episodes_of(&self, season: &str) -> Result<&IndexMap<String, String>, ProviderError> {
        self.episodes
            .get(season)
            .ok_or_else(|| ProviderError::undefined("Season", season))
    }

    /// Checks a selection against the structure, season first
    pub fn validate(&self, key: &EpisodeKey) -> Result<(), ProviderError> {
        if self.episodes_of(&key.season)?.contains_key(&key.episode) {
            Ok(())
        } else {
            Err(ProviderError::undefined("Episode", key.episode.as_str()))
        }
    }
}

/// The uniform operation set every upstream site implements
///
/// Operations a site cannot offer keep the default body, which reports
/// `ProviderError::Unsupported`; `CAPABILITIES` lists what is implemented.
pub trait StreamProvider: Send + Sync {
    /// Which site this is
    const KIND: ProviderKind;

    /// The operations this site implements
    const CAPABILITIES: &'static [Capability];

    /// The resolved content this provider instance works on
    fn content(&self) -> &ContentRef;

    /// Lists translations; sites that scope translations per episode use `at`
    fn translations(&self, at: Option<&EpisodeKey>) -> Result<TranslationSet, ProviderError>;

    /// Lists seasons (id -> label) for a translation
    fn seasons(&self, _translation_id: &str) -> Result<IndexMap<String, String>, ProviderError> {
        Err(unsupported(Self::KIND, Capability::Seasons))
    }

    /// Lists episodes (id -> label) of a season for a translation
    fn episodes(
        &self,
        _translation_id: &str,
        _season_id: &str,
    ) -> Result<IndexMap<String, String>, ProviderError> {
        Err(unsupported(Self::KIND, Capability::Episodes))
    }

    /// Resolves the resolution -> URL map for a selection
    fn streams(
        &self,
        translation: &TranslationChoice,
        episode: Option<&EpisodeKey>,
    ) -> Result<StreamSet, ProviderError>;

    /// Turns a resolved stream URL into one a set-top client can play
    fn playable_url(&self, url: &str) -> String {
        downgrade_scheme(url)
    }
}

fn unsupported(provider: ProviderKind, capability: Capability) -> ProviderError {
    ProviderError::Unsupported {
        provider,
        capability,
    }
}

/// Rewrites an https URL to plain http
pub(crate) fn downgrade_scheme(url: &str) -> String {
    match url.strip_prefix("https://") {
        Some(rest) => format!("http://{rest}"),
        None => url.to_string(),
    }
}

/// A concrete provider instance, one variant per supported site
pub enum Provider {
    Rezka(RezkaProvider),
    Vibix(VibixProvider),
    Turbo(TurboProvider),
}

macro_rules! dispatch {
    ($self:expr, $p:ident => $body:expr) => {
        match $self {
            Provider::Rezka($p) => $body,
            Provider::Vibix($p) => $body,
            Provider::Turbo($p) => $body,
        }
    };
}

impl Provider {
    pub fn kind(&self) -> ProviderKind {
        match self {
            Provider::Rezka(_) => RezkaProvider::KIND,
            Provider::Vibix(_) => VibixProvider::KIND,
            Provider::Turbo(_) => TurboProvider::KIND,
        }
    }

    /// The operations this variant implements
    pub fn capabilities(&self) -> &'static [Capability] {
        match self {
            Provider::Rezka(_) => RezkaProvider::CAPABILITIES,
            Provider::Vibix(_) => VibixProvider::CAPABILITIES,
            Provider::Turbo(_) => TurboProvider::CAPABILITIES,
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Fails with `ProviderError::Unsupported` unless this variant offers `capability`
    pub fn require(&self, capability: Capability) -> Result<(), ProviderError> {
        if self.supports(capability) {
            Ok(())
        } else {
            Err(unsupported(self.kind(), capability))
        }
    }

    pub fn content(&self) -> &ContentRef {
        dispatch!(self, p => p.content())
    }

    pub fn translations(&self, at: Option<&EpisodeKey>) -> Result<TranslationSet, ProviderError> {
        dispatch!(self, p => p.translations(at))
    }

    pub fn seasons(&self, translation_id: &str) -> Result<IndexMap<String, String>, ProviderError> {
        dispatch!(self, p => p.seasons(translation_id))
    }

    pub fn episodes(
        &self,
        translation_id: &str,
        season_id: &str,
    ) -> Result<IndexMap<String, String>, ProviderError> {
        dispatch!(self, p => p.episodes(translation_id, season_id))
    }

    pub fn streams(
        &self,
        translation: &TranslationChoice,
        episode: Option<&EpisodeKey>,
    ) -> Result<StreamSet, ProviderError> {
        dispatch!(self, p => p.streams(translation, episode))
    }

    pub fn playable_url(&self, url: &str) -> String {
        dispatch!(self, p => p.playable_url(url))
    }
}
