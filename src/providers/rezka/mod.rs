//! Scraped streaming portal provider.
//!
//! Content is addressed by its page URL. The page yields the internal post
//! id and the translation list; seasons and episodes come from one AJAX call
//! per translation, and streams from another AJAX call whose manifest may be
//! obfuscated (see `codec`).
mod page;
mod types;

use super::{
    Capability, ContentKind, ContentRef, EpisodeKey, ProviderError, ProviderKind,
    SeriesStructure, StreamProvider, TranslationChoice, TranslationSet, downgrade_scheme,
};
use crate::codec::{ManifestEncoding, decode_manifest};
use crate::session::{LoginScheme, ProviderSession};
use crate::stream::{StreamSet, SubtitleSet, parse_scraped_manifest};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use types::{EpisodesReply, StreamReply, present};

/// Default portal mirror
pub const DEFAULT_HOST: &str = "rezka.fi";

/// Login endpoint of the portal
pub const LOGIN: LoginScheme = LoginScheme {
    path: "/ajax/login/",
    transient_cookie: "PHPSESSID",
    client_cookie: ("hdmbbs", "1"),
};

const SEARCH_PATH: &str = "/search/";
const SERIES_PATH: &str = "/ajax/get_cdn_series/";

/// Tunables of the scraped portal provider
#[derive(Debug, Clone)]
pub struct RezkaOptions {
    /// How stream manifests are encoded
    pub encoding: ManifestEncoding,
    /// Minimum delay between two season/episode listing calls
    pub pacing: Duration,
    /// Search hits inspected by the title resolver
    pub search_candidates: usize,
}

impl Default for RezkaOptions {
    fn default() -> Self {
        Self {
            encoding: ManifestEncoding::Auto,
            pacing: Duration::from_millis(500),
            search_candidates: 2,
        }
    }
}

#[derive(Default)]
struct StructureCache {
    by_translation: HashMap<String, SeriesStructure>,
    last_fetch: Option<Instant>,
}

/// Provider for the scraped streaming portal
pub struct RezkaProvider {
    session: ProviderSession,
    content: ContentRef,
    /// Raw markup of the content page, parsed again on demand
    page: String,
    options: RezkaOptions,
    translations: OnceLock<TranslationSet>,
    structures: Mutex<StructureCache>,
}

impl RezkaProvider {
    /// Opens content from its page URL
    ///
    /// The URL is cut after `.html` and moved onto the session's host.
    pub fn open_url(
        session: ProviderSession,
        url: &str,
        options: RezkaOptions,
    ) -> Result<Self, ProviderError> {
        let canonical_url = canonical_url(url, session.base_host())?;
        let response = session.get(&canonical_url, &[])?;
        let info = page::parse_page(&response.body)?;

        info!(title = %info.title, id = %info.post_id, "opened content page");

        Ok(Self {
            content: ContentRef {
                provider: ProviderKind::Rezka,
                canonical_url,
                internal_id: info.post_id,
                display_name: info.title,
                kind: info.kind,
                poster_url: info.poster_url,
            },
            session,
            page: response.body,
            options,
            translations: OnceLock::new(),
            structures: Mutex::new(StructureCache::default()),
        })
    }

    /// Finds the page URL of a title by free-text query
    ///
    /// At most `search_candidates` hits are inspected. With a
    /// cross-reference id, each hit's page is fetched and only an exact id
    /// match is accepted; without one, the first hit wins. Candidates that
    /// fail to load are skipped.
    pub fn find(
        session: &ProviderSession,
        query: &str,
        cross_ref_id: Option<&str>,
        options: &RezkaOptions,
    ) -> Result<String, ProviderError> {
        let response = session.get(
            &session.url(SEARCH_PATH),
            &[("do", "search"), ("subaction", "search"), ("q", query)],
        )?;
        let candidates =
            page::search_results(&response.body, &session.url(""), options.search_candidates);

        for candidate in candidates {
            let Some(expected) = cross_ref_id else {
                return Ok(candidate);
            };

            match session.get(&candidate, &[]) {
                Ok(response) => match page::cross_ref_id(&response.body) {
                    Some(id) if id == expected => return Ok(candidate),
                    found => debug!(%candidate, ?found, expected, "cross-reference mismatch"),
                },
                Err(e) => warn!(%candidate, error = %e, "skipping search candidate"),
            }
        }

        Err(ProviderError::NotFound(query.to_string()))
    }

    /// Resolves a query to content: `find` followed by `open_url`
    pub fn resolve(
        session: ProviderSession,
        query: &str,
        cross_ref_id: Option<&str>,
        options: RezkaOptions,
    ) -> Result<Self, ProviderError> {
        let url = Self::find(&session, query, cross_ref_id, &options)?;
        Self::open_url(session, &url, options)
    }

    /// Other parts of the same franchise as `(title, url)` pairs
    pub fn other_parts(&self) -> Vec<(String, String)> {
        page::other_parts(&self.page, &self.content.canonical_url)
    }

    /// Season/episode structure of every translation, keyed by label
    ///
    /// Translations whose listing fails are left out.
    pub fn series_info(&self) -> Result<IndexMap<String, SeriesStructure>, ProviderError> {
        let mut info = IndexMap::new();
        for (label, id) in self.translation_set()?.iter() {
            match self.structure(id) {
                Ok(structure) => {
                    info.insert(label.to_string(), structure);
                }
                Err(e) => warn!(translation = label, error = %e, "no series structure"),
            }
        }
        Ok(info)
    }

    fn translation_set(&self) -> Result<&TranslationSet, ProviderError> {
        if let Some(set) = self.translations.get() {
            return Ok(set);
        }
        let set = page::translations(&self.page, self.content.kind);
        if set.is_empty() {
            return Err(ProviderError::Upstream(
                "content page lists no translations".to_string(),
            ));
        }
        Ok(self.translations.get_or_init(|| set))
    }

    /// Series structure of one translation, fetched once and then cached
    fn structure(&self, translation_id: &str) -> Result<SeriesStructure, ProviderError> {
        let mut cache = self.structures.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(structure) = cache.by_translation.get(translation_id) {
            return Ok(structure.clone());
        }

        if let Some(last) = cache.last_fetch {
            let elapsed = last.elapsed();
            if elapsed < self.options.pacing {
                std::thread::sleep(self.options.pacing - elapsed);
            }
        }
        cache.last_fetch = Some(Instant::now());

        debug!(translation = translation_id, "fetching episode listing");
        let reply: EpisodesReply = self
            .session
            .post_form(
                &self.session.url(SERIES_PATH),
                &[
                    ("id", &self.content.internal_id),
                    ("translator_id", translation_id),
                    ("action", "get_episodes"),
                ],
            )?
            .json()?;

        if !reply.success {
            return Err(ProviderError::Upstream(
                reply
                    .message
                    .unwrap_or_else(|| "episode listing refused".to_string()),
            ));
        }

        let structure = page::series_structure(
            present(reply.seasons).as_deref().unwrap_or_default(),
            present(reply.episodes).as_deref().unwrap_or_default(),
        );
        cache
            .by_translation
            .insert(translation_id.to_string(), structure.clone());
        Ok(structure)
    }
}

impl StreamProvider for RezkaProvider {
    const KIND: ProviderKind = ProviderKind::Rezka;
    const CAPABILITIES: &'static [Capability] = &[
        Capability::Translations,
        Capability::Seasons,
        Capability::Episodes,
        Capability::Streams,
        Capability::PlayableUrl,
    ];

    fn content(&self) -> &ContentRef {
        &self.content
    }

    fn translations(&self, _at: Option<&EpisodeKey>) -> Result<TranslationSet, ProviderError> {
        self.translation_set().cloned()
    }

    fn seasons(&self, translation_id: &str) -> Result<IndexMap<String, String>, ProviderError> {
        if self.content.kind == ContentKind::Movie {
            return Ok(IndexMap::new());
        }
        Ok(self.structure(translation_id)?.seasons)
    }

    fn episodes(
        &self,
        translation_id: &str,
        season_id: &str,
    ) -> Result<IndexMap<String, String>, ProviderError> {
        if self.content.kind == ContentKind::Movie {
            return Err(ProviderError::undefined("Season", season_id));
        }
        Ok(self.structure(translation_id)?.episodes_of(season_id)?.clone())
    }

    fn streams(
        &self,
        translation: &TranslationChoice,
        episode: Option<&EpisodeKey>,
    ) -> Result<StreamSet, ProviderError> {
        let (_, translation_id) = self.translation_set()?.resolve(translation)?;
        let id = self.content.internal_id.as_str();

        let (form, episode) = match self.content.kind {
            ContentKind::Movie => (
                vec![
                    ("id", id),
                    ("translator_id", translation_id.as_str()),
                    ("action", "get_movie"),
                ],
                None,
            ),
            ContentKind::Series => {
                let key = episode.ok_or(ProviderError::SelectionRequired)?;
                self.structure(&translation_id)?.validate(key)?;
                (
                    vec![
                        ("id", id),
                        ("translator_id", translation_id.as_str()),
                        ("season", key.season.as_str()),
                        ("episode", key.episode.as_str()),
                        ("action", "get_stream"),
                    ],
                    Some(key),
                )
            }
        };

        let reply: StreamReply = self
            .session
            .post_form(&self.session.url(SERIES_PATH), &form)?
            .json()?;

        if !reply.success {
            return Err(ProviderError::Upstream(
                reply
                    .message
                    .unwrap_or_else(|| "stream request refused".to_string()),
            ));
        }

        let raw = present(reply.url)
            .ok_or_else(|| ProviderError::Upstream("reply carries no manifest".to_string()))?;
        let manifest = decode_manifest(&raw, self.options.encoding)?;
        let resolutions = parse_scraped_manifest(&manifest)?;

        let subtitles = match present(reply.subtitle) {
            Some(data) => {
                let codes = present(reply.subtitle_lns).unwrap_or_default();
                SubtitleSet::parse(&data, &codes)?
            }
            None => SubtitleSet::default(),
        };

        Ok(StreamSet::new(episode, resolutions, subtitles))
    }

    /// Drops the HLS suffix the portal appends and downgrades the scheme
    fn playable_url(&self, url: &str) -> String {
        downgrade_scheme(url.split(":hls").next().unwrap_or(url))
    }
}

/// Cuts a content URL after `.html` and moves it onto `host`
fn canonical_url(url: &str, host: &str) -> Result<String, ProviderError> {
    let trimmed = match url.find(".html") {
        Some(pos) => &url[..pos + ".html".len()],
        None => url,
    };

    let mut parsed = url::Url::parse(trimmed)
        .map_err(|e| ProviderError::NotFound(format!("invalid content URL '{url}': {e}")))?;
    parsed
        .set_host(Some(host))
        .map_err(|e| ProviderError::NotFound(format!("invalid host '{host}': {e}")))?;

    Ok(parsed.to_string())
}
