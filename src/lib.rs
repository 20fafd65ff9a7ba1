//! Balancer Bridge - Resolve playable stream links from video balancer sites
//!
//! This library walks "search -> translation -> season -> episode ->
//! quality" on several unrelated upstream sites through one interface:
//!
//! - [`catalog`] finds titles and the embed iframes that serve them
//! - [`providers`] implements the uniform operation set per upstream site
//! - [`bulk`] resolves a whole season concurrently
//!
//! [`Bridge`] ties them together from a [`BridgeConfig`].

pub mod bulk;
pub mod cache;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod providers;
pub mod session;
pub mod stream;

use cache::CacheStorage;
use catalog::Catalog;
use indexmap::IndexMap;
use session::{CookieJar, HttpTransport, ProviderSession, Transport};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::warn;

// Re-export error types
pub use bulk::BulkError;
pub use cache::CacheError;
pub use catalog::CatalogError;
pub use codec::CodecError;
pub use config::{BridgeConfig, ConfigError};
pub use providers::ProviderError;

// Re-export the types callers walk through
pub use bulk::{BulkOptions, RetryPolicy};
pub use catalog::{IframeInfo, SearchHit};
pub use codec::{ManifestEncoding, TextDecoding};
pub use providers::{
    Capability, ContentKind, ContentRef, EpisodeKey, Provider, ProviderKind, SeriesStructure,
    TranslationChoice, TranslationSet,
};
pub use session::Credentials;
pub use stream::{StreamSet, SubtitleSet, SubtitleTrack};

/// Errors that can occur while using the bridge
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Bulk(#[from] BulkError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to write output: {0}")]
    Output(#[from] std::io::Error),
}

/// Entry point tying the catalog, the providers and the caches together
pub struct Bridge {
    config: BridgeConfig,
    transport: Arc<dyn Transport>,
    catalog: Catalog,
    cookie_cache: Option<CacheStorage<CookieJar>>,
    /// Portal session, authenticated on first use
    rezka: Mutex<Option<ProviderSession>>,
}

impl Bridge {
    /// Creates a bridge talking to the real upstreams
    pub fn new(config: BridgeConfig) -> Result<Self, BridgeError> {
        let transport = Arc::new(HttpTransport::new(config.timeout)?);
        Self::with_transport(config, transport)
    }

    /// Creates a bridge on top of any transport
    ///
    /// Caches that cannot be opened are skipped with a warning; the bridge
    /// then logs in on every run and uses the configured catalog host.
    pub fn with_transport(
        config: BridgeConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, BridgeError> {
        config.validate()?;

        let cache_dir = config.cache_dir.as_deref();
        let cookie_cache = open_optional(CacheStorage::open("credentials", cache_dir));
        let domain_cache = open_optional(CacheStorage::open("catalog", cache_dir));

        let catalog = Catalog::new(
            transport.clone(),
            config.catalog_base_url.as_deref(),
            &config.discovery_url,
            domain_cache,
        );

        Ok(Self {
            config,
            transport,
            catalog,
            cookie_cache,
            rezka: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Searches the catalog by title
    pub fn search(&self, query: &str) -> Result<Vec<SearchHit>, BridgeError> {
        Ok(self.catalog.search(query)?)
    }

    /// Names the providers that serve a cross-reference id
    pub fn providers(
        &self,
        cross_ref_id: &str,
        query: Option<&str>,
    ) -> Result<Vec<ProviderKind>, BridgeError> {
        let rezka = self.rezka_session()?;
        Ok(self
            .catalog
            .providers(cross_ref_id, query, &rezka, &self.config.rezka_options())?)
    }

    /// Opens a title on the named provider
    pub fn open_provider(
        &self,
        kind: ProviderKind,
        cross_ref_id: &str,
        query: Option<&str>,
    ) -> Result<Provider, BridgeError> {
        let rezka = self.rezka_session()?;
        Ok(self.catalog.open_provider(
            kind,
            cross_ref_id,
            query,
            rezka,
            self.config.rezka_options(),
        )?)
    }

    /// Opens a title on the scraped portal from its page URL
    pub fn open_rezka_url(&self, url: &str) -> Result<Provider, BridgeError> {
        let rezka = self.rezka_session()?;
        let provider =
            providers::RezkaProvider::open_url(rezka, url, self.config.rezka_options())?;
        Ok(Provider::Rezka(provider))
    }

    /// Resolves every episode of a season
    ///
    /// `progress` receives `(completed, total)` after every settled episode.
    pub fn season_streams<P>(
        &self,
        provider: &Provider,
        translation: &TranslationChoice,
        season: &str,
        progress: P,
    ) -> Result<IndexMap<String, Option<StreamSet>>, BridgeError>
    where
        P: Fn(usize, usize) + Sync,
    {
        Ok(bulk::resolve_season(
            provider,
            translation,
            season,
            &self.config.bulk,
            progress,
        )?)
    }

    /// Looks up and persists the current catalog API host
    pub fn refresh_domain(&mut self) -> Result<String, BridgeError> {
        Ok(self.catalog.refresh_base_url()?)
    }

    /// The portal session, logging in on first use
    fn rezka_session(&self) -> Result<ProviderSession, BridgeError> {
        let mut slot = self.rezka.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = slot.as_ref() {
            return Ok(session.clone());
        }

        let session = ProviderSession::new(
            ProviderKind::Rezka.name(),
            &self.config.rezka_host,
            self.transport.clone(),
        )
        .authenticate(
            &providers::rezka::LOGIN,
            self.config.credentials.as_ref(),
            self.cookie_cache.as_ref(),
            self.config.relogin,
        )?;

        *slot = Some(session.clone());
        Ok(session)
    }
}

fn open_optional<T>(cache: Result<CacheStorage<T>, CacheError>) -> Option<CacheStorage<T>> {
    match cache {
        Ok(cache) => Some(cache),
        Err(e) => {
            warn!(error = %e, "continuing without cache");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use session::Method;
    use session::testing::FakeTransport;
    use std::time::Duration;

    const PAGE: &str = r#"<html><head><meta property="og:type" content="video.movie"></head>
        <body><input id="post_id" value="41170"><div class="b-post__title"><h1>Fight Club</h1></div>
        <ul id="translators-list"><li data-translator_id="56">Дубляж</li></ul></body></html>"#;

    fn config(dir: &std::path::Path) -> BridgeConfig {
        BridgeConfig {
            rezka_host: "rezka.test".into(),
            credentials: Some(Credentials {
                login: "user@example.org".into(),
                password: "secret".into(),
            }),
            catalog_base_url: Some("https://api.test".into()),
            pacing: Duration::ZERO,
            cache_dir: Some(dir.to_path_buf()),
            ..BridgeConfig::default()
        }
    }

    fn transport() -> Arc<FakeTransport> {
        Arc::new(
            FakeTransport::new()
                .route(Method::Post, "/ajax/login/", &[], r#"{"success":true}"#)
                .with_cookies(&[("PHPSESSID", "x"), ("dle_user_id", "42")])
                .route(Method::Get, "/films/41170-fight-club.html", &[], PAGE)
                .route(
                    Method::Post,
                    "/ajax/get_cdn_series/",
                    &[("action", "get_movie")],
                    r#"{"success":true,"url":"[720p]http://a or http://b","subtitle":false}"#,
                ),
        )
    }

    #[test]
    fn test_logs_in_once_and_reuses_session() {
        let dir = tempfile::tempdir().unwrap();
        let transport = transport();
        let bridge = Bridge::with_transport(config(dir.path()), transport.clone()).unwrap();

        let provider = bridge
            .open_rezka_url("https://mirror.test/films/41170-fight-club.html")
            .unwrap();
        bridge
            .open_rezka_url("https://rezka.test/films/41170-fight-club.html")
            .unwrap();

        let logins = transport
            .requests()
            .iter()
            .filter(|r| r.url.ends_with("/ajax/login/"))
            .count();
        assert_eq!(logins, 1);

        let page_request = &transport.requests()[1];
        assert_eq!(page_request.url, "https://rezka.test/films/41170-fight-club.html");
        assert!(page_request.cookie_header().unwrap().contains("dle_user_id=42"));

        let stream = provider.streams(&TranslationChoice::default(), None).unwrap();
        assert_eq!(provider.playable_url(stream.url_for("720").unwrap()), "http://b");
    }

    #[test]
    fn test_cached_cookies_survive_restart() {
        let dir = tempfile::tempdir().unwrap();

        let first = transport();
        Bridge::with_transport(config(dir.path()), first.clone())
            .unwrap()
            .open_rezka_url("https://rezka.test/films/41170-fight-club.html")
            .unwrap();

        let second = transport();
        Bridge::with_transport(config(dir.path()), second.clone())
            .unwrap()
            .open_rezka_url("https://rezka.test/films/41170-fight-club.html")
            .unwrap();

        assert!(second.requests().iter().all(|r| !r.url.ends_with("/ajax/login/")));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = BridgeConfig {
            rezka_host: String::new(),
            ..BridgeConfig::default()
        };
        assert!(matches!(
            Bridge::with_transport(config, Arc::new(FakeTransport::new())),
            Err(BridgeError::Config(_))
        ));
    }
}
