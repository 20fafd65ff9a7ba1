//! Balancer catalog client
//!
//! The catalog maps a free-text query to titles carrying an external
//! cross-reference id, and a cross-reference id to the embed iframes that
//! serve it. Its API host moves from time to time; the current one is
//! published in the catalog front end's script bundle and can be refreshed
//! with [`Catalog::refresh_base_url`].

use crate::cache::{CacheError, CacheStorage};
use crate::providers::{
    Provider, ProviderError, ProviderKind, RezkaOptions, RezkaProvider, TurboProvider,
    VibixProvider,
};
use crate::session::{ProviderSession, Transport, UpstreamRequest};
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// API host used when nothing else is configured
pub const DEFAULT_BASE_URL: &str = "https://api4.rhserv.vu";

/// Front-end bundle that publishes the current API host
pub const DEFAULT_DISCOVERY_URL: &str = "https://reyohoho.serv00.net/assets/index-D3BeTuNy.js";

const ENDPOINTS_MARKER: &str = r#"api_endpoints:JSON.stringify([{url:""#;
const DOMAIN_KEY: &str = "domain";
const SEARCH_CODE: &str = "31";

/// Errors that can occur while talking to the catalog
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The catalog reply could not be parsed
    #[error("Failed to parse catalog reply: {0}")]
    Parse(String),

    /// The discovery script does not publish an API host
    #[error("No API endpoint found in {0}")]
    DomainNotFound(String),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// A catalog search result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// External cross-reference id
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub poster: Option<String>,
}

/// An embed iframe serving a title
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IframeInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub iframe: String,
}

/// Persisted API host override
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogDomain {
    pub api_base_url: String,
}

/// The catalog accepts ids both as strings and as numbers
fn id_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(text) => text,
        Id::Number(number) => number.to_string(),
    })
}

pub struct Catalog {
    transport: Arc<dyn Transport>,
    base_url: String,
    discovery_url: String,
    domain_cache: Option<CacheStorage<CatalogDomain>>,
}

impl Catalog {
    /// Creates a catalog client
    ///
    /// The API host is taken from the persisted override if there is one,
    /// then from `base_url`, then [`DEFAULT_BASE_URL`].
    pub fn new(
        transport: Arc<dyn Transport>,
        base_url: Option<&str>,
        discovery_url: &str,
        domain_cache: Option<CacheStorage<CatalogDomain>>,
    ) -> Self {
        let persisted = domain_cache
            .as_ref()
            .and_then(|cache| match cache.load(DOMAIN_KEY) {
                Ok(domain) => domain,
                Err(e) => {
                    warn!(error = %e, "ignoring unreadable catalog domain");
                    None
                }
            })
            .map(|domain| domain.api_base_url);

        let base_url = persisted
            .or_else(|| base_url.map(str::to_string))
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        debug!(%base_url, "catalog API host");

        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            discovery_url: discovery_url.to_string(),
            domain_cache,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Searches the catalog by title
    ///
    /// A non-2xx reply is treated as "no results".
    pub fn search(&self, query: &str) -> Result<Vec<SearchHit>, CatalogError> {
        let mut url = url::Url::parse(&self.base_url)
            .map_err(|e| CatalogError::Parse(format!("invalid API host '{}': {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|()| CatalogError::Parse(format!("invalid API host '{}'", self.base_url)))?
            .pop_if_empty()
            .push("search")
            .push(query);

        let response = self.transport.execute(
            UpstreamRequest::get(url.as_str())
                .query("code", SEARCH_CODE)
                .query("term", query),
        )?;
        if !response.is_success() {
            debug!(status = response.status, query, "catalog search failed");
            return Ok(Vec::new());
        }

        serde_json::from_str(&response.body).map_err(|e| CatalogError::Parse(e.to_string()))
    }

    /// Lists the embed iframes serving a cross-reference id
    ///
    /// A reply that is not a list yields no iframes.
    pub fn iframes(&self, cross_ref_id: &str) -> Result<Vec<IframeInfo>, CatalogError> {
        let response = self
            .transport
            .execute(
                UpstreamRequest::post(format!("{}/cache", self.base_url))
                    .form("kinopoisk", cross_ref_id),
            )?
            .error_for_status()?;

        let value: serde_json::Value =
            serde_json::from_str(&response.body).map_err(|e| CatalogError::Parse(e.to_string()))?;
        if !value.is_array() {
            debug!(cross_ref_id, "catalog returned no iframe list");
            return Ok(Vec::new());
        }

        serde_json::from_value(value).map_err(|e| CatalogError::Parse(e.to_string()))
    }

    /// Names the providers that can serve a title
    ///
    /// Embed providers come from the iframe list. The scraped portal is
    /// listed when it has an iframe or when the title resolver confirms
    /// `query` against `cross_ref_id`.
    pub fn providers(
        &self,
        cross_ref_id: &str,
        query: Option<&str>,
        rezka: &ProviderSession,
        rezka_options: &RezkaOptions,
    ) -> Result<Vec<ProviderKind>, CatalogError> {
        let mut kinds: Vec<ProviderKind> = Vec::new();

        for iframe in self.iframes(cross_ref_id)? {
            match iframe.name.parse::<ProviderKind>() {
                Ok(kind) if !kinds.contains(&kind) => kinds.push(kind),
                Ok(_) => {}
                Err(_) => debug!(name = %iframe.name, "skipping unknown iframe provider"),
            }
        }

        if let Some(query) = query {
            if !kinds.contains(&ProviderKind::Rezka) {
                match RezkaProvider::find(rezka, query, Some(cross_ref_id), rezka_options) {
                    Ok(_) => kinds.push(ProviderKind::Rezka),
                    Err(e) => debug!(query, error = %e, "title not on the scraped portal"),
                }
            }
        }

        info!(cross_ref_id, providers = ?kinds, "providers found");
        Ok(kinds)
    }

    /// Opens a title on the named provider
    pub fn open_provider(
        &self,
        kind: ProviderKind,
        cross_ref_id: &str,
        query: Option<&str>,
        rezka: ProviderSession,
        rezka_options: RezkaOptions,
    ) -> Result<Provider, CatalogError> {
        let iframe = self
            .iframes(cross_ref_id)?
            .into_iter()
            .find(|info| info.name.parse::<ProviderKind>().ok() == Some(kind) && !info.iframe.is_empty())
            .map(|info| info.iframe);

        let provider = match (kind, iframe, query) {
            (ProviderKind::Vibix, Some(iframe), _) => Provider::Vibix(VibixProvider::open(
                self.transport.clone(),
                &iframe,
                cross_ref_id,
            )?),
            (ProviderKind::Turbo, Some(iframe), _) => Provider::Turbo(TurboProvider::open(
                self.transport.clone(),
                &iframe,
                cross_ref_id,
            )?),
            (ProviderKind::Rezka, Some(url), _) => {
                Provider::Rezka(RezkaProvider::open_url(rezka, &url, rezka_options)?)
            }
            (ProviderKind::Rezka, None, Some(query)) => Provider::Rezka(RezkaProvider::resolve(
                rezka,
                query,
                Some(cross_ref_id),
                rezka_options,
            )?),
            (kind, _, _) => {
                return Err(ProviderError::NotFound(format!(
                    "{kind} does not serve '{cross_ref_id}'"
                ))
                .into());
            }
        };

        Ok(provider)
    }

    /// Looks up the current API host in the discovery script and persists it
    pub fn refresh_base_url(&mut self) -> Result<String, CatalogError> {
        let response = self
            .transport
            .execute(UpstreamRequest::get(self.discovery_url.as_str()))?
            .error_for_status()?;

        let endpoint = extract_endpoint(&response.body)
            .ok_or_else(|| CatalogError::DomainNotFound(self.discovery_url.clone()))?;
        let base_url = reduce_to_origin(endpoint);

        if let Some(cache) = &self.domain_cache {
            cache.store(
                DOMAIN_KEY,
                &CatalogDomain {
                    api_base_url: base_url.clone(),
                },
            )?;
        }

        info!(%base_url, "catalog API host updated");
        self.base_url = base_url.clone();
        Ok(base_url)
    }
}

fn extract_endpoint(script: &str) -> Option<&str> {
    let start = script.find(ENDPOINTS_MARKER)? + ENDPOINTS_MARKER.len();
    let rest = &script[start..];
    let end = rest.find("\",")?;
    Some(&rest[..end])
}

/// `https://host/path` becomes `https://host`; anything else is kept
fn reduce_to_origin(endpoint: &str) -> String {
    match endpoint.strip_prefix("https://") {
        Some(rest) => {
            let host = rest.split('/').next().unwrap_or_default();
            format!("https://{host}")
        }
        None => endpoint.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Method;
    use crate::session::testing::FakeTransport;

    fn catalog(transport: FakeTransport) -> (Catalog, Arc<FakeTransport>) {
        let transport = Arc::new(transport);
        let catalog = Catalog::new(
            transport.clone(),
            Some("https://api.test/"),
            "https://front.test/index.js",
            None,
        );
        (catalog, transport)
    }

    #[test]
    fn test_search_accepts_numeric_and_string_ids() {
        let (catalog, transport) = catalog(FakeTransport::new().route(
            Method::Get,
            "api.test/search/",
            &[],
            r#"[{"id":361,"title":"Бойцовский клуб","poster":"https://img.test/1.jpg"},{"id":"77","title":"Other"}]"#,
        ));

        let hits = catalog.search("бойцовский клуб").unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "361");
        assert_eq!(hits[1].id, "77");
        assert_eq!(hits[1].poster, None);

        let request = &transport.requests()[0];
        assert!(request.url.starts_with("https://api.test/search/"));
        assert!(request.query.contains(&("code".to_string(), "31".to_string())));
        assert!(request.query.contains(&("term".to_string(), "бойцовский клуб".to_string())));
    }

    #[test]
    fn test_search_http_error_is_empty() {
        struct Failing;
        impl Transport for Failing {
            fn execute(
                &self,
                _request: UpstreamRequest,
            ) -> Result<crate::session::UpstreamResponse, ProviderError> {
                Ok(crate::session::UpstreamResponse {
                    status: 500,
                    body: String::new(),
                    cookies: Vec::new(),
                })
            }
        }

        let catalog = Catalog::new(Arc::new(Failing), None, DEFAULT_DISCOVERY_URL, None);
        assert_eq!(catalog.base_url(), DEFAULT_BASE_URL);
        assert!(catalog.search("x").unwrap().is_empty());
    }

    #[test]
    fn test_iframes() {
        let (catalog, transport) = catalog(FakeTransport::new().route(
            Method::Post,
            "api.test/cache",
            &[("kinopoisk", "361")],
            r#"[{"name":"Vibix","iframe":"https://embed.test/1"},{"name":"collaps","iframe":"https://c.test/1"}]"#,
        ));

        let iframes = catalog.iframes("361").unwrap();
        assert_eq!(iframes[0].name, "Vibix");
        assert_eq!(iframes.len(), 2);
        assert_eq!(transport.count_form("kinopoisk", "361"), 1);
    }

    #[test]
    fn test_iframes_non_list_is_empty() {
        let (catalog, _) = catalog(FakeTransport::new().route(
            Method::Post,
            "/cache",
            &[],
            r#"{"error":"not found"}"#,
        ));
        assert!(catalog.iframes("1").unwrap().is_empty());
    }

    #[test]
    fn test_providers_deduplicates_and_confirms_portal() {
        let search = r#"<div class="b-content__inline_item"><div><a href="/films/361-fight-club.html">Fight Club</a></div></div>"#;
        let page = r#"<table class="b-post__info"><tr><td>
            <a target="_blank" href="/help/x/">a</a><a target="_blank" href="/help/aHR0cHMlM0ElMkYlMkZrcCUyRmZpbG0lMkYzNjElMkY%3D/">b</a>
            </td></tr></table>"#;
        let transport = Arc::new(
            FakeTransport::new()
                .route(
                    Method::Post,
                    "api.test/cache",
                    &[],
                    r#"[{"name":"turbo","iframe":"a"},{"name":"TURBO","iframe":"b"},{"name":"vibix","iframe":"c"},{"name":"alloha","iframe":"d"}]"#,
                )
                .route(Method::Get, "rezka.test/search/", &[], search)
                .route(Method::Get, "/films/361-fight-club.html", &[], page),
        );
        let catalog = Catalog::new(transport.clone(), Some("https://api.test"), "", None);
        let rezka = ProviderSession::new("hdrezka", "rezka.test", transport);

        let kinds = catalog
            .providers("361", Some("Fight Club"), &rezka, &RezkaOptions::default())
            .unwrap();
        assert_eq!(
            kinds,
            vec![ProviderKind::Turbo, ProviderKind::Vibix, ProviderKind::Rezka]
        );

        let without_query = catalog
            .providers("361", None, &rezka, &RezkaOptions::default())
            .unwrap();
        assert_eq!(without_query, vec![ProviderKind::Turbo, ProviderKind::Vibix]);
    }

    #[test]
    fn test_open_provider_from_iframe() {
        let transport = Arc::new(
            FakeTransport::new()
                .route(
                    Method::Post,
                    "api.test/cache",
                    &[],
                    r#"[{"name":"vibix","iframe":"https://embed.test/embed/361"}]"#,
                )
                .route(
                    Method::Get,
                    "embed.test/embed/361",
                    &[],
                    r#"<script>new Playerjs({"title":"Fight Club","file":[{"title":"Дубляж","file":"[720p]https://cdn.test/720.mp4"}]});</script>"#,
                ),
        );
        let catalog = Catalog::new(transport.clone(), Some("https://api.test"), "", None);
        let rezka = ProviderSession::new("hdrezka", "rezka.test", transport);

        let provider = catalog
            .open_provider(
                ProviderKind::Vibix,
                "361",
                None,
                rezka.clone(),
                RezkaOptions::default(),
            )
            .unwrap();
        assert_eq!(provider.kind(), ProviderKind::Vibix);
        assert_eq!(provider.content().display_name, "Fight Club");

        let missing = catalog.open_provider(
            ProviderKind::Turbo,
            "361",
            None,
            rezka,
            RezkaOptions::default(),
        );
        assert!(matches!(
            missing,
            Err(CatalogError::Provider(ProviderError::NotFound(_)))
        ));
    }

    #[test]
    fn test_refresh_base_url_persists() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStorage::open("catalog", Some(dir.path())).unwrap();
        let script = r#"var a=1;const cfg={api_endpoints:JSON.stringify([{url:"https://api9.rhserv.vu/v2/",name:"main"}])};"#;
        let transport = Arc::new(FakeTransport::new().route(Method::Get, "front.test", &[], script));

        let mut catalog = Catalog::new(
            transport.clone(),
            None,
            "https://front.test/index.js",
            Some(cache.clone()),
        );
        assert_eq!(catalog.refresh_base_url().unwrap(), "https://api9.rhserv.vu");
        assert_eq!(catalog.base_url(), "https://api9.rhserv.vu");

        let reopened = Catalog::new(transport, Some("https://configured.test"), "", Some(cache));
        assert_eq!(reopened.base_url(), "https://api9.rhserv.vu");
    }

    #[test]
    fn test_refresh_base_url_without_marker() {
        let (mut catalog, _) = catalog(FakeTransport::new().route(
            Method::Get,
            "front.test",
            &[],
            "console.log('nothing here')",
        ));
        assert!(matches!(
            catalog.refresh_base_url(),
            Err(CatalogError::DomainNotFound(_))
        ));
        assert_eq!(catalog.base_url(), "https://api.test");
    }

    #[test]
    fn test_reduce_to_origin() {
        assert_eq!(reduce_to_origin("https://api.test/v1/x"), "https://api.test");
        assert_eq!(reduce_to_origin("/relative/api"), "/relative/api");
    }
}
