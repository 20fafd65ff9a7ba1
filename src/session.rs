//! Upstream sessions
//!
//! A `ProviderSession` owns everything needed to talk to one upstream site:
//! its host, the authentication cookies and the default headers. Requests go
//! through the `Transport` trait so the HTTP client can be swapped out.

use crate::cache::CacheStorage;
use crate::providers::ProviderError;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Browser user agent sent with every request
pub(crate) const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/81.0.4044.138 Safari/537.36";

/// Cookie name -> value, as persisted in the credential cache
pub type CookieJar = IndexMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// A single request against an upstream site
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub form: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub cookies: Vec<(String, String)>,
}

impl UpstreamRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url.into())
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url.into())
    }

    fn new(method: Method, url: String) -> Self {
        Self {
            method,
            url,
            query: Vec::new(),
            form: Vec::new(),
            headers: Vec::new(),
            cookies: Vec::new(),
        }
    }

    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn form(mut self, key: &str, value: &str) -> Self {
        self.form.push((key.to_string(), value.to_string()));
        self
    }

    /// Value of a form field, if present
    pub fn form_value(&self, key: &str) -> Option<&str> {
        self.form
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Renders the cookies as a `Cookie` header value
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// What came back from upstream
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: String,
    pub cookies: Vec<(String, String)>,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Fails with `Upstream` unless the status is 2xx
    pub fn error_for_status(self) -> Result<Self, ProviderError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ProviderError::Upstream(format!("HTTP {}", self.status)))
        }
    }

    /// Parses the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ProviderError> {
        serde_json::from_str(&self.body)
            .map_err(|e| ProviderError::Upstream(format!("unexpected reply: {e}")))
    }
}

/// Executes upstream requests
pub trait Transport: Send + Sync {
    fn execute(&self, request: UpstreamRequest) -> Result<UpstreamResponse, ProviderError>;
}

/// `Transport` backed by a blocking reqwest client
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    /// Creates a transport whose every request is bounded by `timeout`
    pub fn new(timeout: Duration) -> Result<Self, ProviderError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Upstream(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn execute(&self, request: UpstreamRequest) -> Result<UpstreamResponse, ProviderError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url).form(&request.form),
        };

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(cookie) = request.cookie_header() {
            builder = builder.header(reqwest::header::COOKIE, cookie);
        }

        debug!(method = ?request.method, url = %request.url, "upstream request");
        let response = builder
            .send()
            .map_err(|e| ProviderError::Upstream(format!("{}: {e}", request.url)))?;

        let status = response.status().as_u16();
        let cookies = response
            .cookies()
            .map(|c| (c.name().to_string(), c.value().to_string()))
            .collect();
        let body = response
            .text()
            .map_err(|e| ProviderError::Upstream(format!("{}: {e}", request.url)))?;

        Ok(UpstreamResponse {
            status,
            body,
            cookies,
        })
    }
}

/// Login credentials for an upstream site
#[derive(Debug, Clone)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

/// How a site's login endpoint works
#[derive(Debug, Clone, Copy)]
pub struct LoginScheme {
    /// Path of the login endpoint, POSTed as a form
    pub path: &'static str,
    /// Session cookie that must not be persisted
    pub transient_cookie: &'static str,
    /// Cookie the site expects from its own clients
    pub client_cookie: (&'static str, &'static str),
}

#[derive(Debug, Deserialize)]
struct LoginReply {
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

/// Session state for one upstream site
#[derive(Clone)]
pub struct ProviderSession {
    provider: String,
    base_host: String,
    cookies: CookieJar,
    default_headers: Vec<(String, String)>,
    transport: Arc<dyn Transport>,
}

impl ProviderSession {
    /// Creates an unauthenticated session
    pub fn new(provider: &str, base_host: &str, transport: Arc<dyn Transport>) -> Self {
        Self {
            provider: provider.to_string(),
            base_host: base_host.to_string(),
            cookies: CookieJar::new(),
            default_headers: Vec::new(),
            transport,
        }
    }

    /// Adds a header sent with every request of this session
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.default_headers
            .push((name.to_string(), value.to_string()));
        self
    }

    /// Authenticates the session
    ///
    /// A cached cookie jar for this provider is used as-is, without any
    /// validity check; stale cookies surface later as failed requests. With
    /// `force` the cached jar is dropped first. Without a cache entry the
    /// credentials are posted to the login endpoint and the resulting
    /// cookies, minus the transient session cookie and plus the client
    /// cookie, are persisted.
    ///
    /// Without credentials and without a cached jar the session stays
    /// anonymous.
    pub fn authenticate(
        mut self,
        scheme: &LoginScheme,
        credentials: Option<&Credentials>,
        cache: Option<&CacheStorage<CookieJar>>,
        force: bool,
    ) -> Result<Self, ProviderError> {
        if let Some(cache) = cache {
            if force {
                if let Err(e) = cache.remove(&self.provider) {
                    warn!(provider = %self.provider, error = %e, "failed to drop cached cookies");
                }
            }
            match cache.load(&self.provider) {
                Ok(Some(cookies)) => {
                    debug!(provider = %self.provider, "using cached cookies");
                    self.cookies = cookies;
                    return Ok(self);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(provider = %self.provider, error = %e, "ignoring unreadable cookie cache");
                }
            }
        }

        let Some(credentials) = credentials else {
            debug!(provider = %self.provider, "no credentials, continuing anonymously");
            return Ok(self);
        };

        let response = self.execute(
            UpstreamRequest::post(self.url(scheme.path))
                .form("login_name", &credentials.login)
                .form("login_password", &credentials.password)
                .form("login_not_save", "0"),
        )?;

        let reply: LoginReply = response.json()?;
        if !reply.success {
            return Err(ProviderError::Auth(
                reply.message.unwrap_or_else(|| response.body.clone()),
            ));
        }

        self.cookies = response
            .cookies
            .iter()
            .filter(|(name, _)| name != scheme.transient_cookie)
            .cloned()
            .collect();
        self.cookies.insert(
            scheme.client_cookie.0.to_string(),
            scheme.client_cookie.1.to_string(),
        );
        info!(provider = %self.provider, "logged in");

        if let Some(cache) = cache {
            if let Err(e) = cache.store(&self.provider, &self.cookies) {
                warn!(provider = %self.provider, error = %e, "failed to persist cookies");
            }
        }

        Ok(self)
    }

    pub fn base_host(&self) -> &str {
        &self.base_host
    }

    pub fn cookies(&self) -> &CookieJar {
        &self.cookies
    }

    /// Absolute URL for a path on this site
    pub fn url(&self, path: &str) -> String {
        format!("https://{}{}", self.base_host, path)
    }

    /// Sends a request with the session headers and cookies attached
    pub fn execute(&self, mut request: UpstreamRequest) -> Result<UpstreamResponse, ProviderError> {
        let mut headers = self.default_headers.clone();
        headers.append(&mut request.headers);
        request.headers = headers;
        request
            .cookies
            .extend(self.cookies.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.transport.execute(request)
    }

    /// GET with query parameters, failing on non-2xx status
    pub fn get(&self, url: &str, query: &[(&str, &str)]) -> Result<UpstreamResponse, ProviderError> {
        let request = query
            .iter()
            .fold(UpstreamRequest::get(url), |req, (k, v)| req.query(k, v));
        self.execute(request)?.error_for_status()
    }

    /// Form POST, failing on non-2xx status
    pub fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
    ) -> Result<UpstreamResponse, ProviderError> {
        let request = form
            .iter()
            .fold(UpstreamRequest::post(url), |req, (k, v)| req.form(k, v));
        self.execute(request)?.error_for_status()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeTransport;
    use super::*;

    const SCHEME: LoginScheme = LoginScheme {
        path: "/ajax/login/",
        transient_cookie: "PHPSESSID",
        client_cookie: ("hdmbbs", "1"),
    };

    fn credentials() -> Credentials {
        Credentials {
            login: "user@example.org".into(),
            password: "secret".into(),
        }
    }

    #[test]
    fn test_login_persists_filtered_cookies() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStorage::open("credentials", Some(dir.path())).unwrap();
        let transport = Arc::new(
            FakeTransport::new()
                .route(Method::Post, "/ajax/login/", &[], r#"{"success":true}"#)
                .with_cookies(&[("PHPSESSID", "tmp"), ("dle_user_id", "42")]),
        );

        let session = ProviderSession::new("hdrezka", "rezka.test", transport.clone())
            .authenticate(&SCHEME, Some(&credentials()), Some(&cache), false)
            .unwrap();

        assert_eq!(session.cookies().get("dle_user_id").map(String::as_str), Some("42"));
        assert_eq!(session.cookies().get("hdmbbs").map(String::as_str), Some("1"));
        assert!(!session.cookies().contains_key("PHPSESSID"));
        assert_eq!(cache.load("hdrezka").unwrap().as_ref(), Some(session.cookies()));

        let login = &transport.requests()[0];
        assert_eq!(login.url, "https://rezka.test/ajax/login/");
        assert_eq!(login.form_value("login_not_save"), Some("0"));
    }

    #[test]
    fn test_cached_cookies_skip_login() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStorage::open("credentials", Some(dir.path())).unwrap();
        let mut jar = CookieJar::new();
        jar.insert("dle_user_id".into(), "7".into());
        cache.store("hdrezka", &jar).unwrap();

        let transport = Arc::new(FakeTransport::new());
        let session = ProviderSession::new("hdrezka", "rezka.test", transport.clone())
            .authenticate(&SCHEME, Some(&credentials()), Some(&cache), false)
            .unwrap();

        assert_eq!(session.cookies(), &jar);
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn test_forced_login_replaces_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheStorage::open("credentials", Some(dir.path())).unwrap();
        let mut jar = CookieJar::new();
        jar.insert("stale".into(), "1".into());
        cache.store("hdrezka", &jar).unwrap();

        let transport = Arc::new(
            FakeTransport::new()
                .route(Method::Post, "/ajax/login/", &[], r#"{"success":true}"#)
                .with_cookies(&[("dle_user_id", "42")]),
        );
        let session = ProviderSession::new("hdrezka", "rezka.test", transport)
            .authenticate(&SCHEME, Some(&credentials()), Some(&cache), true)
            .unwrap();

        assert!(!session.cookies().contains_key("stale"));
        assert!(cache.load("hdrezka").unwrap().unwrap().contains_key("dle_user_id"));
    }

    #[test]
    fn test_failed_login_is_auth_error() {
        let transport = Arc::new(FakeTransport::new().route(
            Method::Post,
            "/ajax/login/",
            &[],
            r#"{"success":false,"message":"Wrong password"}"#,
        ));
        let result = ProviderSession::new("hdrezka", "rezka.test", transport).authenticate(
            &SCHEME,
            Some(&credentials()),
            None,
            false,
        );

        assert!(matches!(result, Err(ProviderError::Auth(ref m)) if m == "Wrong password"));
    }

    #[test]
    fn test_session_attaches_headers_and_cookies() {
        let transport = Arc::new(FakeTransport::new().route(Method::Get, "/page", &[], "ok"));
        let mut session = ProviderSession::new("hdrezka", "rezka.test", transport.clone())
            .with_header("Referer", "https://rezka.test/");
        session.cookies.insert("hdmbbs".into(), "1".into());

        let response = session.get(&session.url("/page"), &[("q", "x")]).unwrap();
        assert_eq!(response.body, "ok");

        let sent = &transport.requests()[0];
        assert_eq!(sent.cookie_header().as_deref(), Some("hdmbbs=1"));
        assert_eq!(sent.headers[0].0, "Referer");
        assert_eq!(sent.query, vec![("q".to_string(), "x".to_string())]);
    }
}
