use crate::errors::AuthError;
use actix_web::cookie::SameSite;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use url::Url;

pub(crate) const ENV_DISCOVERY_URL: &str = "PROXY_DISCOVERY_URL";
pub(crate) const ENV_CLIENT_ID: &str = "PROXY_CLIENT_ID";
pub(crate) const ENV_CLIENT_SECRET: &str = "PROXY_CLIENT_SECRET";
pub(crate) const ENV_REDIRECTION_URL: &str = "PROXY_REDIRECTION_URL";
pub(crate) const ENV_ENCRYPTION_KEY: &str = "PROXY_ENCRYPTION_KEY";
pub(crate) const ENV_STORE_URL: &str = "PROXY_STORE_URL";
pub(crate) const ENV_UPSTREAM_URL: &str = "PROXY_UPSTREAM_URL";
/// Comma separated list of scopes.
pub(crate) const ENV_SCOPES: &str = "PROXY_SCOPES";

/// SameSite policy carried by configuration; `None` is the default the
/// authorization redirect dance requires.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSitePolicy {
    Lax,
    Strict,
    #[default]
    None,
}

impl SameSitePolicy {
    pub(crate) fn to_same_site(self) -> SameSite {
        match self {
            SameSitePolicy::Lax => SameSite::Lax,
            SameSitePolicy::Strict => SameSite::Strict,
            SameSitePolicy::None => SameSite::None,
        }
    }
}

/// A protected path prefix and its admission policy.
///
/// Immutable after startup; the pipeline assembler builds one middleware
/// chain per resource.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Resource {
    /// URL prefix the resource matches, e.g. `/api`.
    pub url: String,
    /// Allowed HTTP methods; empty permits every method.
    #[serde(default)]
    pub methods: Vec<String>,
    /// Roles required on the identity.
    #[serde(default)]
    pub roles: Vec<String>,
    /// Groups required on the identity, always all of them.
    #[serde(default)]
    pub groups: Vec<String>,
    /// OR semantics for `roles` instead of the default AND.
    #[serde(default)]
    pub require_any_role: bool,
    /// Bypass authentication and admission entirely.
    #[serde(default)]
    pub whitelisted: bool,
    /// Upstream override for this resource.
    #[serde(default)]
    pub upstream: Option<String>,
    /// Prefix stripped from the path before forwarding.
    #[serde(default)]
    pub strip_base_path: Option<String>,
    /// Enable the CSRF check for this resource.
    #[serde(default)]
    pub enable_csrf: bool,
}

impl Resource {
    pub(crate) fn method_allowed(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }
}

impl Default for Resource {
    fn default() -> Self {
        Self {
            url: "/".to_string(),
            methods: Vec::new(),
            roles: Vec::new(),
            groups: Vec::new(),
            require_any_role: false,
            whitelisted: false,
            upstream: None,
            strip_base_path: None,
            enable_csrf: false,
        }
    }
}

/// Proxy configuration consumed by the core.
///
/// Loading (files, CLI) is the embedder's concern; `Config::from_env`
/// covers the environment-variable subset used by deployments that do not
/// carry a config file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// OIDC issuer / discovery base, e.g. `https://idp.example.com/realms/main`.
    pub discovery_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// External base URL of this proxy, used to build the redirect URI.
    pub redirection_url: String,
    /// Additional scopes requested on top of the OIDC defaults.
    pub scopes: Vec<String>,
    /// Scopes that must be present in verified access tokens.
    pub required_scopes: Vec<String>,
    /// Base path of the proxy's own endpoints.
    pub oauth_uri: String,

    pub cookie_access_name: String,
    pub cookie_refresh_name: String,
    pub cookie_request_uri_name: String,
    pub cookie_request_state_name: String,
    pub cookie_csrf_name: String,
    /// Cookie domain; empty selects the request Host (port stripped).
    pub cookie_domain: String,
    pub http_only_cookie: bool,
    pub secure_cookie: bool,
    pub same_site_cookie: SameSitePolicy,
    /// Drop cookies without `Expires` so they live with the browser session.
    pub enable_session_cookies: bool,

    pub enable_refresh_tokens: bool,
    /// Validate exchanged tokens against the provider userinfo endpoint.
    pub enable_userinfo: bool,
    /// Encrypt token payloads in cookies with `encryption_key`.
    pub enable_encrypted_token: bool,
    /// AES key, 16/24/32 bytes (raw or hex-encoded at twice that length).
    pub encryption_key: String,

    pub enable_csrf: bool,
    pub csrf_header: String,

    pub enable_claims_headers: bool,
    pub enable_token_header: bool,
    pub enable_authorization_header: bool,
    /// Forward the session cookies to the upstream instead of redacting them.
    pub enable_authorization_cookies: bool,
    /// Custom claims copied to `X-Auth-<Header-Case>` headers.
    pub custom_claims_headers: Vec<String>,

    /// Claim name to regex pattern, all must match for admission.
    pub match_claims: HashMap<String, String>,
    /// Static headers stamped on every response of a protected resource.
    pub response_headers: HashMap<String, String>,

    /// Host allow-list; empty permits every host.
    pub hostnames: Vec<String>,
    pub enable_sts: bool,
    pub enable_sts_preload: bool,
    pub enable_frame_deny: bool,
    pub enable_content_no_sniff: bool,
    pub enable_browser_xss_filter: bool,
    pub content_security_policy: String,
    pub enable_https_redirect: bool,

    pub request_id_header: String,
    /// Trust parsed tokens without signature verification. Testing only.
    pub skip_token_verification: bool,
    /// Refresh token store, `redis://...` or `boltdb://...`; empty keeps
    /// refresh tokens in cookies.
    pub store_url: String,
    /// Default upstream for resources without an override.
    pub upstream_url: String,
    /// Deadline applied to upstream and provider calls.
    pub upstream_timeout_secs: u64,
    pub resources: Vec<Resource>,
    /// Expose the current access token on `GET {oauth_uri}/token`.
    pub enable_token_endpoint: bool,
    /// Where the callback sends the browser when no request URI was captured.
    pub landing_page: String,
    /// `post_logout_redirect_uri` passed to the provider end-session endpoint.
    pub post_logout_redirect: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_url: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            redirection_url: String::new(),
            scopes: Vec::new(),
            required_scopes: Vec::new(),
            oauth_uri: "/oauth".to_string(),
            cookie_access_name: "proxy-access".to_string(),
            cookie_refresh_name: "proxy-refresh".to_string(),
            cookie_request_uri_name: "request_uri".to_string(),
            cookie_request_state_name: "request_state".to_string(),
            cookie_csrf_name: "proxy-csrf".to_string(),
            cookie_domain: String::new(),
            http_only_cookie: true,
            secure_cookie: true,
            same_site_cookie: SameSitePolicy::None,
            enable_session_cookies: false,
            enable_refresh_tokens: false,
            enable_userinfo: false,
            enable_encrypted_token: false,
            encryption_key: String::new(),
            enable_csrf: false,
            csrf_header: "X-CSRF-Token".to_string(),
            enable_claims_headers: true,
            enable_token_header: true,
            enable_authorization_header: true,
            enable_authorization_cookies: false,
            custom_claims_headers: Vec::new(),
            match_claims: HashMap::new(),
            response_headers: HashMap::new(),
            hostnames: Vec::new(),
            enable_sts: false,
            enable_sts_preload: false,
            enable_frame_deny: false,
            enable_content_no_sniff: false,
            enable_browser_xss_filter: false,
            content_security_policy: String::new(),
            enable_https_redirect: false,
            request_id_header: "X-Request-ID".to_string(),
            skip_token_verification: false,
            store_url: String::new(),
            upstream_url: String::new(),
            upstream_timeout_secs: 10,
            resources: Vec::new(),
            enable_token_endpoint: false,
            landing_page: "/".to_string(),
            post_logout_redirect: String::new(),
        }
    }
}

impl Config {
    /// Populate the environment-variable subset of the configuration.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        if let Ok(v) = env::var(ENV_DISCOVERY_URL) {
            config.discovery_url = v;
        }
        if let Ok(v) = env::var(ENV_CLIENT_ID) {
            config.client_id = v;
        }
        if let Ok(v) = env::var(ENV_CLIENT_SECRET) {
            config.client_secret = v;
        }
        if let Ok(v) = env::var(ENV_REDIRECTION_URL) {
            config.redirection_url = v;
        }
        if let Ok(v) = env::var(ENV_ENCRYPTION_KEY) {
            config.enable_encrypted_token = true;
            config.encryption_key = v;
        }
        if let Ok(v) = env::var(ENV_STORE_URL) {
            config.store_url = v;
        }
        if let Ok(v) = env::var(ENV_UPSTREAM_URL) {
            config.upstream_url = v;
        }
        if let Ok(v) = env::var(ENV_SCOPES) {
            config.scopes = v
                .split(',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        config
    }

    /// Decode `encryption_key` into raw bytes, accepting raw 16/24/32-byte
    /// keys or their hex encoding.
    pub(crate) fn encryption_key_bytes(&self) -> Result<Vec<u8>, AuthError> {
        let key = self.encryption_key.as_bytes();
        match key.len() {
            16 | 24 | 32 => Ok(key.to_vec()),
            _ => hex::decode(&self.encryption_key)
                .ok()
                .filter(|raw| matches!(raw.len(), 16 | 24 | 32))
                .ok_or_else(|| {
                    AuthError::Config("encryption key must be 16, 24 or 32 bytes".to_string())
                }),
        }
    }

    /// Validate the fields the core depends on. Called once at startup.
    pub fn validate(&self) -> Result<(), AuthError> {
        if self.enable_encrypted_token || self.enable_csrf {
            self.encryption_key_bytes()?;
        }
        if !self.store_url.is_empty() {
            let url = Url::parse(&self.store_url)
                .map_err(|err| AuthError::Config(format!("invalid store url: {err}")))?;
            match url.scheme() {
                "redis" | "boltdb" => {}
                scheme => {
                    return Err(AuthError::Config(format!("unsupported store: {scheme}")));
                }
            }
        }
        for resource in &self.resources {
            if !resource.url.starts_with('/') {
                return Err(AuthError::Config(format!(
                    "resource url {} must begin with a slash",
                    resource.url
                )));
            }
            if let Some(upstream) = &resource.upstream {
                Url::parse(upstream)
                    .map_err(|err| AuthError::Config(format!("invalid upstream: {err}")))?;
            }
        }
        if !self.upstream_url.is_empty() {
            Url::parse(&self.upstream_url)
                .map_err(|err| AuthError::Config(format!("invalid upstream: {err}")))?;
        }
        for (claim, pattern) in &self.match_claims {
            Regex::new(pattern).map_err(|err| {
                AuthError::Config(format!("match-claim {claim} pattern invalid: {err}"))
            })?;
        }
        Ok(())
    }

    /// Absolute redirect URI registered with the provider.
    pub(crate) fn redirect_uri(&self) -> String {
        format!(
            "{}{}/callback",
            self.redirection_url.trim_end_matches('/'),
            self.oauth_uri
        )
    }

    pub(crate) fn oauth_path(&self, suffix: &str) -> String {
        format!("{}{}", self.oauth_uri, suffix)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_cookie_names() {
        let config = Config::default();
        assert_eq!(config.cookie_access_name, "proxy-access");
        assert_eq!(config.cookie_refresh_name, "proxy-refresh");
        assert_eq!(config.same_site_cookie, SameSitePolicy::None);
        assert!(config.http_only_cookie);
    }

    #[test]
    fn test_encryption_key_raw_lengths() {
        for len in [16usize, 24, 32] {
            let config = Config {
                encryption_key: "k".repeat(len),
                ..Config::default()
            };
            assert_eq!(config.encryption_key_bytes().unwrap().len(), len);
        }
    }

    #[test]
    fn test_encryption_key_hex() {
        let config = Config {
            encryption_key: hex::encode([7u8; 32]),
            ..Config::default()
        };
        let raw = config.encryption_key_bytes().unwrap();
        assert_eq!(raw, vec![7u8; 32]);
    }

    #[test]
    fn test_encryption_key_invalid_length() {
        let config = Config {
            encryption_key: "short".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            config.encryption_key_bytes(),
            Err(AuthError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects_unknown_store_scheme() {
        let config = Config {
            store_url: "etcd://127.0.0.1:2379".to_string(),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(AuthError::Config(_))));
    }

    #[test]
    fn test_validate_accepts_known_store_schemes() {
        for url in ["redis://127.0.0.1:6379", "boltdb:///tmp/tokens.db"] {
            let config = Config {
                store_url: url.to_string(),
                ..Config::default()
            };
            assert!(config.validate().is_ok(), "{url} should validate");
        }
    }

    #[test]
    fn test_redirect_uri() {
        let config = Config {
            redirection_url: "https://proxy.example.com/".to_string(),
            ..Config::default()
        };
        assert_eq!(
            config.redirect_uri(),
            "https://proxy.example.com/oauth/callback"
        );
    }

    #[test]
    fn test_resource_method_allowed() {
        let resource = Resource {
            methods: vec!["GET".to_string(), "POST".to_string()],
            ..Resource::default()
        };
        assert!(resource.method_allowed("get"));
        assert!(!resource.method_allowed("DELETE"));
        assert!(Resource::default().method_allowed("DELETE"));
    }
}
