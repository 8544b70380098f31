use crate::config::Config;
use crate::crypto::TokenCipher;
use crate::errors::AuthError;
use crate::handlers;
use crate::metrics;
use crate::middleware::{Admission, Authentication, CsrfProtection, IdentityHeaders};
use crate::oauth::{FlowClient, OpenIdFlow, TokenVerifier};
use crate::store::{create_storage, RefreshStore};
use actix_web::web::{self, Data};
use regex::Regex;
use std::sync::{Arc, RwLock};

/// Shared, read-mostly state of the proxy: configuration, provider
/// clients, the cookie cipher, the optional refresh store and the
/// compiled claim patterns. Built once at startup and registered as
/// `web::Data`.
pub struct ProxyState {
    pub config: Config,
    pub(crate) flow: Arc<dyn FlowClient>,
    verifier: RwLock<Arc<TokenVerifier>>,
    pub(crate) cipher: Option<TokenCipher>,
    pub(crate) store: Option<Arc<dyn RefreshStore>>,
    pub(crate) claim_matches: Vec<(String, Regex)>,
    pub(crate) http: reqwest::Client,
}

impl ProxyState {
    /// Full startup path: validate, discover the provider, open the store.
    pub async fn from_config(config: Config) -> Result<Self, AuthError> {
        config.validate()?;
        let (flow, verifier) = OpenIdFlow::discover(&config).await?;
        let store = if config.store_url.is_empty() {
            None
        } else {
            Some(create_storage(&config.store_url).await?)
        };
        let mut state = Self::assemble(config, Arc::new(flow), verifier)?;
        state.store = store;
        Ok(state)
    }

    /// Build the state around an existing flow client and verifier. Used
    /// by embedders with their own discovery cadence, and by tests.
    pub fn with_flow(
        config: Config,
        flow: Arc<dyn FlowClient>,
        verifier: TokenVerifier,
    ) -> Result<Self, AuthError> {
        config.validate()?;
        Self::assemble(config, flow, verifier)
    }

    fn assemble(
        config: Config,
        flow: Arc<dyn FlowClient>,
        verifier: TokenVerifier,
    ) -> Result<Self, AuthError> {
        metrics::init();
        let cipher = if config.enable_encrypted_token || config.enable_csrf {
            Some(TokenCipher::new(&config.encryption_key_bytes()?)?)
        } else {
            None
        };
        let mut claim_matches = Vec::with_capacity(config.match_claims.len());
        for (claim, pattern) in &config.match_claims {
            let compiled = Regex::new(pattern)
                .map_err(|err| AuthError::Config(format!("match-claim {claim}: {err}")))?;
            claim_matches.push((claim.clone(), compiled));
        }
        Ok(Self {
            config,
            flow,
            verifier: RwLock::new(Arc::new(verifier)),
            cipher,
            store: None,
            claim_matches,
            http: reqwest::Client::new(),
        })
    }

    /// Attach a refresh store after construction.
    pub fn with_store(mut self, store: Arc<dyn RefreshStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Snapshot of the current verifier; cheap, lock held only for the
    /// clone.
    pub fn verifier(&self) -> Arc<TokenVerifier> {
        match self.verifier.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Swap the verifier after a JWKS rotation; readers keep their
    /// snapshot, at most one retry observes stale keys.
    pub fn swap_verifier(&self, verifier: TokenVerifier) {
        let fresh = Arc::new(verifier);
        match self.verifier.write() {
            Ok(mut guard) => *guard = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
    }
}

/// Register the oauth endpoints and one middleware chain per configured
/// resource, longest prefix first. Whitelisted resources bypass the
/// authentication, admission, CSRF and identity-header stages.
///
/// The app-wide stages (entrypoint, request id, logging, security
/// headers) wrap the `App` itself; see the crate documentation for the
/// ordering.
pub fn configure_proxy(cfg: &mut web::ServiceConfig, state: Data<ProxyState>) {
    cfg.app_data(state.clone());
    cfg.service(handlers::oauth_scope(&state.config));

    let mut resources = state.config.resources.clone();
    resources.sort_by(|a, b| b.url.len().cmp(&a.url.len()));

    for resource in resources {
        let path = if resource.url == "/" {
            String::new()
        } else {
            resource.url.trim_end_matches('/').to_string()
        };
        if resource.whitelisted {
            cfg.service(
                web::scope(&path)
                    .app_data(Data::new(resource.clone()))
                    .default_service(web::to(handlers::forward)),
            );
        } else {
            cfg.service(
                web::scope(&path)
                    .app_data(Data::new(resource.clone()))
                    .wrap(IdentityHeaders::new(&state.config))
                    .wrap(CsrfProtection::new(resource.clone()))
                    .wrap(Admission::new(resource.clone()))
                    .wrap(Authentication)
                    .default_service(web::to(handlers::forward)),
            );
        }
    }
}
