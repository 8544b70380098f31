#![doc = r#"
# actix-oidc-proxy

An authenticating OIDC reverse-proxy layer for [Actix web](https://actix.rs):
unauthenticated browser requests are redirected into the Authorization Code
flow, authenticated requests carry a verified identity to the upstream with
`X-Auth-*` headers injected. Sessions live in chunked (and optionally
AES-GCM encrypted) cookie envelopes, expired access tokens are refreshed
silently, and per-resource role/group/claim policies gate admission.

The provider side is powered by the [openidconnect](https://docs.rs/openidconnect)
crate; access tokens are verified against the provider JWKS with
[jsonwebtoken](https://docs.rs/jsonwebtoken).

# Getting started

```rust,ignore
use actix_oidc_proxy::{
    configure_proxy, Config, Entrypoint, ProxyState, RequestId, RequestLogging, Resource,
    SecurityHeaders,
};
use actix_web::{web, App, HttpServer};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let mut config = Config::from_env();
    config.upstream_url = "http://127.0.0.1:8080".to_string();
    config.enable_refresh_tokens = true;
    config.resources = vec![Resource {
        url: "/api".to_string(),
        methods: vec!["GET".to_string(), "POST".to_string()],
        roles: vec!["user".to_string()],
        ..Resource::default()
    }];

    let state = web::Data::new(
        ProxyState::from_config(config)
            .await
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?,
    );

    HttpServer::new(move || {
        let config = &state.config;
        App::new()
            // middleware execute bottom-up: Entrypoint runs first
            .wrap(SecurityHeaders::new(config))
            .wrap(RequestLogging)
            .wrap(RequestId::new(&config.request_id_header))
            .wrap(Entrypoint)
            .configure(|cfg| configure_proxy(cfg, state.clone()))
    })
    .bind(("0.0.0.0", 3000))?
    .run()
    .await
}
```

The proxy serves its own endpoints under the configured oauth base path
(default `/oauth`): `authorize`, `callback`, `logout`, `token` (gated),
`health` and `metrics`.

# Sessions

The access token travels in a cookie envelope named by
`Config::cookie_access_name`. Values larger than the per-cookie budget are
split into `name`, `name-1`, `name-2`, … and reassembled on the way in;
clearing removes every chunk. With `enable_encrypted_token` the payload is
AES-GCM encrypted under `encryption_key` (16, 24 or 32 bytes). Refresh
tokens live in their own envelope or, with `store_url` set, server-side in
Redis (`redis://…`) or an embedded sled database (`boltdb://…`).

JWKS rotation is the embedder's cadence: rebuild a verifier via
[`OpenIdFlow::discover`] on a timer and hand it to
[`ProxyState::swap_verifier`].
"#]

mod config;
mod cookies;
mod crypto;
mod csrf;
mod errors;
mod handlers;
mod headers;
mod metrics;
pub mod middleware;
mod oauth;
mod policy;
mod proxy;
mod refresh;
mod scope;
mod security;
mod session;
mod store;
mod token;

pub use config::{Config, Resource, SameSitePolicy};
pub use errors::AuthError;
pub use middleware::{
    Admission, Authentication, CsrfProtection, Entrypoint, IdentityHeaders, RequestId,
    RequestLogging, SecurityHeaders,
};
pub use oauth::{FlowClient, OpenIdFlow, TokenSet, TokenVerifier};
pub use proxy::{configure_proxy, ProxyState};
pub use scope::{RequestScope, ScopeHandle};
pub use store::{create_storage, RedisStore, RefreshStore, SledStore};
pub use token::{Identity, TokenKind};
