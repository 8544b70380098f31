use crate::config::Resource;
use crate::cookies;
use crate::csrf;
use crate::metrics;
use crate::proxy::ProxyState;
use crate::scope::ScopeHandle;
use crate::session;
use crate::store::hash_key;
use crate::token::{Identity, TokenKind};
use actix_web::cookie::time::Duration as CookieDuration;
use actix_web::http::header::{HeaderName, LOCATION};
use actix_web::http::StatusCode;
use actix_web::{web, HttpMessage, HttpRequest, HttpResponse, Scope};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use serde::Deserialize;
use std::time::Duration;

/// Proxy-owned endpoints under the configured oauth base path.
pub(crate) fn oauth_scope(config: &crate::config::Config) -> Scope {
    web::scope(config.oauth_uri.trim_end_matches('/'))
        .route("/authorize", web::get().to(authorize))
        .route("/callback", web::get().to(callback))
        .route("/logout", web::get().to(logout))
        .route("/token", web::get().to(token_endpoint))
        .route("/health", web::get().to(health))
        .route("/metrics", web::get().to(metrics_endpoint))
}

#[derive(Deserialize)]
pub(crate) struct AuthorizeParams {
    redirect: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Start the authorization code flow: state cookies first, then the
/// provider redirect carrying the same state.
fn authorization_redirect(req: &HttpRequest, state: &ProxyState, request_uri: &str) -> HttpResponse {
    let (state_token, state_cookies) =
        cookies::write_state_parameter_cookies(&state.config, req, request_uri);
    let authorize_url = state.flow.authorize_url(&state_token);

    let mut builder = HttpResponse::Found();
    for cookie in state_cookies {
        builder.cookie(cookie);
    }
    builder
        .insert_header((LOCATION, authorize_url.to_string()))
        .finish()
}

/// Deny path of the authentication stage: capture where the client wanted
/// to go, then hand it to the provider.
pub(crate) fn redirect_to_authorization(req: &HttpRequest, state: &ProxyState) -> HttpResponse {
    let request_uri = req
        .extensions()
        .get::<ScopeHandle>()
        .map(|scope| scope.original_uri())
        .unwrap_or_else(|| {
            req.uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| req.uri().path().to_string())
        });
    authorization_redirect(req, state, &request_uri)
}

async fn authorize(
    req: HttpRequest,
    params: web::Query<AuthorizeParams>,
    state: web::Data<ProxyState>,
) -> HttpResponse {
    let target = params.redirect.clone().unwrap_or_else(|| {
        state.config.landing_page.clone()
    });
    authorization_redirect(&req, &state, &target)
}

async fn callback(
    req: HttpRequest,
    params: web::Query<CallbackParams>,
    state: web::Data<ProxyState>,
) -> HttpResponse {
    if let Some(error) = &params.error {
        log::warn!(
            "authorization request failed at the provider, error={error} description={}",
            params.error_description.as_deref().unwrap_or("")
        );
        return HttpResponse::Forbidden().body("403 Forbidden");
    }
    let (Some(code), Some(state_param)) = (params.code.clone(), params.state.clone()) else {
        return HttpResponse::BadRequest().body("missing code or state parameter");
    };

    let Some(state_cookie) = req.cookie(&state.config.cookie_request_state_name) else {
        log::warn!("callback received without a state cookie");
        return HttpResponse::Forbidden().body("403 Forbidden");
    };
    if !csrf::tokens_match(state_cookie.value(), &state_param) {
        log::warn!("state parameter does not match the state cookie");
        return HttpResponse::Forbidden().body("403 Forbidden");
    }

    let tokens = match state.flow.exchange_code(code).await {
        Ok(tokens) => tokens,
        Err(err) => {
            log::error!("unable to exchange authorization code: {err}");
            return HttpResponse::Forbidden().body("403 Forbidden");
        }
    };

    let identity = match Identity::from_token(&tokens.access_token, TokenKind::CookieSession) {
        Ok(identity) => identity,
        Err(err) => {
            log::error!("provider returned an unusable access token: {err}");
            return HttpResponse::Forbidden().body("403 Forbidden");
        }
    };
    if !state.config.skip_token_verification {
        if let Err(err) = state.verifier().verify(&tokens.access_token) {
            log::error!("exchanged access token failed verification: {err}");
            return HttpResponse::Forbidden().body("403 Forbidden");
        }
    }
    // active-session check against the provider, when configured
    if state.config.enable_userinfo {
        if let Err(err) = state.flow.userinfo(&tokens.access_token).await {
            log::error!("token rejected by the userinfo endpoint: {err}");
            return HttpResponse::Forbidden().body("403 Forbidden");
        }
    }

    let access_ttl =
        CookieDuration::seconds((identity.expires_at - Utc::now()).num_seconds().max(0));
    let sealed = match session::seal(&state.config, state.cipher.as_ref(), &tokens.access_token) {
        Ok(sealed) => sealed,
        Err(err) => {
            log::error!("unable to seal access token for the session cookie: {err}");
            return HttpResponse::InternalServerError().finish();
        }
    };
    let mut response_cookies =
        cookies::drop_access_token_cookie(&state.config, &req, &sealed, access_ttl);

    if state.config.enable_refresh_tokens {
        if let Some(refresh_token) = &tokens.refresh_token {
            let refresh_ttl = tokens
                .refresh_expires_in
                .map(|ttl| CookieDuration::seconds(ttl.as_secs() as i64))
                .unwrap_or(access_ttl);
            let mut to_cookie = true;
            if let Some(store) = &state.store {
                match store.set(&hash_key(&tokens.access_token), refresh_token).await {
                    Ok(()) => to_cookie = false,
                    Err(err) => {
                        log::error!(
                            "unable to persist refresh token, falling back to cookie: {err}"
                        );
                    }
                }
            }
            if to_cookie {
                match session::seal(&state.config, state.cipher.as_ref(), refresh_token) {
                    Ok(sealed_refresh) => {
                        response_cookies.extend(cookies::drop_refresh_token_cookie(
                            &state.config,
                            &req,
                            &sealed_refresh,
                            refresh_ttl,
                        ));
                    }
                    Err(err) => {
                        log::error!("unable to seal refresh token: {err}");
                        return HttpResponse::InternalServerError().finish();
                    }
                }
            }
        }
    }

    response_cookies.extend(cookies::clear_state_parameter_cookies(&state.config, &req));

    let target = req
        .cookie(&state.config.cookie_request_uri_name)
        .and_then(|cookie| STANDARD.decode(cookie.value()).ok())
        .and_then(|raw| String::from_utf8(raw).ok())
        .filter(|uri| !uri.is_empty())
        .unwrap_or_else(|| state.config.landing_page.clone());

    let mut builder = HttpResponse::Found();
    for cookie in response_cookies {
        builder.cookie(cookie);
    }
    builder.insert_header((LOCATION, target)).finish()
}

async fn logout(req: HttpRequest, state: web::Data<ProxyState>) -> HttpResponse {
    if let Some(store) = &state.store {
        if let Ok(identity) =
            session::identity_from_request(&req, &state.config, state.cipher.as_ref())
        {
            if let Err(err) = store.delete(&hash_key(&identity.token)).await {
                log::error!("unable to delete refresh token on logout: {err}");
            }
        }
    }

    let target = match state.flow.end_session_url() {
        Some(mut end_session) => {
            if !state.config.post_logout_redirect.is_empty() {
                end_session
                    .query_pairs_mut()
                    .append_pair("post_logout_redirect_uri", &state.config.post_logout_redirect);
            }
            end_session.to_string()
        }
        None => state.config.landing_page.clone(),
    };

    let mut builder = HttpResponse::Found();
    for cookie in cookies::clear_all_session_cookies(&state.config, &req) {
        builder.cookie(cookie);
    }
    builder.insert_header((LOCATION, target)).finish()
}

/// Debug endpoint handing the caller its own access token.
async fn token_endpoint(req: HttpRequest, state: web::Data<ProxyState>) -> HttpResponse {
    if !state.config.enable_token_endpoint {
        return HttpResponse::NotFound().finish();
    }
    match session::identity_from_request(&req, &state.config, state.cipher.as_ref()) {
        Ok(identity) => HttpResponse::Ok()
            .content_type("application/jwt")
            .body(identity.token),
        Err(_) => HttpResponse::Unauthorized().finish(),
    }
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().content_type("text/plain").body("OK\n")
}

async fn metrics_endpoint() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4; charset=utf-8")
        .body(metrics::gather_text())
}

/// Headers that never cross the proxy boundary.
const HOP_BY_HOP_HEADERS: [&str; 10] = [
    "connection",
    "content-length",
    "host",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| hop.eq_ignore_ascii_case(name))
}

/// Terminal stage of a resource chain: relay the request to the upstream
/// and the upstream's answer to the client. Path and query are the ones
/// the client sent, before normalization.
pub(crate) async fn forward(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<ProxyState>,
    resource: web::Data<Resource>,
) -> HttpResponse {
    if !resource.method_allowed(req.method().as_str()) {
        return HttpResponse::MethodNotAllowed().finish();
    }

    let upstream = resource
        .upstream
        .clone()
        .unwrap_or_else(|| state.config.upstream_url.clone());
    if upstream.is_empty() {
        log::error!("no upstream configured for resource {}", resource.url);
        return HttpResponse::BadGateway().finish();
    }

    let mut path = req
        .extensions()
        .get::<ScopeHandle>()
        .map(|scope| scope.original_uri())
        .unwrap_or_else(|| {
            req.uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_default()
        });
    if let Some(strip) = &resource.strip_base_path {
        if let Some(rest) = path.strip_prefix(strip.as_str()) {
            path = if rest.starts_with('/') || rest.starts_with('?') || rest.is_empty() {
                rest.to_string()
            } else {
                format!("/{rest}")
            };
            if !path.starts_with('/') {
                path.insert(0, '/');
            }
        }
    }

    let url = format!("{}{}", upstream.trim_end_matches('/'), path);
    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
        .unwrap_or(reqwest::Method::GET);

    let mut outbound = state
        .http
        .request(method, &url)
        .timeout(Duration::from_secs(state.config.upstream_timeout_secs));
    for (name, value) in req.headers() {
        if !is_hop_by_hop(name.as_str()) {
            outbound = outbound.header(name.as_str(), value.as_bytes());
        }
    }
    if !body.is_empty() {
        outbound = outbound.body(body.to_vec());
    }

    let upstream_response = match outbound.send().await {
        Ok(response) => response,
        Err(err) => {
            log::warn!("upstream request failed, url={url} error={err}");
            return HttpResponse::BadGateway().finish();
        }
    };

    let status = StatusCode::from_u16(upstream_response.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = HttpResponse::build(status);
    for (name, value) in upstream_response.headers() {
        if !is_hop_by_hop(name.as_str()) {
            if let Ok(header_name) = HeaderName::try_from(name.as_str()) {
                builder.append_header((header_name, value.as_bytes()));
            }
        }
    }
    match upstream_response.bytes().await {
        Ok(bytes) => builder.body(bytes),
        Err(err) => {
            log::warn!("unable to read upstream response body: {err}");
            HttpResponse::BadGateway().finish()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use crate::oauth::test::{mock_flow, signed_claims, signed_token};
    use crate::oauth::TokenSet;
    use crate::proxy::test::mock_state;
    use actix_web::cookie::Cookie;
    use actix_web::test::{self, TestRequest};
    use actix_web::App;
    use url::Url;

    fn browser_config() -> Config {
        Config {
            secure_cookie: false,
            http_only_cookie: false,
            enable_session_cookies: true,
            enable_refresh_tokens: true,
            ..Config::default()
        }
    }

    fn set_cookies(resp: &actix_web::dev::ServiceResponse) -> Vec<Cookie<'static>> {
        resp.response()
            .cookies()
            .map(|c| c.into_owned())
            .collect()
    }

    #[actix_web::test]
    async fn test_authorize_writes_state_cookies_and_redirects_to_provider() {
        let mut flow = mock_flow();
        flow.expect_authorize_url().returning(|state| {
            Url::parse(&format!(
                "https://idp.example.com/authorize?state={state}&client_id=gateway"
            ))
            .unwrap()
        });
        let state = actix_web::web::Data::new(mock_state(browser_config(), flow));

        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .service(oauth_scope(&state.config)),
        )
        .await;

        let req = TestRequest::get()
            .uri("/oauth/authorize?redirect=%2Fapp")
            .insert_header(("Host", "proxy.example.com"))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::FOUND);
        let location = resp.headers().get(LOCATION).unwrap().to_str().unwrap();
        assert!(location.starts_with("https://idp.example.com/authorize?state="));

        let cookies = set_cookies(&resp);
        let uri_cookie = cookies.iter().find(|c| c.name() == "request_uri").unwrap();
        assert_eq!(STANDARD.decode(uri_cookie.value()).unwrap(), b"/app");
        let state_cookie = cookies.iter().find(|c| c.name() == "request_state").unwrap();
        assert!(location.contains(state_cookie.value()));
    }

    #[actix_web::test]
    async fn test_callback_exchanges_code_and_redirects_to_request_uri() {
        let mut flow = mock_flow();
        let access_token = signed_token(&signed_claims(300));
        let returned = TokenSet {
            access_token: access_token.clone(),
            refresh_token: Some("refresh-1".to_string()),
            expires_in: Some(Duration::from_secs(300)),
            ..TokenSet::default()
        };
        flow.expect_exchange_code()
            .times(1)
            .withf(|code| code == "abc123")
            .return_once(move |_| Ok(returned));

        let state = actix_web::web::Data::new(mock_state(browser_config(), flow));
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .service(oauth_scope(&state.config)),
        )
        .await;

        let req = TestRequest::get()
            .uri("/oauth/callback?code=abc123&state=S")
            .insert_header(("Host", "proxy.example.com"))
            .cookie(Cookie::new("request_state", "S"))
            .cookie(Cookie::new("request_uri", STANDARD.encode("/api")))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(resp.headers().get(LOCATION).unwrap(), "/api");

        let cookies = set_cookies(&resp);
        let access = cookies.iter().find(|c| c.name() == "proxy-access").unwrap();
        assert_eq!(access.value(), access_token);
        assert!(cookies
            .iter()
            .any(|c| c.name() == "proxy-refresh" && c.value() == "refresh-1"));
        // transient state cookies are cleared
        assert!(cookies
            .iter()
            .any(|c| c.name() == "request_state" && c.value().is_empty()));
        assert!(cookies
            .iter()
            .any(|c| c.name() == "request_uri" && c.value().is_empty()));
    }

    #[actix_web::test]
    async fn test_callback_rejects_state_mismatch() {
        let mut flow = mock_flow();
        flow.expect_exchange_code().times(0);

        let state = actix_web::web::Data::new(mock_state(browser_config(), flow));
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .service(oauth_scope(&state.config)),
        )
        .await;

        let req = TestRequest::get()
            .uri("/oauth/callback?code=abc123&state=EVIL")
            .insert_header(("Host", "proxy.example.com"))
            .cookie(Cookie::new("request_state", "S"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[actix_web::test]
    async fn test_callback_checks_userinfo_when_enabled() {
        let mut flow = mock_flow();
        let access_token = signed_token(&signed_claims(300));
        flow.expect_exchange_code().times(1).return_once(move |_| {
            Ok(TokenSet {
                access_token,
                ..TokenSet::default()
            })
        });
        flow.expect_userinfo()
            .times(1)
            .return_once(|_| Err(crate::errors::AuthError::Userinfo));

        let mut config = browser_config();
        config.enable_userinfo = true;
        let state = actix_web::web::Data::new(mock_state(config, flow));
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .service(oauth_scope(&state.config)),
        )
        .await;

        let req = TestRequest::get()
            .uri("/oauth/callback?code=abc123&state=S")
            .insert_header(("Host", "proxy.example.com"))
            .cookie(Cookie::new("request_state", "S"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[actix_web::test]
    async fn test_callback_rejects_tampered_access_token() {
        let mut flow = mock_flow();
        let tampered = crate::token::test::fake_token(&signed_claims(300));
        flow.expect_exchange_code().times(1).return_once(move |_| {
            Ok(TokenSet {
                access_token: tampered,
                ..TokenSet::default()
            })
        });

        let state = actix_web::web::Data::new(mock_state(browser_config(), flow));
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .service(oauth_scope(&state.config)),
        )
        .await;

        let req = TestRequest::get()
            .uri("/oauth/callback?code=abc123&state=S")
            .insert_header(("Host", "proxy.example.com"))
            .cookie(Cookie::new("request_state", "S"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[actix_web::test]
    async fn test_logout_clears_session_and_calls_end_session() {
        let mut flow = mock_flow();
        flow.expect_end_session_url().returning(|| {
            Some(Url::parse("https://idp.example.com/logout").unwrap())
        });

        let mut config = browser_config();
        config.post_logout_redirect = "https://proxy.example.com/".to_string();
        let state = actix_web::web::Data::new(mock_state(config, flow));
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .service(oauth_scope(&state.config)),
        )
        .await;

        let req = TestRequest::get()
            .uri("/oauth/logout")
            .insert_header(("Host", "proxy.example.com"))
            .cookie(Cookie::new("proxy-access", signed_token(&signed_claims(300))))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::FOUND);
        let location = resp.headers().get(LOCATION).unwrap().to_str().unwrap();
        assert!(location.starts_with("https://idp.example.com/logout"));
        assert!(location.contains("post_logout_redirect_uri"));
        assert!(set_cookies(&resp)
            .iter()
            .any(|c| c.name() == "proxy-access" && c.value().is_empty()));
    }

    #[actix_web::test]
    async fn test_token_endpoint_gated_by_config() {
        let flow = mock_flow();
        let state = actix_web::web::Data::new(mock_state(browser_config(), flow));
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .service(oauth_scope(&state.config)),
        )
        .await;

        let req = TestRequest::get().uri("/oauth/token").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_token_endpoint_returns_session_token() {
        let flow = mock_flow();
        let mut config = browser_config();
        config.enable_token_endpoint = true;
        let state = actix_web::web::Data::new(mock_state(config, flow));
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .service(oauth_scope(&state.config)),
        )
        .await;

        let token = signed_token(&signed_claims(300));
        let req = TestRequest::get()
            .uri("/oauth/token")
            .cookie(Cookie::new("proxy-access", token.clone()))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = test::read_body(resp).await;
        assert_eq!(body, token.as_bytes());

        let req = TestRequest::get().uri("/oauth/token").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_web::test]
    #[serial_test::serial(metrics)]
    async fn test_health_and_metrics() {
        let flow = mock_flow();
        let state = actix_web::web::Data::new(mock_state(browser_config(), flow));
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .service(oauth_scope(&state.config)),
        )
        .await;

        let resp = test::call_service(&app, TestRequest::get().uri("/oauth/health").to_request())
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        crate::metrics::init();
        let resp = test::call_service(&app, TestRequest::get().uri("/oauth/metrics").to_request())
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = test::read_body(resp).await;
        assert!(String::from_utf8_lossy(&body).contains("proxy_request_duration_seconds"));
    }
}
