use crate::config::Resource;
use crate::cookies;
use crate::csrf;
use crate::errors::AuthError;
use crate::handlers;
use crate::headers::{identity_header_setters, Setter};
use crate::metrics;
use crate::oauth;
use crate::policy;
use crate::proxy::ProxyState;
use crate::refresh;
use crate::scope::ScopeHandle;
use crate::security;
use crate::session;
use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::header::{HeaderName, HeaderValue, LOCATION},
    http::uri::{PathAndQuery, Uri},
    web::Data,
    Error, HttpMessage, HttpResponse,
};
use futures_util::future::LocalBoxFuture;
use std::future::{ready, Ready};
use std::rc::Rc;
use std::time::Instant;
use uuid::Uuid;

/// Outermost stage: URL normalization, request-scope creation and the
/// latency/status metrics. Registered last on the `App` so it runs first.
pub struct Entrypoint;

impl<S, B> Transform<S, ServiceRequest> for Entrypoint
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = EntrypointMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        metrics::init();
        ready(Ok(EntrypointMiddleware {
            service: Rc::new(service),
        }))
    }
}

pub struct EntrypointMiddleware<S> {
    service: Rc<S>,
}

struct CancelGuard {
    completed: bool,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.completed {
            metrics::CLIENT_CANCELLED.inc();
        }
    }
}

/// Point routing at the normalized path; the original stays on the scope
/// for the upstream forward.
fn normalize_request_uri(req: &mut ServiceRequest) {
    let path = req.uri().path().to_string();
    let normalized = security::normalize_path(&path);
    if normalized == path {
        return;
    }
    let target = match req.uri().query() {
        Some(query) => format!("{normalized}?{query}"),
        None => normalized,
    };
    let Ok(path_and_query) = PathAndQuery::try_from(target.as_str()) else {
        return;
    };
    let mut parts = req.head().uri.clone().into_parts();
    parts.path_and_query = Some(path_and_query);
    let Ok(uri) = Uri::from_parts(parts) else {
        return;
    };
    req.match_info_mut().get_mut().update(&uri);
    req.head_mut().uri = uri;
}

impl<S, B> Service<ServiceRequest> for EntrypointMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, mut req: ServiceRequest) -> Self::Future {
        let original_uri = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| req.uri().path().to_string());
        normalize_request_uri(&mut req);
        req.extensions_mut().insert(ScopeHandle::new(original_uri));

        let service = Rc::clone(&self.service);
        Box::pin(async move {
            let start = Instant::now();
            let mut guard = CancelGuard { completed: false };
            let result = service.call(req).await;
            guard.completed = true;
            let res = result?;

            metrics::REQUEST_LATENCY.observe(start.elapsed().as_secs_f64());
            metrics::REQUEST_STATUS
                .with_label_values(&[res.status().as_str(), res.request().method().as_str()])
                .inc();
            Ok(res)
        })
    }
}

/// Propagates a correlation id: an incoming header wins, otherwise a fresh
/// UUID is stamped on the request and the scope.
pub struct RequestId {
    header: HeaderName,
}

impl RequestId {
    pub fn new(header: &str) -> Self {
        Self {
            header: HeaderName::try_from(header)
                .unwrap_or_else(|_| HeaderName::from_static("x-request-id")),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RequestId
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = RequestIdMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestIdMiddleware {
            service,
            header: self.header.clone(),
        }))
    }
}

pub struct RequestIdMiddleware<S> {
    service: S,
    header: HeaderName,
}

impl<S, B> Service<ServiceRequest> for RequestIdMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = S::Future;

    forward_ready!(service);

    fn call(&self, mut req: ServiceRequest) -> Self::Future {
        let request_id = req
            .headers()
            .get(&self.header)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            req.headers_mut().insert(self.header.clone(), value);
        }
        if let Some(scope) = req.extensions().get::<ScopeHandle>().cloned() {
            scope.set_request_id(request_id);
        }
        self.service.call(req)
    }
}

/// Access logging with the fields operators grep for.
pub struct RequestLogging;

impl<S, B> Transform<S, ServiceRequest> for RequestLogging
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = RequestLoggingMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestLoggingMiddleware {
            service: Rc::new(service),
        }))
    }
}

pub struct RequestLoggingMiddleware<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for RequestLoggingMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let method = req.method().to_string();
        let path = req.path().to_string();
        let client_ip = req
            .connection_info()
            .realip_remote_addr()
            .unwrap_or("-")
            .to_string();
        let request_id = req
            .extensions()
            .get::<ScopeHandle>()
            .map(|scope| scope.request_id())
            .unwrap_or_default();

        Box::pin(async move {
            let start = Instant::now();
            let res = service.call(req).await?;
            log::info!(
                "client request latency={:?} status={} client_ip={client_ip} method={method} path={path} request_id={request_id}",
                start.elapsed(),
                res.status().as_u16(),
            );
            Ok(res)
        })
    }
}

/// Host allow-listing, optional HTTPS redirect and the security response
/// headers.
pub struct SecurityHeaders {
    inner: Rc<SecurityHeadersInner>,
}

struct SecurityHeadersInner {
    headers: Vec<(HeaderName, HeaderValue)>,
    hostnames: Vec<String>,
    https_redirect: bool,
}

impl SecurityHeaders {
    pub fn new(config: &crate::config::Config) -> Self {
        Self {
            inner: Rc::new(SecurityHeadersInner {
                headers: security::security_response_headers(config),
                hostnames: config.hostnames.clone(),
                https_redirect: config.enable_https_redirect,
            }),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for SecurityHeaders
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = SecurityHeadersMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(SecurityHeadersMiddleware {
            service: Rc::new(service),
            inner: Rc::clone(&self.inner),
        }))
    }
}

pub struct SecurityHeadersMiddleware<S> {
    service: Rc<S>,
    inner: Rc<SecurityHeadersInner>,
}

impl<S, B> Service<ServiceRequest> for SecurityHeadersMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let inner = Rc::clone(&self.inner);

        Box::pin(async move {
            let host = req.connection_info().host().to_string();
            let scheme = req.connection_info().scheme().to_string();

            if !security::host_allowed(&inner.hostnames, &host) {
                log::warn!("failed security filter, host not allowed host={host}");
                if let Some(scope) = req.extensions().get::<ScopeHandle>().cloned() {
                    scope.deny();
                }
                let response = HttpResponse::Forbidden().body("403 Forbidden");
                return Ok(req.into_response(response).map_into_right_body());
            }

            if inner.https_redirect && scheme == "http" {
                let target = format!("https://{host}{}", req.uri());
                let response = HttpResponse::MovedPermanently()
                    .insert_header((LOCATION, target))
                    .finish();
                return Ok(req.into_response(response).map_into_right_body());
            }

            let mut res = service.call(req).await?;
            for (name, value) in &inner.headers {
                res.headers_mut().insert(name.clone(), value.clone());
            }
            Ok(res.map_into_left_body())
        })
    }
}

/// Identity resolution, token verification and the silent refresh.
pub struct Authentication;

impl<S, B> Transform<S, ServiceRequest> for Authentication
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = AuthenticationMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AuthenticationMiddleware {
            service: Rc::new(service),
        }))
    }
}

pub struct AuthenticationMiddleware<S> {
    service: Rc<S>,
}

/// Terminal decision of the authentication stage before it is rendered
/// exactly once.
enum AuthOutcome {
    Continue,
    Refreshed(refresh::RefreshedSession),
    Redirect {
        clear_session: bool,
    },
    Deny {
        server_error: bool,
        message: String,
        clear_session: bool,
    },
}

/// The scope created by the entrypoint, or a fresh one when the stage is
/// entered without it.
fn request_scope(req: &ServiceRequest) -> ScopeHandle {
    if let Some(scope) = req.extensions().get::<ScopeHandle>().cloned() {
        return scope;
    }
    let original_uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let scope = ScopeHandle::new(original_uri);
    req.extensions_mut().insert(scope.clone());
    scope
}

impl<S, B> Service<ServiceRequest> for AuthenticationMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);

        Box::pin(async move {
            let Some(state) = req.app_data::<Data<ProxyState>>().cloned() else {
                let response =
                    HttpResponse::InternalServerError().body("missing proxy configuration");
                return Ok(req.into_response(response).map_into_right_body());
            };
            let scope = request_scope(&req);
            let client_ip = req
                .connection_info()
                .realip_remote_addr()
                .unwrap_or("-")
                .to_string();

            let user = match session::identity_from_request(
                req.request(),
                &state.config,
                state.cipher.as_ref(),
            ) {
                Ok(user) => user,
                Err(err) => {
                    log::warn!(
                        "no session found in request, redirecting for authorization, client_ip={client_ip} error={err}"
                    );
                    scope.deny();
                    let response = handlers::redirect_to_authorization(req.request(), &state);
                    return Ok(req.into_response(response).map_into_right_body());
                }
            };
            scope.set_identity(user.clone());

            let outcome = if state.config.skip_token_verification {
                log::warn!("skip token verification enabled, skipping verification - TESTING ONLY");
                if user.is_expired() {
                    log::warn!(
                        "the session has expired and token verification is switched off, client_ip={client_ip} username={} expired_on={}",
                        user.name,
                        user.expires_at,
                    );
                    AuthOutcome::Redirect {
                        clear_session: false,
                    }
                } else {
                    AuthOutcome::Continue
                }
            } else {
                let verified = state.verifier().verify(&user.token).and_then(|_| {
                    oauth::check_required_scopes(&user.token, &state.config.required_scopes)
                });
                match verified {
                    Ok(()) => AuthOutcome::Continue,
                    Err(AuthError::AccessTokenExpired) => {
                        if !state.config.enable_refresh_tokens {
                            log::warn!(
                                "session expired and access token refresh is disabled, client_ip={client_ip} email={} expired_on={}",
                                user.email,
                                user.expires_at,
                            );
                            AuthOutcome::Redirect {
                                clear_session: false,
                            }
                        } else {
                            log::info!(
                                "access token for user has expired, attempting to refresh the token, client_ip={client_ip} email={}",
                                user.email,
                            );
                            match refresh::refresh_session(req.request(), &state, &user).await {
                                Ok(refreshed) => AuthOutcome::Refreshed(refreshed),
                                Err(err @ (AuthError::Encode(_) | AuthError::Encryption)) => {
                                    AuthOutcome::Deny {
                                        server_error: true,
                                        message: err.to_string(),
                                        clear_session: false,
                                    }
                                }
                                Err(
                                    AuthError::RefreshTokenExpired
                                    | AuthError::TokenParse(_)
                                    | AuthError::TokenClaims(_),
                                ) => {
                                    log::warn!(
                                        "refresh token rejected, clearing session, client_ip={client_ip} email={}",
                                        user.email,
                                    );
                                    AuthOutcome::Redirect {
                                        clear_session: true,
                                    }
                                }
                                Err(err) => {
                                    log::warn!(
                                        "unable to refresh the access token, client_ip={client_ip} error={err}"
                                    );
                                    AuthOutcome::Redirect {
                                        clear_session: false,
                                    }
                                }
                            }
                        }
                    }
                    Err(AuthError::Scope(missing)) => {
                        log::warn!(
                            "access token is missing a required scope, client_ip={client_ip} scope={missing}"
                        );
                        AuthOutcome::Deny {
                            server_error: false,
                            message: "403 Forbidden".to_string(),
                            clear_session: false,
                        }
                    }
                    Err(err) => {
                        log::warn!(
                            "access token failed verification, client_ip={client_ip} error={err}"
                        );
                        AuthOutcome::Deny {
                            server_error: false,
                            message: "403 Forbidden".to_string(),
                            clear_session: !user.is_bearer(),
                        }
                    }
                }
            };

            match outcome {
                AuthOutcome::Continue => {
                    let res = service.call(req).await?;
                    Ok(res.map_into_left_body())
                }
                AuthOutcome::Refreshed(refreshed) => {
                    scope.set_identity(refreshed.identity);
                    let mut res = service.call(req).await?;
                    for cookie in &refreshed.cookies {
                        if let Err(err) = res.response_mut().add_cookie(cookie) {
                            log::error!("unable to append refreshed session cookie: {err}");
                        }
                    }
                    Ok(res.map_into_left_body())
                }
                AuthOutcome::Redirect { clear_session } => {
                    scope.deny();
                    let mut response = handlers::redirect_to_authorization(req.request(), &state);
                    if clear_session {
                        for cookie in
                            cookies::clear_all_session_cookies(&state.config, req.request())
                        {
                            let _ = response.add_cookie(&cookie);
                        }
                    }
                    Ok(req.into_response(response).map_into_right_body())
                }
                AuthOutcome::Deny {
                    server_error,
                    message,
                    clear_session,
                } => {
                    scope.deny();
                    let mut builder = if server_error {
                        HttpResponse::InternalServerError()
                    } else {
                        HttpResponse::Forbidden()
                    };
                    if clear_session {
                        for cookie in
                            cookies::clear_all_session_cookies(&state.config, req.request())
                        {
                            builder.cookie(cookie);
                        }
                    }
                    let response = builder.body(message);
                    Ok(req.into_response(response).map_into_right_body())
                }
            }
        })
    }
}

/// Admission: the policy evaluator applied to one resource.
pub struct Admission {
    resource: Rc<Resource>,
}

impl Admission {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource: Rc::new(resource),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for Admission
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = AdmissionMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AdmissionMiddleware {
            service: Rc::new(service),
            resource: Rc::clone(&self.resource),
        }))
    }
}

pub struct AdmissionMiddleware<S> {
    service: Rc<S>,
    resource: Rc<Resource>,
}

impl<S, B> Service<ServiceRequest> for AdmissionMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let resource = Rc::clone(&self.resource);

        Box::pin(async move {
            let scope = request_scope(&req);
            // a prior stage already rendered the decision
            if scope.is_denied() {
                let res = service.call(req).await?;
                return Ok(res.map_into_left_body());
            }

            let claim_matches = req
                .app_data::<Data<ProxyState>>()
                .map(|state| state.claim_matches.clone())
                .unwrap_or_default();

            let permitted = match scope.identity() {
                Some(user) => {
                    let permitted = policy::allow(&resource, &user, &claim_matches);
                    if permitted {
                        log::debug!(
                            "access permitted to resource, access=permitted email={} resource={}",
                            user.email,
                            resource.url,
                        );
                    } else {
                        log::warn!(
                            "access denied by policy, access=denied email={} resource={} roles={}",
                            user.email,
                            resource.url,
                            resource.roles.join(","),
                        );
                    }
                    permitted
                }
                None => false,
            };

            if !permitted {
                scope.deny();
                let response = HttpResponse::Forbidden().body("403 Forbidden");
                return Ok(req.into_response(response).map_into_right_body());
            }

            let res = service.call(req).await?;
            Ok(res.map_into_left_body())
        })
    }
}

/// Double-submit CSRF for cookie-session requests on resources that ask
/// for it. Safe methods, bearer credentials and unauthenticated or already
/// denied requests skip the check; successful responses carry the token in
/// the configured header so clients can re-submit it.
pub struct CsrfProtection {
    resource: Rc<Resource>,
}

impl CsrfProtection {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource: Rc::new(resource),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for CsrfProtection
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = CsrfProtectionMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(CsrfProtectionMiddleware {
            service: Rc::new(service),
            resource: Rc::clone(&self.resource),
        }))
    }
}

pub struct CsrfProtectionMiddleware<S> {
    service: Rc<S>,
    resource: Rc<Resource>,
}

impl<S, B> Service<ServiceRequest> for CsrfProtectionMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let resource = Rc::clone(&self.resource);

        Box::pin(async move {
            let state = req.app_data::<Data<ProxyState>>().cloned();
            let scope = request_scope(&req);

            let applies = state
                .as_ref()
                .map(|state| state.config.enable_csrf && resource.enable_csrf)
                .unwrap_or(false);
            let user = scope.identity();
            let skip = !applies
                || scope.is_denied()
                || user.as_ref().map(|u| u.is_bearer()).unwrap_or(true);
            if skip {
                let res = service.call(req).await?;
                return Ok(res.map_into_left_body());
            }
            // applies, so the state exists and validation guaranteed a key
            let state = state.expect("csrf applies only with proxy state present");
            let Some(cipher) = state.cipher.as_ref() else {
                let res = service.call(req).await?;
                return Ok(res.map_into_left_body());
            };

            let existing = csrf::secret_from_request(req.request(), &state.config, cipher);
            let had_cookie = existing.is_some();
            let secret = existing.unwrap_or_else(csrf::mint_secret);

            if !csrf::is_safe_method(req.method()) {
                let presented = req
                    .headers()
                    .get(state.config.csrf_header.as_str())
                    .and_then(|v| v.to_str().ok());
                let valid = had_cookie
                    && presented
                        .map(|token| csrf::tokens_match(&secret, token))
                        .unwrap_or(false);
                if !valid {
                    log::warn!(
                        "csrf check failed, method={} resource={}",
                        req.method(),
                        resource.url,
                    );
                    scope.deny();
                    return Ok(req.into_response(csrf::forbidden()).map_into_right_body());
                }
            }

            let mint_cookie = if had_cookie {
                None
            } else {
                match cipher.encrypt(&secret) {
                    Ok(sealed) => Some(csrf::build_cookie(
                        &state.config,
                        &cookies::request_host(req.request()),
                        sealed,
                    )),
                    Err(err) => {
                        scope.deny();
                        let response = HttpResponse::InternalServerError().body(err.to_string());
                        return Ok(req.into_response(response).map_into_right_body());
                    }
                }
            };

            let mut res = service.call(req).await?;
            if let Some(cookie) = mint_cookie {
                if let Err(err) = res.response_mut().add_cookie(&cookie) {
                    log::error!("unable to append csrf cookie: {err}");
                }
            }
            // redirected responses never carry the token
            if res.headers().get(LOCATION).is_none() {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::try_from(state.config.csrf_header.as_str()),
                    HeaderValue::from_str(&secret),
                ) {
                    res.headers_mut().insert(name, value);
                }
            }
            Ok(res.map_into_left_body())
        })
    }
}

/// Stamps the configured identity headers on the upstream request.
pub struct IdentityHeaders {
    setters: Rc<Vec<Setter>>,
}

impl IdentityHeaders {
    pub fn new(config: &crate::config::Config) -> Self {
        Self {
            setters: Rc::new(identity_header_setters(config)),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for IdentityHeaders
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Transform = IdentityHeadersMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(IdentityHeadersMiddleware {
            service,
            setters: Rc::clone(&self.setters),
        }))
    }
}

pub struct IdentityHeadersMiddleware<S> {
    service: S,
    setters: Rc<Vec<Setter>>,
}

impl<S, B> Service<ServiceRequest> for IdentityHeadersMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = S::Future;

    forward_ready!(service);

    fn call(&self, mut req: ServiceRequest) -> Self::Future {
        let identity = req
            .extensions()
            .get::<ScopeHandle>()
            .filter(|scope| !scope.is_denied())
            .and_then(|scope| scope.identity());
        if let Some(user) = identity {
            for setter in self.setters.iter() {
                setter(&mut req, &user);
            }
        }
        self.service.call(req)
    }
}
