use crate::config::Config;
use actix_web::{
    cookie::{
        time::{Duration, OffsetDateTime},
        Cookie, Expiration,
    },
    HttpRequest,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use uuid::Uuid;

/// Hard ceiling a single `Set-Cookie` value may occupy.
const MAX_COOKIE_LENGTH: usize = 4069;

/// Upper bound when probing for chunk cookies to clear. A refresh token can
/// exceed a browser's per-cookie limit many times over.
const CHUNK_CLEAR_BOUND: usize = 600;

/// How far in the past a clearing cookie expires.
const CLEAR_EXPIRY_HOURS: i64 = 10;

/// Cookie domain: the configured domain, else the request host with any
/// port stripped.
pub(crate) fn cookie_domain(config: &Config, host: &str) -> String {
    if config.cookie_domain.is_empty() {
        host.split(':').next().unwrap_or_default().to_string()
    } else {
        config.cookie_domain.clone()
    }
}

pub(crate) fn request_host(req: &HttpRequest) -> String {
    req.connection_info().host().to_string()
}

fn build_cookie(
    config: &Config,
    host: &str,
    name: String,
    value: String,
    expires: Option<OffsetDateTime>,
) -> Cookie<'static> {
    let mut builder = Cookie::build(name, value)
        .domain(cookie_domain(config, host))
        .path("/")
        .http_only(config.http_only_cookie)
        .secure(config.secure_cookie)
        .same_site(config.same_site_cookie.to_same_site());
    if let Some(expires) = expires {
        builder = builder.expires(Expiration::DateTime(expires));
    }
    builder.finish()
}

fn drop_expiry(config: &Config, ttl: Duration) -> Option<OffsetDateTime> {
    if config.enable_session_cookies || ttl.is_zero() {
        None
    } else {
        Some(OffsetDateTime::now_utc().saturating_add(ttl))
    }
}

/// Per-chunk body budget for `name` on this request.
///
/// Starts from the per-cookie ceiling and subtracts the cookie name, the
/// domain and the attribute literals that will actually be emitted. The
/// arithmetic is part of the wire format: changing it moves chunk
/// boundaries for sessions already held by browsers.
pub(crate) fn max_cookie_chunk_length(config: &Config, req: &HttpRequest, name: &str) -> usize {
    let mut budget = MAX_COOKIE_LENGTH - name.len();
    budget -= cookie_domain(config, &request_host(req)).len();
    if config.http_only_cookie {
        budget -= "HttpOnly; ".len();
    }
    if !config.enable_session_cookies {
        budget -= "Expires=Mon, 02 Jan 2006 03:04:05 MST; ".len();
    }
    if config.secure_cookie {
        budget -= "Secure".len();
    }
    budget
}

/// Write `value` under `name`, splitting into `name`, `name-1`, `name-2`, …
/// when it exceeds the per-chunk budget.
pub(crate) fn drop_cookie_with_chunks(
    config: &Config,
    req: &HttpRequest,
    name: &str,
    value: &str,
    ttl: Duration,
) -> Vec<Cookie<'static>> {
    let host = request_host(req);
    let expires = drop_expiry(config, ttl);
    let budget = max_cookie_chunk_length(config, req, name);
    if value.len() <= budget {
        return vec![build_cookie(
            config,
            &host,
            name.to_string(),
            value.to_string(),
            expires,
        )];
    }

    let mut cookies = vec![build_cookie(
        config,
        &host,
        name.to_string(),
        value[0..budget].to_string(),
        expires,
    )];
    let mut start = budget;
    while start < value.len() {
        let end = usize::min(start + budget, value.len());
        cookies.push(build_cookie(
            config,
            &host,
            format!("{}-{}", name, start / budget),
            value[start..end].to_string(),
            expires,
        ));
        start = end;
    }
    cookies
}

pub(crate) fn drop_access_token_cookie(
    config: &Config,
    req: &HttpRequest,
    value: &str,
    ttl: Duration,
) -> Vec<Cookie<'static>> {
    drop_cookie_with_chunks(config, req, &config.cookie_access_name, value, ttl)
}

pub(crate) fn drop_refresh_token_cookie(
    config: &Config,
    req: &HttpRequest,
    value: &str,
    ttl: Duration,
) -> Vec<Cookie<'static>> {
    drop_cookie_with_chunks(config, req, &config.cookie_refresh_name, value, ttl)
}

/// Mint the state parameter and the transient cookies carried across the
/// authorization redirect: `request_uri` holds the base64 of the original
/// URI, `request_state` the state token. Both are session cookies.
pub(crate) fn write_state_parameter_cookies(
    config: &Config,
    req: &HttpRequest,
    request_uri: &str,
) -> (String, Vec<Cookie<'static>>) {
    let host = request_host(req);
    let state = Uuid::new_v4().to_string();
    let cookies = vec![
        build_cookie(
            config,
            &host,
            config.cookie_request_uri_name.clone(),
            STANDARD.encode(request_uri),
            None,
        ),
        build_cookie(
            config,
            &host,
            config.cookie_request_state_name.clone(),
            state.clone(),
            None,
        ),
    ];
    (state, cookies)
}

fn clearing_cookie(config: &Config, host: &str, name: String) -> Cookie<'static> {
    build_cookie(
        config,
        host,
        name,
        String::new(),
        Some(OffsetDateTime::now_utc() - Duration::hours(CLEAR_EXPIRY_HOURS)),
    )
}

/// Clear the base cookie and every chunk the request carries, probing
/// `name-1` upward until a gap or the scan bound.
pub(crate) fn clear_chunked_cookies(
    config: &Config,
    req: &HttpRequest,
    name: &str,
) -> Vec<Cookie<'static>> {
    let host = request_host(req);
    let mut cookies = vec![clearing_cookie(config, &host, name.to_string())];
    for i in 1..CHUNK_CLEAR_BOUND {
        let chunk_name = format!("{name}-{i}");
        if req.cookie(&chunk_name).is_none() {
            break;
        }
        cookies.push(clearing_cookie(config, &host, chunk_name));
    }
    cookies
}

/// Clear both session envelopes.
pub(crate) fn clear_all_session_cookies(config: &Config, req: &HttpRequest) -> Vec<Cookie<'static>> {
    let mut cookies = clear_chunked_cookies(config, req, &config.cookie_access_name);
    cookies.extend(clear_chunked_cookies(config, req, &config.cookie_refresh_name));
    cookies
}

pub(crate) fn clear_state_parameter_cookies(
    config: &Config,
    req: &HttpRequest,
) -> Vec<Cookie<'static>> {
    let host = request_host(req);
    vec![
        clearing_cookie(config, &host, config.cookie_request_uri_name.clone()),
        clearing_cookie(config, &host, config.cookie_request_state_name.clone()),
    ]
}

/// Reassemble an envelope: the base cookie, then `name-1`, `name-2`, …
/// concatenated while the numbering stays dense.
pub(crate) fn read_envelope(req: &HttpRequest, name: &str) -> Option<String> {
    let mut value = req.cookie(name)?.value().to_string();
    let mut index = 1;
    while let Some(chunk) = req.cookie(&format!("{name}-{index}")) {
        value.push_str(chunk.value());
        index += 1;
    }
    Some(value)
}

/// Strip a trailing `-<digits>` chunk suffix from a cookie name.
pub(crate) fn strip_chunk_suffix(name: &str) -> &str {
    match name.rsplit_once('-') {
        Some((base, suffix)) if !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) => {
            base
        }
        _ => name,
    }
}

/// Rebuild the `Cookie` header without the named envelopes (chunks
/// included). Returns `None` when nothing was removed.
pub(crate) fn filter_cookie_header(req: &HttpRequest, removed: &[&str]) -> Option<String> {
    let cookies = req.cookies().ok()?;
    let mut kept: Vec<String> = Vec::with_capacity(cookies.len());
    let mut at_least_once = false;
    for cookie in cookies.iter() {
        if removed.contains(&strip_chunk_suffix(cookie.name())) {
            at_least_once = true;
            continue;
        }
        kept.push(format!("{}={}", cookie.name(), cookie.value()));
    }
    at_least_once.then(|| kept.join("; "))
}
