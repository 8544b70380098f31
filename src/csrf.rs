use crate::config::Config;
use crate::crypto::TokenCipher;
use actix_web::cookie::Cookie;
use actix_web::http::Method;
use actix_web::{HttpRequest, HttpResponse};
use aes_gcm::aead::{rand_core::RngCore, OsRng};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use subtle::ConstantTimeEq;

const SECRET_LEN: usize = 32;

/// Methods that can never mutate state and therefore skip the check.
pub(crate) fn is_safe_method(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
    )
}

/// Fresh per-session CSRF secret, also the token value clients echo back.
pub(crate) fn mint_secret() -> String {
    let mut secret = [0u8; SECRET_LEN];
    OsRng.fill_bytes(&mut secret);
    URL_SAFE_NO_PAD.encode(secret)
}

/// The CSRF cookie mirrors the session cookie attributes and never
/// outlives the browser session.
pub(crate) fn build_cookie(config: &Config, host: &str, sealed: String) -> Cookie<'static> {
    Cookie::build(config.cookie_csrf_name.clone(), sealed)
        .domain(crate::cookies::cookie_domain(config, host))
        .path("/")
        .http_only(config.http_only_cookie)
        .secure(config.secure_cookie)
        .same_site(config.same_site_cookie.to_same_site())
        .finish()
}

/// The session's CSRF secret, when the request carries a decryptable
/// cookie.
pub(crate) fn secret_from_request(
    req: &HttpRequest,
    config: &Config,
    cipher: &TokenCipher,
) -> Option<String> {
    let cookie = req.cookie(&config.cookie_csrf_name)?;
    match cipher.decrypt(cookie.value()) {
        Ok(secret) => Some(secret),
        Err(err) => {
            log::warn!("unable to decrypt csrf cookie, reissuing: {err}");
            None
        }
    }
}

/// Constant-time comparison of the presented token with the secret.
pub(crate) fn tokens_match(secret: &str, presented: &str) -> bool {
    secret.as_bytes().ct_eq(presented.as_bytes()).into()
}

/// Uniform rejection for failed checks; no detail leaks to the client.
pub(crate) fn forbidden() -> HttpResponse {
    HttpResponse::Forbidden().body("CSRF token missing or invalid")
}
