use crate::config::Config;
use crate::cookies;
use crate::crypto::TokenCipher;
use crate::errors::AuthError;
use crate::token::{Identity, TokenKind};
use actix_web::{http::header, HttpRequest};

const BEARER_SCHEME: &str = "Bearer ";

/// Reconstruct the caller's identity from the request alone.
///
/// Resolution order is bearer header first, then the access cookie
/// envelope. This never performs I/O; signature verification and refresh
/// happen in later stages.
pub(crate) fn identity_from_request(
    req: &HttpRequest,
    config: &Config,
    cipher: Option<&TokenCipher>,
) -> Result<Identity, AuthError> {
    if let Some(value) = req.headers().get(header::AUTHORIZATION) {
        let value = value
            .to_str()
            .map_err(|_| AuthError::TokenParse("authorization header is not ASCII".to_string()))?;
        let token = value.strip_prefix(BEARER_SCHEME).ok_or_else(|| {
            AuthError::TokenParse("authorization header is not a bearer credential".to_string())
        })?;
        return Identity::from_token(token, TokenKind::Bearer);
    }

    let Some(sealed) = cookies::read_envelope(req, &config.cookie_access_name) else {
        return Err(AuthError::NoSessionFound);
    };
    let token = match unseal(config, cipher, &sealed) {
        Ok(token) => token,
        Err(err) => {
            // an undecryptable cookie cannot loop: re-authentication mints
            // a fresh envelope under the current key
            log::warn!("unable to decrypt session cookie, forcing re-authentication: {err}");
            return Err(AuthError::NoSessionFound);
        }
    };
    Identity::from_token(&token, TokenKind::CookieSession)
}

/// The refresh credential accompanying the session, when cookies carry it.
pub(crate) fn refresh_token_from_request(
    req: &HttpRequest,
    config: &Config,
    cipher: Option<&TokenCipher>,
) -> Option<String> {
    let sealed = cookies::read_envelope(req, &config.cookie_refresh_name)?;
    match unseal(config, cipher, &sealed) {
        Ok(token) => Some(token),
        Err(err) => {
            log::warn!("unable to decrypt refresh cookie: {err}");
            None
        }
    }
}

fn unseal(
    config: &Config,
    cipher: Option<&TokenCipher>,
    sealed: &str,
) -> Result<String, AuthError> {
    match cipher {
        Some(cipher) if config.enable_encrypted_token => cipher.decrypt(sealed),
        _ => Ok(sealed.to_string()),
    }
}

/// Seal a token for the cookie envelope, encrypting when configured.
pub(crate) fn seal(
    config: &Config,
    cipher: Option<&TokenCipher>,
    token: &str,
) -> Result<String, AuthError> {
    match cipher {
        Some(cipher) if config.enable_encrypted_token => cipher.encrypt(token),
        _ => Ok(token.to_string()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::token::test::{claims_in, fake_token};
    use actix_web::cookie::Cookie;
    use actix_web::test::TestRequest;

    #[test]
    fn test_bearer_header_wins_over_cookie() {
        let config = Config::default();
        let bearer = fake_token(&claims_in(60));
        let req = TestRequest::default()
            .insert_header((header::AUTHORIZATION, format!("Bearer {bearer}")))
            .cookie(Cookie::new("proxy-access", fake_token(&claims_in(120))))
            .to_http_request();

        let identity = identity_from_request(&req, &config, None).unwrap();
        assert!(identity.is_bearer());
        assert_eq!(identity.token, bearer);
    }

    #[test]
    fn test_cookie_session_resolution() {
        let config = Config::default();
        let token = fake_token(&claims_in(60));
        let req = TestRequest::default()
            .cookie(Cookie::new("proxy-access", token.clone()))
            .to_http_request();

        let identity = identity_from_request(&req, &config, None).unwrap();
        assert_eq!(identity.kind, TokenKind::CookieSession);
        assert_eq!(identity.token, token);
    }

    #[test]
    fn test_no_credential_is_no_session() {
        let req = TestRequest::default().to_http_request();
        assert!(matches!(
            identity_from_request(&req, &Config::default(), None),
            Err(AuthError::NoSessionFound)
        ));
    }

    #[test]
    fn test_non_bearer_authorization_is_rejected() {
        let req = TestRequest::default()
            .insert_header((header::AUTHORIZATION, "Basic dXNlcjpwYXNz"))
            .to_http_request();
        assert!(matches!(
            identity_from_request(&req, &Config::default(), None),
            Err(AuthError::TokenParse(_))
        ));
    }

    #[test]
    fn test_encrypted_cookie_round_trip() {
        let config = Config {
            enable_encrypted_token: true,
            ..Config::default()
        };
        let cipher = TokenCipher::new(&[9u8; 32]).unwrap();
        let token = fake_token(&claims_in(60));
        let sealed = seal(&config, Some(&cipher), &token).unwrap();
        assert_ne!(sealed, token);

        let req = TestRequest::default()
            .cookie(Cookie::new("proxy-access", sealed))
            .to_http_request();
        let identity = identity_from_request(&req, &config, Some(&cipher)).unwrap();
        assert_eq!(identity.token, token);
    }

    #[test]
    fn test_undecryptable_cookie_forces_reauthentication() {
        let config = Config {
            enable_encrypted_token: true,
            ..Config::default()
        };
        let cipher = TokenCipher::new(&[9u8; 32]).unwrap();
        let req = TestRequest::default()
            .cookie(Cookie::new("proxy-access", "garbage"))
            .to_http_request();
        assert!(matches!(
            identity_from_request(&req, &config, Some(&cipher)),
            Err(AuthError::NoSessionFound)
        ));
    }

    #[test]
    fn test_refresh_token_from_chunked_envelope() {
        let config = Config::default();
        let req = TestRequest::default()
            .cookie(Cookie::new("proxy-refresh", "abc"))
            .cookie(Cookie::new("proxy-refresh-1", "def"))
            .to_http_request();
        assert_eq!(
            refresh_token_from_request(&req, &config, None).unwrap(),
            "abcdef"
        );
    }
}
