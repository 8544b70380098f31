use crate::cookies;
use crate::errors::AuthError;
use crate::proxy::ProxyState;
use crate::session;
use crate::store::hash_key;
use crate::token::{Identity, TokenKind};
use actix_web::cookie::time::Duration;
use actix_web::cookie::Cookie;
use actix_web::HttpRequest;
use chrono::Utc;

/// Result of a successful refresh: the identity the request continues
/// with, plus the rewritten session cookies for the response.
pub(crate) struct RefreshedSession {
    pub identity: Identity,
    pub cookies: Vec<Cookie<'static>>,
}

/// Renew an expired access token.
///
/// The refresh credential comes from the store when one is configured
/// (keyed by the hash of the current access token), else from the refresh
/// cookie envelope. On success the access envelope is rewritten and the
/// rotated refresh token is persisted where the old one lived.
pub(crate) async fn refresh_session(
    req: &HttpRequest,
    state: &ProxyState,
    identity: &Identity,
) -> Result<RefreshedSession, AuthError> {
    let config = &state.config;
    let cipher = state.cipher.as_ref();

    let mut from_store = false;
    let mut refresh_token = None;
    if let Some(store) = &state.store {
        match store.get(&hash_key(&identity.token)).await {
            Ok(Some(token)) => {
                from_store = true;
                refresh_token = Some(token);
            }
            Ok(None) => {}
            Err(err) => {
                // store trouble must not end the session while the cookie
                // fallback can still carry it
                log::error!(
                    "unable to read refresh token from store, falling back to cookie: {err}"
                );
            }
        }
    }
    let refresh_token = refresh_token
        .or_else(|| session::refresh_token_from_request(req, config, cipher))
        .ok_or(AuthError::NoSessionFound)?;

    // a refresh credential that is itself a JWT past its expiry cannot
    // succeed at the provider
    if let Ok(parsed) = Identity::from_token(&refresh_token, TokenKind::CookieSession) {
        if parsed.is_expired() {
            return Err(AuthError::RefreshTokenExpired);
        }
    }

    let tokens = match state.flow.refresh(refresh_token.clone()).await {
        Ok(tokens) => tokens,
        Err(AuthError::RefreshTokenExpired) => {
            if let Some(store) = &state.store {
                if let Err(err) = store.delete(&hash_key(&identity.token)).await {
                    log::error!("unable to delete retired refresh token: {err}");
                }
            }
            return Err(AuthError::RefreshTokenExpired);
        }
        Err(err) => return Err(err),
    };

    let mut renewed = Identity::from_token(&tokens.access_token, identity.kind)?;

    let access_ttl = Duration::seconds((renewed.expires_at - Utc::now()).num_seconds().max(0));
    let refresh_ttl = tokens
        .refresh_expires_in
        .map(|ttl| Duration::seconds(ttl.as_secs() as i64))
        .unwrap_or(access_ttl);

    let sealed = session::seal(config, cipher, &tokens.access_token)?;
    let mut response_cookies = cookies::drop_access_token_cookie(config, req, &sealed, access_ttl);

    match &tokens.refresh_token {
        Some(rotated) => {
            renewed.refresh_token = Some(rotated.clone());
            if let Some(store) = &state.store {
                match store.set(&hash_key(&tokens.access_token), rotated).await {
                    Ok(()) => {
                        if let Err(err) = store.delete(&hash_key(&identity.token)).await {
                            log::error!("unable to delete retired refresh token: {err}");
                        }
                    }
                    Err(err) => {
                        log::error!(
                            "unable to persist refresh token, falling back to cookie: {err}"
                        );
                        let sealed_refresh = session::seal(config, cipher, rotated)?;
                        response_cookies.extend(cookies::drop_refresh_token_cookie(
                            config,
                            req,
                            &sealed_refresh,
                            refresh_ttl,
                        ));
                    }
                }
            } else {
                let sealed_refresh = session::seal(config, cipher, rotated)?;
                response_cookies.extend(cookies::drop_refresh_token_cookie(
                    config,
                    req,
                    &sealed_refresh,
                    refresh_ttl,
                ));
            }
        }
        None => {
            renewed.refresh_token = Some(refresh_token.clone());
            if from_store {
                // no rotation happened, so the entry has to move under the
                // new access token for the next lookup
                if let Some(store) = &state.store {
                    if let Err(err) = store.set(&hash_key(&tokens.access_token), &refresh_token).await
                    {
                        log::error!("unable to re-key refresh token in store: {err}");
                    }
                    if let Err(err) = store.delete(&hash_key(&identity.token)).await {
                        log::error!("unable to delete retired refresh token: {err}");
                    }
                }
            }
        }
    }

    Ok(RefreshedSession {
        identity: renewed,
        cookies: response_cookies,
    })
}
