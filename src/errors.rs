use thiserror::Error;

/// The error taxonomy of the authentication pipeline.
///
/// Every stage classifies a failure exactly once into one of these kinds;
/// the middleware decides the terminal action (redirect, 403, 500) from the
/// kind alone, never from the message.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("no session found in request")]
    NoSessionFound,
    #[error("access token has expired")]
    AccessTokenExpired,
    #[error("refresh token has expired")]
    RefreshTokenExpired,
    #[error("token signature verification failed: {0}")]
    TokenSignature(String),
    #[error("token claims rejected: {0}")]
    TokenClaims(String),
    #[error("unable to parse token: {0}")]
    TokenParse(String),
    #[error("claim {0} has an unexpected type")]
    ClaimType(String),
    #[error("required scope {0} absent from token")]
    Scope(String),
    #[error("unable to encode session state: {0}")]
    Encode(String),
    #[error("unable to decrypt session state")]
    Encryption,
    #[error("refresh store failure: {0}")]
    Store(String),
    #[error("access denied by resource policy")]
    Policy,
    #[error("token not validated by userinfo endpoint")]
    Userinfo,
    #[error("identity provider request failed: {0}")]
    Network(String),
    #[error("provider discovery failed: {0}")]
    Discovery(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}
