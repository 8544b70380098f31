use crate::config::Config;
use crate::errors::AuthError;
use crate::metrics;
use crate::token;
use async_trait::async_trait;
use jsonwebtoken::jwk::{Jwk, JwkSet, KeyAlgorithm};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use oauth2::basic::BasicTokenType;
use oauth2::{
    AuthorizationCode, ClientId, ClientSecret, CsrfToken, RedirectUrl, RefreshToken,
    RequestTokenError, Scope,
};
use openidconnect::core::{
    CoreAuthDisplay, CoreAuthPrompt, CoreAuthenticationFlow, CoreClaimName, CoreClaimType,
    CoreClientAuthMethod, CoreErrorResponseType, CoreGenderClaim, CoreGrantType, CoreJsonWebKey,
    CoreJsonWebKeyType, CoreJsonWebKeyUse, CoreJweContentEncryptionAlgorithm,
    CoreJweKeyManagementAlgorithm, CoreJwsSigningAlgorithm, CoreResponseMode, CoreResponseType,
    CoreRevocableToken, CoreRevocationErrorResponse, CoreSubjectIdentifierType,
    CoreTokenIntrospectionResponse,
};
use openidconnect::reqwest::async_http_client;
use openidconnect::{
    AdditionalProviderMetadata, Client, EmptyAdditionalClaims, ExtraTokenFields, IdTokenFields,
    IssuerUrl, Nonce, OAuth2TokenResponse, ProviderMetadata, StandardErrorResponse,
    StandardTokenResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use url::Url;

const OIDC_DEFAULT_SCOPES: [&str; 3] = ["openid", "email", "profile"];
const IDP_RETRY_ATTEMPTS: u32 = 3;
const IDP_RETRY_BASE_DELAY_MS: u64 = 100;

/// Non-standard token-endpoint fields some providers return alongside the
/// grant; `refresh_expires_in` carries the refresh-token TTL.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct RefreshExpiryFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) refresh_expires_in: Option<u64>,
}

impl ExtraTokenFields for RefreshExpiryFields {}

type ProxyIdTokenFields = IdTokenFields<
    EmptyAdditionalClaims,
    RefreshExpiryFields,
    CoreGenderClaim,
    CoreJweContentEncryptionAlgorithm,
    CoreJwsSigningAlgorithm,
    CoreJsonWebKeyType,
>;

pub(crate) type ProxyTokenResponse = StandardTokenResponse<ProxyIdTokenFields, BasicTokenType>;

type ProxyOidcClient = Client<
    EmptyAdditionalClaims,
    CoreAuthDisplay,
    CoreGenderClaim,
    CoreJweContentEncryptionAlgorithm,
    CoreJwsSigningAlgorithm,
    CoreJsonWebKeyType,
    CoreJsonWebKeyUse,
    CoreJsonWebKey,
    CoreAuthPrompt,
    StandardErrorResponse<CoreErrorResponseType>,
    ProxyTokenResponse,
    BasicTokenType,
    CoreTokenIntrospectionResponse,
    CoreRevocableToken,
    CoreRevocationErrorResponse,
>;

/// Discovery metadata extended with the RP-initiated-logout endpoint.
#[derive(Clone, Debug, Deserialize, Serialize)]
struct EndSessionMetadata {
    #[serde(default)]
    end_session_endpoint: Option<String>,
}

impl AdditionalProviderMetadata for EndSessionMetadata {}

type LogoutProviderMetadata = ProviderMetadata<
    EndSessionMetadata,
    CoreAuthDisplay,
    CoreClientAuthMethod,
    CoreClaimName,
    CoreClaimType,
    CoreGrantType,
    CoreJweContentEncryptionAlgorithm,
    CoreJweKeyManagementAlgorithm,
    CoreJwsSigningAlgorithm,
    CoreJsonWebKeyType,
    CoreJsonWebKeyUse,
    CoreJsonWebKey,
    CoreResponseMode,
    CoreResponseType,
    CoreSubjectIdentifierType,
>;

/// Flattened view of one token-endpoint response.
#[derive(Clone, Debug, Default)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    pub expires_in: Option<Duration>,
    /// TTL of the refresh token when the provider reports one.
    pub refresh_expires_in: Option<Duration>,
}

impl From<&ProxyTokenResponse> for TokenSet {
    fn from(response: &ProxyTokenResponse) -> Self {
        let id_token = serde_json::to_value(response.extra_fields().id_token())
            .ok()
            .and_then(|v| v.as_str().map(str::to_string));
        Self {
            access_token: response.access_token().secret().clone(),
            refresh_token: response.refresh_token().map(|t| t.secret().clone()),
            id_token,
            expires_in: response.expires_in(),
            refresh_expires_in: response
                .extra_fields()
                .extra_fields()
                .refresh_expires_in
                .map(Duration::from_secs),
        }
    }
}

/// The provider-facing operations of the proxy. A trait so the pipeline
/// and the flow handlers can run against a mock in tests.
#[async_trait]
pub trait FlowClient: Send + Sync {
    /// Exchange an authorization code with client-secret-basic.
    async fn exchange_code(&self, code: String) -> Result<TokenSet, AuthError>;

    /// Trade a refresh token for a new token set.
    async fn refresh(&self, refresh_token: String) -> Result<TokenSet, AuthError>;

    /// Fetch the userinfo document with the given access token.
    async fn userinfo(&self, access_token: &str) -> Result<Map<String, Value>, AuthError>;

    /// Provider authorize endpoint with the given state parameter and the
    /// configured scopes.
    fn authorize_url(&self, state: &str) -> Url;

    fn end_session_url(&self) -> Option<Url>;
}

/// [`FlowClient`] backed by the provider's discovery document.
pub struct OpenIdFlow {
    client: ProxyOidcClient,
    http: reqwest::Client,
    userinfo_endpoint: Option<Url>,
    end_session_endpoint: Option<Url>,
    scopes: Vec<Scope>,
    timeout: Duration,
}

impl OpenIdFlow {
    /// Run discovery and build the flow client plus the access-token
    /// verifier from the provider JWKS.
    pub async fn discover(config: &Config) -> Result<(Self, TokenVerifier), AuthError> {
        let issuer = IssuerUrl::new(config.discovery_url.clone())
            .map_err(|err| AuthError::Discovery(err.to_string()))?;

        let mut metadata = None;
        for attempt in 0..IDP_RETRY_ATTEMPTS {
            match LogoutProviderMetadata::discover_async(issuer.clone(), async_http_client).await {
                Ok(found) => {
                    metadata = Some(found);
                    break;
                }
                Err(err) if attempt + 1 < IDP_RETRY_ATTEMPTS => {
                    log::warn!("provider discovery failed, retrying: {err}");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                Err(err) => return Err(AuthError::Discovery(err.to_string())),
            }
        }
        let metadata = metadata.ok_or_else(|| AuthError::Discovery("no metadata".to_string()))?;

        let jwks = serde_json::to_value(metadata.jwks())
            .map_err(|err| AuthError::Discovery(err.to_string()))?;
        let verifier = TokenVerifier::from_jwks(&jwks, Some(issuer.as_str()))?;

        let userinfo_endpoint = metadata.userinfo_endpoint().map(|u| u.url().clone());
        let end_session_endpoint = metadata
            .additional_metadata()
            .end_session_endpoint
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(|err| AuthError::Discovery(format!("end-session endpoint: {err}")))?;

        let redirect = RedirectUrl::new(config.redirect_uri())
            .map_err(|err| AuthError::Config(err.to_string()))?;
        let client = ProxyOidcClient::from_provider_metadata(
            metadata,
            ClientId::new(config.client_id.clone()),
            Some(ClientSecret::new(config.client_secret.clone())),
        )
        .set_redirect_uri(redirect);

        let mut scopes: Vec<Scope> = OIDC_DEFAULT_SCOPES
            .iter()
            .map(|s| Scope::new(s.to_string()))
            .collect();
        for scope in &config.scopes {
            if !scopes.iter().any(|s| s.as_str() == scope) {
                scopes.push(Scope::new(scope.clone()));
            }
        }

        Ok((
            Self {
                client,
                http: reqwest::Client::new(),
                userinfo_endpoint,
                end_session_endpoint,
                scopes,
                timeout: Duration::from_secs(config.upstream_timeout_secs),
            },
            verifier,
        ))
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(IDP_RETRY_BASE_DELAY_MS << attempt)
}

#[async_trait]
impl FlowClient for OpenIdFlow {
    async fn exchange_code(&self, code: String) -> Result<TokenSet, AuthError> {
        let start = Instant::now();
        let result = self
            .client
            .exchange_code(AuthorizationCode::new(code))
            .request_async(async_http_client)
            .await;
        metrics::OAUTH_TOKENS.with_label_values(&["exchange"]).inc();
        metrics::OAUTH_LATENCY
            .with_label_values(&["exchange"])
            .observe(start.elapsed().as_secs_f64());

        result
            .map(|response| TokenSet::from(&response))
            .map_err(|err| AuthError::Network(err.to_string()))
    }

    async fn refresh(&self, refresh_token: String) -> Result<TokenSet, AuthError> {
        let start = Instant::now();
        let result = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token))
            .request_async(async_http_client)
            .await;
        metrics::OAUTH_TOKENS.with_label_values(&["renew"]).inc();
        metrics::OAUTH_LATENCY
            .with_label_values(&["renew"])
            .observe(start.elapsed().as_secs_f64());

        match result {
            Ok(response) => Ok(TokenSet::from(&response)),
            Err(RequestTokenError::ServerResponse(response)) => {
                let description = response
                    .error_description()
                    .map(|d| d.as_str())
                    .unwrap_or_default();
                if matches!(response.error(), CoreErrorResponseType::InvalidGrant)
                    || description.contains("expired")
                {
                    Err(AuthError::RefreshTokenExpired)
                } else {
                    Err(AuthError::Network(format!(
                        "{:?}: {description}",
                        response.error()
                    )))
                }
            }
            Err(err) => Err(AuthError::Network(err.to_string())),
        }
    }

    async fn userinfo(&self, access_token: &str) -> Result<Map<String, Value>, AuthError> {
        let endpoint = self
            .userinfo_endpoint
            .clone()
            .ok_or_else(|| AuthError::Config("provider has no userinfo endpoint".to_string()))?;

        let mut last_error = None;
        for attempt in 0..IDP_RETRY_ATTEMPTS {
            match self
                .http
                .get(endpoint.clone())
                .bearer_auth(access_token)
                .timeout(self.timeout)
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => {
                    return response
                        .json::<Map<String, Value>>()
                        .await
                        .map_err(|_| AuthError::Userinfo);
                }
                Ok(_) => return Err(AuthError::Userinfo),
                Err(err) => {
                    last_error = Some(err);
                    if attempt + 1 < IDP_RETRY_ATTEMPTS {
                        tokio::time::sleep(backoff_delay(attempt)).await;
                    }
                }
            }
        }
        Err(AuthError::Network(
            last_error.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    fn authorize_url(&self, state: &str) -> Url {
        let state = CsrfToken::new(state.to_string());
        let mut request = self.client.authorize_url(
            CoreAuthenticationFlow::AuthorizationCode,
            move || state,
            Nonce::new_random,
        );
        for scope in &self.scopes {
            request = request.add_scope(scope.clone());
        }
        let (url, _, _) = request.url();
        url
    }

    fn end_session_url(&self) -> Option<Url> {
        self.end_session_endpoint.clone()
    }
}

/// Access-token verification against the provider's signing keys.
///
/// Keys come from the discovery JWKS; [`TokenVerifier::with_static_key`]
/// swaps in a symmetric key for tests.
pub struct TokenVerifier {
    keys: Vec<VerifierKey>,
    issuer: Option<String>,
    leeway: u64,
}

struct VerifierKey {
    kid: Option<String>,
    key: DecodingKey,
    algorithm: Algorithm,
}

impl TokenVerifier {
    const CLOCK_SKEW_SECONDS: u64 = 60;

    pub fn from_jwks(jwks: &Value, issuer: Option<&str>) -> Result<Self, AuthError> {
        let set: JwkSet = serde_json::from_value(jwks.clone())
            .map_err(|err| AuthError::Discovery(format!("jwks document: {err}")))?;

        let mut keys = Vec::with_capacity(set.keys.len());
        for jwk in &set.keys {
            if let Some(key) = decoding_key(jwk) {
                keys.push(key);
            }
        }
        if keys.is_empty() {
            return Err(AuthError::Discovery(
                "jwks document holds no usable signing keys".to_string(),
            ));
        }
        Ok(Self {
            keys,
            issuer: issuer.map(str::to_string),
            leeway: Self::CLOCK_SKEW_SECONDS,
        })
    }

    /// Symmetric verifier for tests and development setups.
    pub fn with_static_key(secret: &[u8], issuer: Option<&str>) -> Self {
        Self {
            keys: vec![VerifierKey {
                kid: None,
                key: DecodingKey::from_secret(secret),
                algorithm: Algorithm::HS256,
            }],
            issuer: issuer.map(str::to_string),
            leeway: Self::CLOCK_SKEW_SECONDS,
        }
    }

    fn select_key(&self, kid: Option<&str>, algorithm: Algorithm) -> Option<&VerifierKey> {
        if let Some(kid) = kid {
            if let Some(key) = self.keys.iter().find(|k| k.kid.as_deref() == Some(kid)) {
                return Some(key);
            }
        }
        self.keys
            .iter()
            .find(|k| k.algorithm == algorithm)
            .or_else(|| self.keys.first())
    }

    /// Verify signature and time claims, with a small clock skew. Expiry is
    /// the only recoverable failure.
    pub fn verify(&self, raw_token: &str) -> Result<(), AuthError> {
        let header = decode_header(raw_token)
            .map_err(|err| AuthError::TokenParse(err.to_string()))?;
        let key = self
            .select_key(header.kid.as_deref(), header.alg)
            .ok_or_else(|| AuthError::TokenSignature("no key matches the token".to_string()))?;

        let mut validation = Validation::new(key.algorithm);
        validation.leeway = self.leeway;
        validation.validate_nbf = true;
        validation.validate_aud = false;
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }

        decode::<Value>(raw_token, &key.key, &validation)
            .map(|_| ())
            .map_err(|err| match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::AccessTokenExpired,
                jsonwebtoken::errors::ErrorKind::ImmatureSignature
                | jsonwebtoken::errors::ErrorKind::InvalidIssuer
                | jsonwebtoken::errors::ErrorKind::InvalidAudience
                | jsonwebtoken::errors::ErrorKind::InvalidSubject
                | jsonwebtoken::errors::ErrorKind::MissingRequiredClaim(_) => {
                    AuthError::TokenClaims(err.to_string())
                }
                _ => AuthError::TokenSignature(err.to_string()),
            })
    }
}

fn decoding_key(jwk: &Jwk) -> Option<VerifierKey> {
    let key = DecodingKey::from_jwk(jwk).ok()?;
    let algorithm = jwk.common.key_algorithm.and_then(signing_algorithm)?;
    Some(VerifierKey {
        kid: jwk.common.key_id.clone(),
        key,
        algorithm,
    })
}

fn signing_algorithm(algorithm: KeyAlgorithm) -> Option<Algorithm> {
    match algorithm {
        KeyAlgorithm::HS256 => Some(Algorithm::HS256),
        KeyAlgorithm::HS384 => Some(Algorithm::HS384),
        KeyAlgorithm::HS512 => Some(Algorithm::HS512),
        KeyAlgorithm::RS256 => Some(Algorithm::RS256),
        KeyAlgorithm::RS384 => Some(Algorithm::RS384),
        KeyAlgorithm::RS512 => Some(Algorithm::RS512),
        KeyAlgorithm::ES256 => Some(Algorithm::ES256),
        KeyAlgorithm::ES384 => Some(Algorithm::ES384),
        KeyAlgorithm::PS256 => Some(Algorithm::PS256),
        KeyAlgorithm::PS384 => Some(Algorithm::PS384),
        KeyAlgorithm::PS512 => Some(Algorithm::PS512),
        KeyAlgorithm::EdDSA => Some(Algorithm::EdDSA),
        _ => None,
    }
}

/// The `scope` claim must contain every configured required scope.
pub(crate) fn check_required_scopes(raw_token: &str, required: &[String]) -> Result<(), AuthError> {
    if required.is_empty() {
        return Ok(());
    }
    let claims = token::parse_claims(raw_token)?;
    let scope = token::string_claim(&claims, "scope")
        .map_err(|_| AuthError::Scope("scope claim is not a string".to_string()))?
        .ok_or_else(|| AuthError::Scope("scope claim absent".to_string()))?;

    let available: HashSet<&str> = scope.split(' ').collect();
    for needed in required {
        if !available.contains(needed.as_str()) {
            return Err(AuthError::Scope(needed.clone()));
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use mockall::mock;
    use serde_json::json;

    mock! {
        pub FlowClientStruct {}

        #[async_trait]
        impl FlowClient for FlowClientStruct {
            async fn exchange_code(&self, code: String) -> Result<TokenSet, AuthError>;
            async fn refresh(&self, refresh_token: String) -> Result<TokenSet, AuthError>;
            async fn userinfo(&self, access_token: &str) -> Result<Map<String, Value>, AuthError>;
            fn authorize_url(&self, state: &str) -> Url;
            fn end_session_url(&self) -> Option<Url>;
        }
    }

    pub(crate) fn mock_flow() -> MockFlowClientStruct {
        MockFlowClientStruct::new()
    }

    pub(crate) const TEST_SECRET: &[u8] = b"an-hmac-secret-for-the-test-verifier";
    pub(crate) const TEST_ISSUER: &str = "https://idp.example.com/realms/main";

    /// HS256 token the test verifier accepts.
    pub(crate) fn signed_token(claims: &Value) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(TEST_SECRET),
        )
        .unwrap()
    }

    pub(crate) fn signed_claims(seconds: i64) -> Value {
        let mut claims = crate::token::test::claims_in(seconds);
        claims["iss"] = json!(TEST_ISSUER);
        claims
    }

    fn verifier() -> TokenVerifier {
        TokenVerifier::with_static_key(TEST_SECRET, Some(TEST_ISSUER))
    }

    #[test]
    fn test_verify_accepts_valid_token() {
        let token = signed_token(&signed_claims(300));
        assert!(verifier().verify(&token).is_ok());
    }

    #[test]
    fn test_verify_expired_beyond_leeway() {
        let token = signed_token(&signed_claims(-120));
        assert!(matches!(
            verifier().verify(&token),
            Err(AuthError::AccessTokenExpired)
        ));
    }

    #[test]
    fn test_verify_within_leeway_is_not_expired() {
        let token = signed_token(&signed_claims(-30));
        assert!(verifier().verify(&token).is_ok());
    }

    #[test]
    fn test_verify_tampered_signature() {
        let token = signed_token(&signed_claims(300));
        let tampered = encode(
            &Header::default(),
            &signed_claims(300),
            &EncodingKey::from_secret(b"some-other-secret"),
        )
        .unwrap();
        assert!(verifier().verify(&token).is_ok());
        assert!(matches!(
            verifier().verify(&tampered),
            Err(AuthError::TokenSignature(_))
        ));
    }

    #[test]
    fn test_verify_wrong_issuer_is_claims_error() {
        let mut claims = signed_claims(300);
        claims["iss"] = json!("https://evil.example.com");
        assert!(matches!(
            verifier().verify(&signed_token(&claims)),
            Err(AuthError::TokenClaims(_))
        ));
    }

    #[test]
    fn test_required_scopes_all_present() {
        let token = signed_token(&signed_claims(300));
        assert!(check_required_scopes(&token, &[]).is_ok());
        assert!(
            check_required_scopes(&token, &["openid".to_string(), "email".to_string()]).is_ok()
        );
    }

    #[test]
    fn test_required_scope_missing() {
        let token = signed_token(&signed_claims(300));
        assert!(matches!(
            check_required_scopes(&token, &["admin".to_string()]),
            Err(AuthError::Scope(scope)) if scope == "admin"
        ));
    }

    #[test]
    fn test_required_scope_claim_absent() {
        let mut claims = signed_claims(300);
        claims.as_object_mut().unwrap().remove("scope");
        assert!(matches!(
            check_required_scopes(&signed_token(&claims), &["openid".to_string()]),
            Err(AuthError::Scope(_))
        ));
    }

    #[test]
    fn test_token_response_carries_refresh_expiry() {
        let response: ProxyTokenResponse = serde_json::from_value(json!({
            "access_token": "at-123",
            "token_type": "bearer",
            "expires_in": 300,
            "refresh_token": "rt-456",
            "refresh_expires_in": 1800,
        }))
        .unwrap();

        let set = TokenSet::from(&response);
        assert_eq!(set.access_token, "at-123");
        assert_eq!(set.refresh_token.as_deref(), Some("rt-456"));
        assert_eq!(set.expires_in, Some(Duration::from_secs(300)));
        assert_eq!(set.refresh_expires_in, Some(Duration::from_secs(1800)));
    }

    #[test]
    fn test_token_response_without_refresh_expiry() {
        let response: ProxyTokenResponse = serde_json::from_value(json!({
            "access_token": "at-123",
            "token_type": "bearer",
        }))
        .unwrap();
        let set = TokenSet::from(&response);
        assert_eq!(set.refresh_expires_in, None);
        assert_eq!(set.refresh_token, None);
    }

    #[test]
    fn test_from_jwks_rejects_empty_document() {
        let err = TokenVerifier::from_jwks(&json!({"keys": []}), None)
            .err()
            .unwrap();
        assert!(matches!(err, AuthError::Discovery(_)));
    }
}
