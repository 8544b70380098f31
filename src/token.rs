use crate::errors::AuthError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// How the credential reached the proxy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    /// Reassembled from the session cookie envelopes.
    CookieSession,
    /// Presented as `Authorization: Bearer`.
    Bearer,
}

/// Decode the claim set of a compact JWT without verifying the signature.
/// Verification is the OIDC client's job; this is the codec only.
pub(crate) fn parse_claims(raw: &str) -> Result<Map<String, Value>, AuthError> {
    let mut parts = raw.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::TokenParse(
            "expected three dot-separated segments".to_string(),
        ));
    };
    let decoded = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|err| AuthError::TokenParse(format!("payload is not base64url: {err}")))?;
    match serde_json::from_slice::<Value>(&decoded) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(AuthError::TokenParse("payload is not an object".to_string())),
        Err(err) => Err(AuthError::TokenParse(format!("payload is not JSON: {err}"))),
    }
}

/// A single string claim. Absent claims are `None`; a claim of any other
/// shape is a [`AuthError::ClaimType`].
pub(crate) fn string_claim(
    claims: &Map<String, Value>,
    name: &str,
) -> Result<Option<String>, AuthError> {
    match claims.get(name) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(AuthError::ClaimType(name.to_string())),
    }
}

/// A claim holding a list of strings.
pub(crate) fn strings_claim(
    claims: &Map<String, Value>,
    name: &str,
) -> Result<Option<Vec<String>>, AuthError> {
    match claims.get(name) {
        None => Ok(None),
        Some(Value::Array(values)) => values
            .iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.clone()),
                _ => Err(AuthError::ClaimType(name.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(_) => Err(AuthError::ClaimType(name.to_string())),
    }
}

fn optional_string(claims: &Map<String, Value>, name: &str) -> String {
    claims
        .get(name)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn audiences(claims: &Map<String, Value>) -> Vec<String> {
    match claims.get("aud") {
        Some(Value::String(aud)) => vec![aud.clone()],
        Some(Value::Array(auds)) => auds
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn role_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.get("roles"))
        .and_then(Value::as_array)
        .map(|roles| {
            roles
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Realm roles plain, client roles prefixed `client:role`.
fn flattened_roles(claims: &Map<String, Value>) -> Vec<String> {
    let mut roles = role_list(claims.get("realm_access"));
    if let Some(Value::Object(clients)) = claims.get("resource_access") {
        for (client, access) in clients {
            for role in role_list(Some(access)) {
                roles.push(format!("{client}:{role}"));
            }
        }
    }
    roles
}

/// The caller's identity for the lifetime of one request, derived from a
/// parsed access token. Owned exclusively by the request scope; only the
/// refresh coordinator replaces it.
#[derive(Clone, Debug)]
pub struct Identity {
    /// Subject claim.
    pub id: String,
    /// Preferred username, falling back to email, then subject.
    pub name: String,
    pub email: String,
    pub display_name: String,
    pub audiences: Vec<String>,
    pub roles: Vec<String>,
    pub groups: Vec<String>,
    /// The full claim set for custom-claim headers and match-claim policies.
    pub claims: Map<String, Value>,
    pub expires_at: DateTime<Utc>,
    /// The compact serialized access token as presented.
    pub token: String,
    /// Opaque refresh credential, when one accompanies the session.
    pub refresh_token: Option<String>,
    pub kind: TokenKind,
}

impl Identity {
    pub fn from_token(raw: &str, kind: TokenKind) -> Result<Self, AuthError> {
        let claims = parse_claims(raw)?;

        let id = string_claim(&claims, "sub")?
            .ok_or_else(|| AuthError::TokenClaims("subject claim missing".to_string()))?;
        let exp = claims
            .get("exp")
            .and_then(Value::as_i64)
            .ok_or_else(|| AuthError::TokenClaims("expiry claim missing".to_string()))?;
        let expires_at = DateTime::<Utc>::from_timestamp(exp, 0)
            .ok_or_else(|| AuthError::TokenClaims("expiry claim out of range".to_string()))?;

        let email = optional_string(&claims, "email");
        let mut name = optional_string(&claims, "preferred_username");
        if name.is_empty() {
            name = if email.is_empty() { id.clone() } else { email.clone() };
        }

        Ok(Self {
            id,
            name,
            email: email.clone(),
            display_name: optional_string(&claims, "name"),
            audiences: audiences(&claims),
            roles: flattened_roles(&claims),
            groups: strings_claim(&claims, "groups")
                .unwrap_or_default()
                .unwrap_or_default(),
            claims,
            expires_at,
            token: raw.to_string(),
            refresh_token: None,
            kind,
        })
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }

    pub fn is_bearer(&self) -> bool {
        self.kind == TokenKind::Bearer
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    /// Compact JWT with an unverifiable signature, good enough for codec
    /// and policy tests.
    pub(crate) fn fake_token(payload: &Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.to_string());
        format!("{header}.{body}.c2lnbmF0dXJl")
    }

    pub(crate) fn claims_in(seconds: i64) -> Value {
        json!({
            "sub": "1e5c75ec-1a23-4c1f-b2f0-90d10b8f8a22",
            "preferred_username": "jdoe",
            "email": "jdoe@example.com",
            "name": "Jane Doe",
            "aud": ["account", "gateway"],
            "exp": (Utc::now() + Duration::seconds(seconds)).timestamp(),
            "iat": Utc::now().timestamp(),
            "realm_access": {"roles": ["user"]},
            "resource_access": {"gateway": {"roles": ["admin"]}},
            "groups": ["/engineering"],
            "scope": "openid profile email",
        })
    }

    #[test]
    fn test_parse_rejects_malformed_tokens() {
        for raw in ["", "one.two", "a.b.c.d", "!!.$$.%%"] {
            assert!(matches!(parse_claims(raw), Err(AuthError::TokenParse(_))), "{raw}");
        }
    }

    #[test]
    fn test_identity_from_token() {
        let identity = Identity::from_token(&fake_token(&claims_in(300)), TokenKind::CookieSession)
            .unwrap();
        assert_eq!(identity.id, "1e5c75ec-1a23-4c1f-b2f0-90d10b8f8a22");
        assert_eq!(identity.name, "jdoe");
        assert_eq!(identity.email, "jdoe@example.com");
        assert_eq!(identity.display_name, "Jane Doe");
        assert_eq!(identity.audiences, ["account", "gateway"]);
        assert_eq!(identity.roles, ["user", "gateway:admin"]);
        assert_eq!(identity.groups, ["/engineering"]);
        assert!(!identity.is_expired());
        assert!(!identity.is_bearer());
    }

    #[test]
    fn test_identity_expired() {
        let identity =
            Identity::from_token(&fake_token(&claims_in(-300)), TokenKind::Bearer).unwrap();
        assert!(identity.is_expired());
        assert!(identity.is_bearer());
    }

    #[test]
    fn test_identity_requires_subject_and_expiry() {
        let no_sub = fake_token(&json!({"exp": 4_000_000_000u64}));
        assert!(matches!(
            Identity::from_token(&no_sub, TokenKind::Bearer),
            Err(AuthError::TokenClaims(_))
        ));
        let no_exp = fake_token(&json!({"sub": "abc"}));
        assert!(matches!(
            Identity::from_token(&no_exp, TokenKind::Bearer),
            Err(AuthError::TokenClaims(_))
        ));
    }

    #[test]
    fn test_name_falls_back_to_email_then_subject() {
        let with_email = fake_token(&json!({
            "sub": "abc", "exp": 4_000_000_000u64, "email": "x@example.com"
        }));
        let identity = Identity::from_token(&with_email, TokenKind::Bearer).unwrap();
        assert_eq!(identity.name, "x@example.com");

        let bare = fake_token(&json!({"sub": "abc", "exp": 4_000_000_000u64}));
        let identity = Identity::from_token(&bare, TokenKind::Bearer).unwrap();
        assert_eq!(identity.name, "abc");
    }

    #[test]
    fn test_string_claim_type_mismatch() {
        let claims = parse_claims(&fake_token(&json!({
            "sub": "abc", "exp": 4_000_000_000u64, "level": 4
        })))
        .unwrap();
        assert_eq!(string_claim(&claims, "sub").unwrap().as_deref(), Some("abc"));
        assert_eq!(string_claim(&claims, "missing").unwrap(), None);
        assert!(matches!(
            string_claim(&claims, "level"),
            Err(AuthError::ClaimType(_))
        ));
    }

    #[test]
    fn test_strings_claim() {
        let claims = parse_claims(&fake_token(&json!({
            "sub": "abc", "exp": 4_000_000_000u64,
            "groups": ["a", "b"], "mixed": ["a", 1]
        })))
        .unwrap();
        assert_eq!(
            strings_claim(&claims, "groups").unwrap().unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(matches!(
            strings_claim(&claims, "mixed"),
            Err(AuthError::ClaimType(_))
        ));
        assert!(matches!(
            strings_claim(&claims, "sub"),
            Err(AuthError::ClaimType(_))
        ));
    }

    #[test]
    fn test_single_audience_string() {
        let claims = fake_token(&json!({"sub": "abc", "exp": 4_000_000_000u64, "aud": "account"}));
        let identity = Identity::from_token(&claims, TokenKind::Bearer).unwrap();
        assert_eq!(identity.audiences, ["account"]);
    }
}
