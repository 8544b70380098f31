use crate::config::Config;
use crate::cookies;
use crate::token::Identity;
use actix_web::dev::ServiceRequest;
use actix_web::http::header::{HeaderName, HeaderValue, AUTHORIZATION, COOKIE};

/// One configured request-header setter.
pub(crate) type Setter = Box<dyn Fn(&mut ServiceRequest, &Identity) + Send + Sync>;

/// `groups` → `Groups`, `favorite_colour` → `Favorite-Colour`.
pub(crate) fn to_header_case(claim: &str) -> String {
    claim
        .split(|c| c == '_' || c == '-')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn set_header(req: &mut ServiceRequest, name: &str, value: &str) {
    let Ok(name) = HeaderName::try_from(name) else {
        return;
    };
    match HeaderValue::from_str(value) {
        Ok(value) => {
            req.headers_mut().insert(name, value);
        }
        Err(_) => {
            log::warn!("identity header {name} holds a non-ASCII value, skipping");
        }
    }
}

/// Build the ordered setter list once from configuration, the way the
/// chain applies it on every request that carries an identity.
pub(crate) fn identity_header_setters(config: &Config) -> Vec<Setter> {
    let mut setters: Vec<Setter> = Vec::new();

    if config.enable_claims_headers {
        setters.push(Box::new(|req, user| {
            set_header(req, "X-Auth-Audience", &user.audiences.join(","));
            set_header(req, "X-Auth-Email", &user.email);
            set_header(req, "X-Auth-ExpiresIn", &user.expires_at.to_string());
            set_header(req, "X-Auth-Groups", &user.groups.join(","));
            set_header(req, "X-Auth-Roles", &user.roles.join(","));
            set_header(req, "X-Auth-Subject", &user.id);
            set_header(req, "X-Auth-Userid", &user.name);
            set_header(req, "X-Auth-Username", &user.name);
        }));
    }

    if config.enable_token_header {
        setters.push(Box::new(|req, user| {
            set_header(req, "X-Auth-Token", &user.token);
        }));
    }

    if config.enable_authorization_header {
        setters.push(Box::new(|req, user| {
            set_header(req, AUTHORIZATION.as_str(), &format!("Bearer {}", user.token));
        }));
    }

    // session cookies are redacted from the upstream request unless the
    // configuration explicitly forwards them
    if !config.enable_authorization_cookies {
        let access = config.cookie_access_name.clone();
        let refresh = config.cookie_refresh_name.clone();
        setters.push(Box::new(move |req, _user| {
            let filtered =
                cookies::filter_cookie_header(req.request(), &[access.as_str(), refresh.as_str()]);
            if let Some(filtered) = filtered {
                if filtered.is_empty() {
                    req.headers_mut().remove(COOKIE);
                } else if let Ok(value) = HeaderValue::from_str(&filtered) {
                    req.headers_mut().insert(COOKIE, value);
                }
            }
        }));
    }

    if config.enable_claims_headers && !config.custom_claims_headers.is_empty() {
        let custom: Vec<(String, String)> = config
            .custom_claims_headers
            .iter()
            .map(|claim| (claim.clone(), format!("X-Auth-{}", to_header_case(claim))))
            .collect();
        setters.push(Box::new(move |req, user| {
            for (claim, header) in &custom {
                if let Some(value) = user.claims.get(claim) {
                    let rendered = match value.as_str() {
                        Some(s) => s.to_string(),
                        None => value.to_string(),
                    };
                    set_header(req, header, &rendered);
                }
            }
        }));
    }

    setters
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::token::{test::fake_token, TokenKind};
    use actix_web::cookie::Cookie;
    use actix_web::test::TestRequest;
    use serde_json::json;

    fn identity() -> Identity {
        Identity::from_token(
            &fake_token(&json!({
                "sub": "subject-1",
                "preferred_username": "jdoe",
                "email": "jdoe@example.com",
                "exp": 4_000_000_000u64,
                "aud": ["account", "gateway"],
                "realm_access": {"roles": ["user"]},
                "groups": ["/engineering"],
                "department": "platform",
                "clearance": 3,
            })),
            TokenKind::CookieSession,
        )
        .unwrap()
    }

    fn apply(config: &Config, req: TestRequest) -> ServiceRequest {
        let mut req = req.to_srv_request();
        let user = identity();
        for setter in identity_header_setters(config) {
            setter(&mut req, &user);
        }
        req
    }

    #[test]
    fn test_to_header_case() {
        assert_eq!(to_header_case("groups"), "Groups");
        assert_eq!(to_header_case("favorite_colour"), "Favorite-Colour");
        assert_eq!(to_header_case("x-tenant-id"), "X-Tenant-Id");
    }

    #[test]
    fn test_claim_headers_are_injected() {
        let config = Config::default();
        let req = apply(&config, TestRequest::default());
        let headers = req.headers();
        assert_eq!(headers.get("X-Auth-Subject").unwrap(), "subject-1");
        assert_eq!(headers.get("X-Auth-Username").unwrap(), "jdoe");
        assert_eq!(headers.get("X-Auth-Email").unwrap(), "jdoe@example.com");
        assert_eq!(headers.get("X-Auth-Audience").unwrap(), "account,gateway");
        assert_eq!(headers.get("X-Auth-Roles").unwrap(), "user");
        assert_eq!(headers.get("X-Auth-Groups").unwrap(), "/engineering");
        assert!(headers.get("X-Auth-Token").is_some());
        let authorization = headers.get(AUTHORIZATION).unwrap().to_str().unwrap();
        assert!(authorization.starts_with("Bearer "));
    }

    #[test]
    fn test_toggles_disable_setters() {
        let config = Config {
            enable_claims_headers: false,
            enable_token_header: false,
            enable_authorization_header: false,
            enable_authorization_cookies: true,
            ..Config::default()
        };
        let req = apply(&config, TestRequest::default());
        assert!(req.headers().get("X-Auth-Subject").is_none());
        assert!(req.headers().get("X-Auth-Token").is_none());
        assert!(req.headers().get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_session_cookies_redacted_from_upstream() {
        let config = Config::default();
        let req = apply(
            &config,
            TestRequest::default()
                .cookie(Cookie::new("proxy-access", "secret"))
                .cookie(Cookie::new("proxy-access-1", "secret"))
                .cookie(Cookie::new("session_id", "keep")),
        );
        let cookie_header = req.headers().get(COOKIE).unwrap().to_str().unwrap();
        assert_eq!(cookie_header, "session_id=keep");
    }

    #[test]
    fn test_cookie_header_removed_when_only_session_cookies() {
        let config = Config::default();
        let req = apply(
            &config,
            TestRequest::default().cookie(Cookie::new("proxy-access", "secret")),
        );
        assert!(req.headers().get(COOKIE).is_none());
    }

    #[test]
    fn test_custom_claim_headers() {
        let config = Config {
            custom_claims_headers: vec!["department".to_string(), "clearance".to_string()],
            ..Config::default()
        };
        let req = apply(&config, TestRequest::default());
        assert_eq!(req.headers().get("X-Auth-Department").unwrap(), "platform");
        assert_eq!(req.headers().get("X-Auth-Clearance").unwrap(), "3");
    }
}
