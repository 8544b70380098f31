use crate::config::Config;
use actix_web::http::header::{HeaderName, HeaderValue};

const STS_MAX_AGE_SECONDS: u64 = 31_536_000;

/// Normalize a request path for routing and policy matching: dot segments
/// and duplicate slashes are removed and a leading slash enforced.
///
/// Normalization gates the request only; the upstream forward carries the
/// path exactly as the client sent it.
pub(crate) fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    let mut normalized = String::with_capacity(path.len());
    normalized.push('/');
    normalized.push_str(&segments.join("/"));
    if path.ends_with('/') && normalized.len() > 1 {
        normalized.push('/');
    }
    normalized
}

/// Host allow-list check against the `Host` header, port excluded. An
/// empty list permits every host.
pub(crate) fn host_allowed(hostnames: &[String], host: &str) -> bool {
    if hostnames.is_empty() {
        return true;
    }
    let host = host.split(':').next().unwrap_or_default();
    hostnames.iter().any(|allowed| allowed == host)
}

/// Response headers the security stage stamps on every response, built
/// once from configuration.
pub(crate) fn security_response_headers(config: &Config) -> Vec<(HeaderName, HeaderValue)> {
    let mut headers = Vec::new();
    let mut push = |name: &str, value: &str| {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name),
            HeaderValue::from_str(value),
        ) {
            headers.push((name, value));
        } else {
            log::warn!("dropping invalid response header {name}");
        }
    };

    if config.enable_sts || config.enable_sts_preload {
        let mut sts = format!("max-age={STS_MAX_AGE_SECONDS}; includeSubDomains");
        if config.enable_sts_preload {
            sts.push_str("; preload");
        }
        push("Strict-Transport-Security", &sts);
    }
    if config.enable_frame_deny {
        push("X-Frame-Options", "DENY");
    }
    if config.enable_content_no_sniff {
        push("X-Content-Type-Options", "nosniff");
    }
    if config.enable_browser_xss_filter {
        push("X-XSS-Protection", "1; mode=block");
    }
    if !config.content_security_policy.is_empty() {
        push("Content-Security-Policy", &config.content_security_policy);
    }
    for (name, value) in &config.response_headers {
        push(name, value);
    }
    headers
}
