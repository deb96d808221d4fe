//! Server-side request forgery protection for scrape targets and webhooks.

use std::net::IpAddr;

use trawl_core::error::AppError;
use url::Url;

/// Decides which URLs a browser or HTTP client may be pointed at.
///
/// Enabled by default: only `http`/`https`, and no host that is or resolves
/// to a private, loopback, link-local or otherwise reserved address.
#[derive(Debug, Clone, Copy)]
pub struct UrlGuard {
    enabled: bool,
}

impl Default for UrlGuard {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl UrlGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow private addresses. For local CLI use where the user owns the machine.
    pub fn allow_private_urls() -> Self {
        Self { enabled: false }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn check(&self, url: &str) -> Result<(), AppError> {
        if !self.enabled {
            return Ok(());
        }
        validate_url(url).await
    }
}

async fn validate_url(url: &str) -> Result<(), AppError> {
    let parsed = Url::parse(url).map_err(|e| AppError::HttpError(format!("Invalid URL: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::HttpError(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::HttpError("URL has no host".to_string()))?;
    let bare_host = host.trim_start_matches('[').trim_end_matches(']');

    if let Ok(ip) = bare_host.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(AppError::HttpError(format!(
                "SSRF blocked: {host} is a private/reserved address"
            )));
        }
        return Ok(());
    }

    let port = parsed.port_or_known_default().unwrap_or(80);
    let addrs: Vec<_> = tokio::net::lookup_host((bare_host, port))
        .await
        .map_err(|e| AppError::NetworkError(format!("DNS resolution failed for {host}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(AppError::NetworkError(format!(
            "DNS resolution returned no addresses for {host}"
        )));
    }

    if let Some(blocked) = addrs.iter().find(|a| is_private_ip(a.ip())) {
        return Err(AppError::HttpError(format!(
            "SSRF blocked: {host} resolves to private/reserved IP {}",
            blocked.ip()
        )));
    }

    Ok(())
}

/// Check if an IP address is in a private/reserved/link-local range.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local() // 169.254/16, cloud metadata
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || (a == 100 && (b & 0xC0) == 64) // 100.64/10 carrier-grade NAT
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xFFC0) == 0xFE80 // fe80::/10
                || (first & 0xFE00) == 0xFC00 // fc00::/7
                || v6
                    .to_ipv4_mapped()
                    .is_some_and(|v4| is_private_ip(IpAddr::V4(v4)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_ipv4() {
        for ip in ["127.0.0.1", "10.1.2.3", "172.16.0.1", "192.168.0.10", "169.254.169.254", "0.0.0.0", "100.64.0.1"] {
            assert!(is_private_ip(ip.parse().unwrap()), "{ip}");
        }
    }

    #[test]
    fn test_public_addresses() {
        assert!(!is_private_ip("8.8.8.8".parse().unwrap()));
        assert!(!is_private_ip("93.184.216.34".parse().unwrap()));
        assert!(!is_private_ip("2001:4860:4860::8888".parse().unwrap()));
    }

    #[test]
    fn test_private_ipv6() {
        assert!(is_private_ip("::1".parse().unwrap()));
        assert!(is_private_ip("fe80::1".parse().unwrap()));
        assert!(is_private_ip("fd12::1".parse().unwrap()));
        assert!(is_private_ip("::ffff:10.0.0.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_guard_blocks_private_literals() {
        let guard = UrlGuard::new();
        let err = guard.check("http://169.254.169.254/latest/").await.unwrap_err();
        assert!(err.to_string().contains("SSRF blocked"));

        let err = guard.check("http://[::1]:8080/").await.unwrap_err();
        assert!(err.to_string().contains("SSRF blocked"));
    }

    #[tokio::test]
    async fn test_guard_rejects_non_http_schemes() {
        let err = UrlGuard::new().check("file:///etc/passwd").await.unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[tokio::test]
    async fn test_disabled_guard_allows_everything() {
        let guard = UrlGuard::allow_private_urls();
        assert!(!guard.is_enabled());
        assert!(guard.check("http://127.0.0.1:3000/").await.is_ok());
    }
}
