//! SSRF classification for outbound URLs used by runtime adapters.
//!
//! Two layers, both pure predicates given their inputs:
//! - [`classify_structural`] parses the URL and rejects private/loopback/
//!   link-local/CGNAT/IPv4-mapped literals without touching the network.
//! - [`classify_resolved`] additionally resolves hostnames and rejects any
//!   resolved address that the structural predicate would reject, defeating
//!   DNS rebinding.
//!
//! Callers are expected to run `classify_resolved` both at adapter
//! construction and again before each outbound request, through
//! [`ResolvedClassifier`]'s TTL cache.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use url::Url;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("url failed to parse: {0}")]
    InvalidUrl(String),
    #[error("scheme {0:?} is not http or https")]
    UnsupportedScheme(String),
    #[error("host {0:?} is disallowed")]
    UnsafeHost(String),
    #[error("url has no host")]
    MissingHost,
    #[error("dns resolution for {0:?} returned no addresses")]
    NoAddresses(String),
    #[error("dns resolution for {0:?} failed: {1}")]
    ResolutionFailed(String, String),
}

pub type ClassifyResult = Result<(), ClassifyError>;

/// Per-call options. An `allowlist` entry bypasses all host classification
/// (structural and resolved) for an exact hostname match, but the URL still
/// must parse and use http/https.
#[derive(Debug, Clone, Default)]
pub struct ClassifyOptions {
    pub allowlist: HashSet<String>,
    pub resolve_dns: bool,
}

impl ClassifyOptions {
    pub fn new() -> Self {
        Self {
            allowlist: HashSet::new(),
            resolve_dns: true,
        }
    }

    pub fn with_allowlist(mut self, hosts: impl IntoIterator<Item = String>) -> Self {
        self.allowlist.extend(hosts);
        self
    }

    pub fn without_dns_resolution(mut self) -> Self {
        self.resolve_dns = false;
        self
    }
}

/// Structural-only check: parse the URL, validate scheme, and reject literal
/// private/loopback/link-local/CGNAT/IPv4-mapped hosts. Never touches the
/// network.
pub fn classify_structural(url: &str, options: &ClassifyOptions) -> ClassifyResult {
    let parsed = Url::parse(url).map_err(|e| ClassifyError::InvalidUrl(e.to_string()))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(ClassifyError::UnsupportedScheme(other.to_string())),
    }

    let host = parsed.host_str().ok_or(ClassifyError::MissingHost)?;

    if options.allowlist.contains(host) {
        return Ok(());
    }

    if host.eq_ignore_ascii_case("localhost") {
        return Err(ClassifyError::UnsafeHost(host.to_string()));
    }

    if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        if !is_safe_ip(ip) {
            return Err(ClassifyError::UnsafeHost(host.to_string()));
        }
    }

    Ok(())
}

/// Structural check plus, for bare hostnames (not literal IPs and not
/// allowlisted), DNS resolution of every A/AAAA record. Denies if any
/// resolved address is private, or if resolution yields no addresses.
pub async fn classify_resolved(url: &str, options: &ClassifyOptions) -> ClassifyResult {
    classify_structural(url, options)?;

    let parsed = Url::parse(url).map_err(|e| ClassifyError::InvalidUrl(e.to_string()))?;
    let host = parsed.host_str().ok_or(ClassifyError::MissingHost)?;

    if options.allowlist.contains(host) || !options.resolve_dns {
        return Ok(());
    }

    if host.parse::<IpAddr>().is_ok() {
        // Already covered by the structural literal check.
        return Ok(());
    }

    let port = parsed.port_or_known_default().unwrap_or(80);
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ClassifyError::ResolutionFailed(host.to_string(), e.to_string()))?;

    let mut saw_any = false;
    for addr in addrs {
        saw_any = true;
        if !is_safe_ip(addr.ip()) {
            return Err(ClassifyError::UnsafeHost(format!(
                "{host} resolved to {}",
                addr.ip()
            )));
        }
    }

    if !saw_any {
        return Err(ClassifyError::NoAddresses(host.to_string()));
    }

    Ok(())
}

/// Private/loopback/link-local/CGNAT/IPv4-mapped predicate shared by both
/// classification layers.
fn is_safe_ip(ip: IpAddr) -> bool {
    let unmapped = match ip {
        IpAddr::V6(v6) => unmap_ipv6(v6),
        v4 @ IpAddr::V4(_) => v4,
    };

    match unmapped {
        IpAddr::V4(v4) => is_safe_ipv4(v4),
        IpAddr::V6(v6) => is_safe_ipv6(v6),
    }
}

/// Recognizes both the canonical `::ffff:a.b.c.d` form and the expanded hex
/// form `::ffff:HHHH:HHHH`, since `to_ipv4_mapped` only handles the former.
fn unmap_ipv6(v6: Ipv6Addr) -> IpAddr {
    if let Some(v4) = v6.to_ipv4_mapped() {
        return IpAddr::V4(v4);
    }
    let segments = v6.segments();
    if segments[0..5] == [0, 0, 0, 0, 0] && segments[5] == 0xffff {
        let hi = segments[6];
        let lo = segments[7];
        let octets = [
            (hi >> 8) as u8,
            (hi & 0xff) as u8,
            (lo >> 8) as u8,
            (lo & 0xff) as u8,
        ];
        return IpAddr::V4(Ipv4Addr::from(octets));
    }
    IpAddr::V6(v6)
}

fn is_safe_ipv4(ip: Ipv4Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return false;
    }
    let o = ip.octets();
    let is_private = o[0] == 10
        || (o[0] == 172 && (16..=31).contains(&o[1]))
        || (o[0] == 192 && o[1] == 168)
        || (o[0] == 169 && o[1] == 254) // link-local
        || (o[0] == 100 && (64..=127).contains(&o[1])) // CGNAT, 100.64/10
        || o[0] == 127; // loopback range beyond 127.0.0.1
    !is_private
}

fn is_safe_ipv6(ip: Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return false;
    }
    let seg0 = ip.segments()[0];
    let is_ula = (seg0 & 0xfe00) == 0xfc00; // fc00::/7
    let is_link_local = (seg0 & 0xffc0) == 0xfe80; // fe80::/10
    !(is_ula || is_link_local)
}

/// TTL-cached wrapper around [`classify_resolved`], keyed by the URL string,
/// for the expected caller protocol: classify at construction, and again
/// before each outbound request, without re-resolving on every call.
pub struct ResolvedClassifier {
    ttl: Duration,
    cache: Mutex<std::collections::HashMap<String, (Instant, bool)>>,
}

impl ResolvedClassifier {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn with_default_ttl() -> Self {
        Self::new(Duration::from_secs(300))
    }

    pub async fn check(&self, url: &str, options: &ClassifyOptions) -> ClassifyResult {
        if let Some(cached) = self.cached_verdict(url) {
            return if cached {
                Ok(())
            } else {
                Err(ClassifyError::UnsafeHost(url.to_string()))
            };
        }

        let verdict = classify_resolved(url, options).await;
        let mut cache = self.cache.lock().expect("ssrf cache mutex poisoned");
        cache.insert(url.to_string(), (Instant::now(), verdict.is_ok()));
        verdict
    }

    fn cached_verdict(&self, url: &str) -> Option<bool> {
        let cache = self.cache.lock().expect("ssrf cache mutex poisoned");
        let (at, allowed) = cache.get(url)?;
        if at.elapsed() > self.ttl {
            return None;
        }
        Some(*allowed)
    }

    pub fn invalidate(&self, url: &str) {
        self.cache
            .lock()
            .expect("ssrf cache mutex poisoned")
            .remove(url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> ClassifyOptions {
        ClassifyOptions::new()
    }

    #[test]
    fn rejects_non_http_scheme() {
        let err = classify_structural("ftp://example.com/file", &opts()).unwrap_err();
        assert!(matches!(err, ClassifyError::UnsupportedScheme(_)));
    }

    #[test]
    fn rejects_unparseable_url() {
        assert!(matches!(
            classify_structural("not a url", &opts()),
            Err(ClassifyError::InvalidUrl(_))
        ));
    }

    #[test]
    fn rejects_localhost() {
        assert!(classify_structural("http://localhost:8080/", &opts()).is_err());
        assert!(classify_structural("http://LOCALHOST/", &opts()).is_err());
    }

    #[test]
    fn rejects_private_ipv4_ranges() {
        for host in [
            "10.0.0.1",
            "10.255.255.255",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.0.1",
            "127.0.0.1",
            "0.0.0.0",
            "169.254.169.254",
            "100.64.0.1",
            "100.127.255.255",
        ] {
            let url = format!("http://{host}/");
            assert!(
                classify_structural(&url, &opts()).is_err(),
                "expected {host} to be rejected"
            );
        }
    }

    #[test]
    fn allows_public_ipv4() {
        for host in ["8.8.8.8", "1.1.1.1", "93.184.216.34"] {
            let url = format!("http://{host}/");
            assert!(classify_structural(&url, &opts()).is_ok(), "{host}");
        }
    }

    #[test]
    fn rejects_ipv6_ula_link_local_and_loopback() {
        for host in ["[fc00::1]", "[fd12:3456::1]", "[fe80::1]", "[::1]"] {
            let url = format!("http://{host}/");
            assert!(classify_structural(&url, &opts()).is_err(), "{host}");
        }
    }

    #[test]
    fn rejects_ipv4_mapped_ipv6_private() {
        for host in ["[::ffff:127.0.0.1]", "[::ffff:10.0.0.1]", "[::ffff:169.254.169.254]"] {
            let url = format!("http://{host}/");
            assert!(classify_structural(&url, &opts()).is_err(), "{host}");
        }
    }

    #[test]
    fn rejects_ipv4_mapped_ipv6_expanded_hex_form() {
        // ::ffff:7f00:1 == ::ffff:127.0.0.1 spelled as two hex groups.
        let url = "http://[::ffff:7f00:1]/";
        assert!(classify_structural(url, &opts()).is_err());
    }

    #[test]
    fn allowlist_bypasses_host_classification() {
        let options = opts().with_allowlist(["10.0.0.1".to_string()]);
        assert!(classify_structural("http://10.0.0.1/", &options).is_ok());
    }

    #[test]
    fn allowlist_still_requires_http_scheme() {
        let options = opts().with_allowlist(["10.0.0.1".to_string()]);
        assert!(matches!(
            classify_structural("ftp://10.0.0.1/", &options),
            Err(ClassifyError::UnsupportedScheme(_))
        ));
    }

    #[tokio::test]
    async fn classify_resolved_allows_public_literal_without_dns() {
        assert!(classify_resolved("http://1.1.1.1/", &opts()).await.is_ok());
    }

    #[tokio::test]
    async fn classify_resolved_skips_dns_when_disabled() {
        let options = opts().without_dns_resolution();
        // A name that would fail to resolve in a sandboxed test environment
        // must still pass once DNS resolution is turned off structurally.
        assert!(classify_resolved("http://definitely-not-a-real-host.invalid/", &options)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn cache_avoids_resecond_resolution_within_ttl() {
        let classifier = ResolvedClassifier::new(Duration::from_secs(60));
        let options = opts().without_dns_resolution();
        assert!(classifier.check("http://1.1.1.1/", &options).await.is_ok());
        assert!(classifier.check("http://1.1.1.1/", &options).await.is_ok());
    }
}
