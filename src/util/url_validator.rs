use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use url::{Host, Url};

/// Why a feed URL or item link was refused.
#[derive(Error, Debug)]
pub enum UrlValidationError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    #[error("URL has no host")]
    MissingHost,
    /// Relays would forward `user:pass@` to a third party.
    #[error("Credentials in feed URLs are not allowed")]
    EmbeddedCredentials,
    #[error("Private IP address not allowed: {0}")]
    PrivateIp(String),
    #[error("Localhost not allowed")]
    Localhost,
}

/// Validates a feed source URL before it is stored or handed to a relay.
///
/// Public relays will proxy any address they are given, and the direct
/// strategy fetches from this machine, so feed sources must be public
/// HTTP(S) hosts:
/// - `file://`, `ftp://`, `javascript:` and other schemes are rejected
/// - `localhost`, `*.localhost` and loopback addresses are rejected
/// - private, link-local, unspecified and IPv4-mapped private addresses
///   are rejected
/// - URLs carrying a username or password are rejected
///
/// # Examples
///
/// ```
/// use relayfeed::util::validate_url;
///
/// assert!(validate_url("https://example.com/feed.xml").is_ok());
/// assert!(validate_url("http://localhost/feed").is_err());
/// assert!(validate_url("http://192.168.1.1/feed").is_err());
/// assert!(validate_url("file:///etc/passwd").is_err());
/// ```
pub fn validate_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = parse_http(url_str)?;

    if !url.username().is_empty() || url.password().is_some() {
        return Err(UrlValidationError::EmbeddedCredentials);
    }

    match url.host() {
        None => return Err(UrlValidationError::MissingHost),
        Some(Host::Domain(domain)) => check_domain(domain)?,
        Some(Host::Ipv4(v4)) => check_v4(v4)?,
        Some(Host::Ipv6(v6)) => match v6.to_ipv4_mapped() {
            Some(v4) => check_v4(v4)?,
            None => check_v6(v6)?,
        },
    }

    Ok(url)
}

/// Validates an item link before it is opened in the system browser.
///
/// Links come from untrusted feed content, so only the scheme is checked:
/// a `javascript:` or `file:` link must never reach the browser.
pub fn validate_link(url_str: &str) -> Result<Url, UrlValidationError> {
    parse_http(url_str)
}

fn parse_http(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }
}

fn check_domain(domain: &str) -> Result<(), UrlValidationError> {
    // `url` lowercases domains; a trailing root dot still resolves the same
    let domain = domain.trim_end_matches('.');
    if domain == "localhost" || domain.ends_with(".localhost") {
        return Err(UrlValidationError::Localhost);
    }
    Ok(())
}

fn check_v4(ip: Ipv4Addr) -> Result<(), UrlValidationError> {
    if ip.is_loopback() {
        return Err(UrlValidationError::Localhost);
    }
    if ip.is_private() || ip.is_link_local() || ip.is_unspecified() {
        return Err(UrlValidationError::PrivateIp(ip.to_string()));
    }
    Ok(())
}

fn check_v6(ip: Ipv6Addr) -> Result<(), UrlValidationError> {
    if ip.is_loopback() {
        return Err(UrlValidationError::Localhost);
    }
    let first = ip.segments()[0];
    // fc00::/7 unique local, fe80::/10 link local
    if ip.is_unspecified() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80 {
        return Err(UrlValidationError::PrivateIp(ip.to_string()));
    }
    Ok(())
}
