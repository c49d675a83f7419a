use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Errors that can occur while validating a WebSub callback URL.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CallbackError {
    /// The URL string could not be parsed.
    #[error("invalid callback URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("unsupported callback scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL has no host component.
    #[error("callback URL has no host")]
    MissingHost,
    /// The URL points back at this service.
    #[error("callback may not point at this service")]
    SelfReference,
    /// The URL points to localhost.
    #[error("callback may not point at localhost")]
    Localhost,
}

/// Validates a subscriber-supplied callback URL.
///
/// Rejects:
/// - Non-HTTP(S) schemes (e.g., `file://`, `ftp://`)
/// - The service's own `hostname`, compared case-insensitively
/// - Localhost addresses (`localhost`, `127.0.0.1`, `::1`, `0.0.0.0`)
///
/// Private network ranges are accepted.
///
/// # Examples
///
/// ```
/// use letterbox::util::validate_callback;
///
/// let url = validate_callback("https://reader.example.org/push", "mail.example.com").unwrap();
/// assert_eq!(url.host_str(), Some("reader.example.org"));
///
/// assert!(validate_callback("http://localhost/push", "mail.example.com").is_err());
/// assert!(validate_callback("https://mail.example.com/x", "mail.example.com").is_err());
/// ```
pub fn validate_callback(url_str: &str, hostname: &str) -> Result<Url, CallbackError> {
    let url = Url::parse(url_str)?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(CallbackError::UnsupportedScheme(scheme.to_owned())),
    }

    let host = url.host_str().ok_or(CallbackError::MissingHost)?;

    if host.eq_ignore_ascii_case(hostname) {
        return Err(CallbackError::SelfReference);
    }
    if host.eq_ignore_ascii_case("localhost") {
        return Err(CallbackError::Localhost);
    }

    // Strip brackets from IPv6 addresses for parsing
    let host_for_parse = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    if let Ok(ip) = host_for_parse.parse::<IpAddr>() {
        if ip.is_loopback() || ip.is_unspecified() {
            return Err(CallbackError::Localhost);
        }
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "mail.example.com";

    #[test]
    fn test_valid_callbacks() {
        assert!(validate_callback("https://reader.example.org/websub", HOST).is_ok());
        assert!(validate_callback("http://reader.example.org:8080/cb?id=3", HOST).is_ok());
    }

    #[test]
    fn test_invalid_schemes() {
        assert_eq!(
            validate_callback("ftp://reader.example.org/", HOST),
            Err(CallbackError::UnsupportedScheme("ftp".to_string()))
        );
        assert!(validate_callback("file:///etc/passwd", HOST).is_err());
    }

    #[test]
    fn test_relative_url_rejected() {
        assert!(matches!(
            validate_callback("/websub", HOST),
            Err(CallbackError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_own_hostname_rejected() {
        assert_eq!(
            validate_callback("https://mail.example.com/feeds/x", HOST),
            Err(CallbackError::SelfReference)
        );
        assert_eq!(
            validate_callback("https://MAIL.Example.com/feeds/x", HOST),
            Err(CallbackError::SelfReference)
        );
    }

    #[test]
    fn test_localhost_rejected() {
        assert_eq!(
            validate_callback("http://localhost/cb", HOST),
            Err(CallbackError::Localhost)
        );
        assert_eq!(
            validate_callback("http://127.0.0.1:9000/cb", HOST),
            Err(CallbackError::Localhost)
        );
        assert_eq!(
            validate_callback("http://[::1]/cb", HOST),
            Err(CallbackError::Localhost)
        );
        assert_eq!(
            validate_callback("http://0.0.0.0/cb", HOST),
            Err(CallbackError::Localhost)
        );
    }

    #[test]
    fn test_private_network_accepted() {
        assert!(validate_callback("http://192.168.1.20/cb", HOST).is_ok());
    }
}
