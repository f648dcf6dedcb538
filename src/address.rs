use std::ops::Range;

use url::Url;

/// Error type for target address parsing
#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("target cannot be empty")]
    Empty,

    #[error("invalid target format: {0}")]
    Invalid(#[from] url::ParseError),
}

/// Normalize a user supplied target into `host:port`
///
/// Accepted forms:
/// - `8080` - bare port, resolved against `localhost`
/// - `:8080` - leading colon, resolved against `localhost`
/// - `example.com`, `example.com:8080` - host with optional port
/// - `http://example.com`, `https://example.com/path` - full URL
///
/// Missing ports default to `443` for `https` and `80` for everything else.
/// An empty host, as in `http://:8080`, resolves to `localhost`.
pub fn parse_target_address(input: &str) -> Result<String, AddressError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(AddressError::Empty);
    }

    if input.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(format!("localhost:{}", input));
    }

    if input.starts_with(':') {
        return Ok(format!("localhost{}", input));
    }

    let mut raw = if input.contains("://") {
        input.to_string()
    } else {
        format!("http://{}", input)
    };

    let authority = authority_range(&raw);
    let host_start = raw[authority.clone()]
        .rfind('@')
        .map_or(authority.start, |i| authority.start + i + 1);
    let host_port = &raw[host_start..authority.end];
    let explicit_port = has_explicit_port(host_port);

    // Special schemes reject an empty host, so fill it in before parsing
    if host_port.is_empty() || host_port.starts_with(':') {
        raw.insert_str(host_start, "localhost");
    }

    let url = Url::parse(&raw)?;

    let host = match url.host_str() {
        Some(h) if !h.is_empty() => h.to_string(),
        _ => "localhost".to_string(),
    };

    // Url strips a typed port equal to the scheme default; restore it
    let port = match url.port() {
        Some(p) => p,
        None if explicit_port => url.port_or_known_default().unwrap_or(80),
        None if url.scheme() == "https" || input.starts_with("https://") => 443,
        None => 80,
    };

    Ok(format!("{}:{}", host, port))
}

/// Byte range of the authority in `raw`, which always contains `://`
fn authority_range(raw: &str) -> Range<usize> {
    let start = raw.find("://").map_or(0, |i| i + 3);
    let end = raw[start..]
        .find(|c: char| matches!(c, '/' | '?' | '#'))
        .map_or(raw.len(), |i| start + i);
    start..end
}

/// Whether `host:port` carries a non-empty port, IPv6 brackets included
fn has_explicit_port(host_port: &str) -> bool {
    let after_host = match host_port.rfind(']') {
        Some(i) => &host_port[i + 1..],
        None => host_port,
    };
    after_host
        .split_once(':')
        .is_some_and(|(_, port)| !port.is_empty())
}
