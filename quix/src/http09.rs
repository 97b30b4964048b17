//! HTTP/0.9-style demo mapping: `GET <resource>\r\n` on a fresh
//! bidirectional stream, the response is the stream payload until FIN.

use bytes::Bytes;

/// Request line for `resource`.
pub fn format_request(resource: &str) -> Bytes {
    Bytes::from(format!("GET {resource}\r\n"))
}

/// Extract the resource from a request line, if well-formed.
pub fn parse_request(data: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(data).ok()?;
    let line = text.lines().next()?;
    let resource = line.strip_prefix("GET ")?.trim();
    if resource.is_empty() {
        return None;
    }
    Some(resource.to_string())
}

/// Canned response body for the demo server.
pub fn demo_response(resource: &str) -> Bytes {
    Bytes::from(format!(
        "<html><head><title>quix</title></head><body>served {resource}</body></html>\n"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let request = format_request("/index.html");
        assert_eq!(parse_request(&request).as_deref(), Some("/index.html"));
    }

    #[test]
    fn test_malformed_requests_rejected() {
        assert!(parse_request(b"POST /x\r\n").is_none());
        assert!(parse_request(b"GET \r\n").is_none());
        assert!(parse_request(&[0xFF, 0xFE]).is_none());
    }
}
