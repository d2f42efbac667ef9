// File: request.rs
// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2023-2025
// - Volker Schwaberow <volker@schwaberow.de>

use crate::error::RaceError;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::Method;
use url::Url;

#[derive(Debug, Clone)]
pub struct RaceRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub cookies: Vec<(String, String)>,
}

impl RaceRequest {
    pub fn new(method: Method, url: &str) -> Result<Self, RaceError> {
        let url = Url::parse(url)
            .map_err(|e| RaceError::configuration(format!("invalid URL {}: {}", url, e)))?;

        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(RaceError::configuration(format!(
                    "unsupported scheme: {}",
                    other
                )))
            }
        }

        if url.host_str().is_none() {
            return Err(RaceError::configuration("URL has no host"));
        }

        Ok(Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Vec::new(),
            cookies: Vec::new(),
        })
    }

    pub fn get(url: &str) -> Result<Self, RaceError> {
        Self::new(Method::GET, url)
    }

    pub fn post(url: &str, body: impl Into<Vec<u8>>) -> Result<Self, RaceError> {
        let mut req = Self::new(Method::POST, url)?;
        req.body = body.into();
        Ok(req)
    }

    pub fn header(mut self, name: &str, value: &str) -> Result<Self, RaceError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| RaceError::configuration(format!("invalid header name: {}", e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| RaceError::configuration(format!("invalid header value: {}", e)))?;
        self.headers.append(name, value);
        Ok(self)
    }

    pub fn cookie(mut self, name: &str, value: &str) -> Self {
        self.cookies.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.url
            .port_or_known_default()
            .unwrap_or(if self.is_tls() { 443 } else { 80 })
    }

    pub fn is_tls(&self) -> bool {
        self.url.scheme() == "https"
    }

    fn host_header_value(&self) -> String {
        let host = self.host();
        match (self.url.port(), self.is_tls()) {
            (Some(443), true) | (Some(80), false) | (None, _) => host.to_string(),
            (Some(port), _) => format!("{}:{}", host, port),
        }
    }

    fn request_target(&self, absolute_form: bool) -> String {
        if absolute_form {
            return self.url.to_string();
        }
        match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        }
    }

    pub fn cookie_pairs_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    // Serializes the full HTTP/1.1 frame. The output is the single-shot wire
    // image; the withholding split is applied afterwards by the connection.
    pub fn serialize(&self, absolute_form: bool) -> Result<Vec<u8>, RaceError> {
        if self.headers.contains_key(http::header::TRANSFER_ENCODING) {
            return Err(RaceError::configuration(
                "chunked request bodies are not supported, use Content-Length",
            ));
        }

        if self.headers.contains_key(http::header::EXPECT) {
            return Err(RaceError::configuration(
                "Expect request headers are not supported",
            ));
        }

        let mut out = Vec::with_capacity(256 + self.body.len());
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.request_target(absolute_form).as_bytes());
        out.extend_from_slice(b" HTTP/1.1\r\n");

        if !self.headers.contains_key(http::header::HOST) {
            out.extend_from_slice(b"Host: ");
            out.extend_from_slice(self.host_header_value().as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        for (name, value) in self.headers.iter() {
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        if !self.headers.contains_key(http::header::COOKIE) {
            if let Some(pairs) = self.cookie_pairs_header() {
                out.extend_from_slice(b"Cookie: ");
                out.extend_from_slice(pairs.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
        }

        if !self.body.is_empty() && !self.headers.contains_key(http::header::CONTENT_LENGTH) {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }

        if !self.headers.contains_key(http::header::CONNECTION) {
            out.extend_from_slice(b"Connection: close\r\n");
        }

        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);

        Ok(out)
    }
}

// Where the pre-send stops. The withheld tail comes out of the body when the
// body is long enough, otherwise out of the final CRLFCRLF so the server
// never sees a complete header block before release.
pub fn split_point(total_len: usize, body_len: usize, tail_bytes: usize) -> usize {
    let tail = tail_bytes.max(1).min(body_len + 4);
    total_len - tail
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_get() {
        let req = RaceRequest::get("http://example.test/path?a=1").unwrap();
        let bytes = req.serialize(false).unwrap();
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.starts_with("GET /path?a=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.test\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_serialize_post_content_length() {
        let req = RaceRequest::post("http://example.test/submit", "a=1&b=2").unwrap();
        let bytes = req.serialize(false).unwrap();
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.starts_with("POST /submit HTTP/1.1\r\n"));
        assert!(text.contains("Content-Length: 7\r\n"));
        assert!(text.ends_with("\r\n\r\na=1&b=2"));
    }

    #[test]
    fn test_serialize_nondefault_port_in_host() {
        let req = RaceRequest::get("http://example.test:8080/").unwrap();
        let text = String::from_utf8(req.serialize(false).unwrap()).unwrap();
        assert!(text.contains("Host: example.test:8080\r\n"));
    }

    #[test]
    fn test_serialize_absolute_form() {
        let req = RaceRequest::get("http://example.test/x").unwrap();
        let text = String::from_utf8(req.serialize(true).unwrap()).unwrap();
        assert!(text.starts_with("GET http://example.test/x HTTP/1.1\r\n"));
    }

    #[test]
    fn test_explicit_cookie_header_wins() {
        let req = RaceRequest::get("http://example.test/")
            .unwrap()
            .header("Cookie", "session=abc")
            .unwrap()
            .cookie("other", "1");
        let text = String::from_utf8(req.serialize(false).unwrap()).unwrap();
        assert!(text.contains("Cookie: session=abc\r\n"));
        assert!(!text.contains("other=1"));
    }

    #[test]
    fn test_cookie_pairs_serialized() {
        let req = RaceRequest::get("http://example.test/")
            .unwrap()
            .cookie("a", "1")
            .cookie("b", "2");
        let text = String::from_utf8(req.serialize(false).unwrap()).unwrap();
        assert!(text.contains("Cookie: a=1; b=2\r\n"));
    }

    #[test]
    fn test_rejects_chunked_and_expect() {
        let req = RaceRequest::get("http://example.test/")
            .unwrap()
            .header("Transfer-Encoding", "chunked")
            .unwrap();
        assert!(req.serialize(false).is_err());

        let req = RaceRequest::get("http://example.test/")
            .unwrap()
            .header("Expect", "100-continue")
            .unwrap();
        assert!(req.serialize(false).is_err());
    }

    #[test]
    fn test_rejects_bad_scheme() {
        assert!(RaceRequest::get("ftp://example.test/").is_err());
        assert!(RaceRequest::get("not a url").is_err());
    }

    #[test]
    fn test_split_point_body_tail() {
        // Body longer than the tail: the withheld bytes are body bytes.
        let req = RaceRequest::post("http://example.test/", "abcdef").unwrap();
        let bytes = req.serialize(false).unwrap();
        let split = split_point(bytes.len(), 6, 2);
        assert_eq!(&bytes[split..], b"ef");
    }

    #[test]
    fn test_split_point_bodyless_single_byte() {
        // No body: the tail comes out of the header terminator.
        let req = RaceRequest::get("http://example.test/").unwrap();
        let bytes = req.serialize(false).unwrap();

        let split = split_point(bytes.len(), 0, 1);
        assert_eq!(&bytes[split..], b"\n");
        assert!(bytes[..split].ends_with(b"\r\n\r"));

        let split = split_point(bytes.len(), 0, 2);
        assert_eq!(&bytes[split..], b"\r\n");
    }

    #[test]
    fn test_split_point_tail_clamped_to_terminator() {
        // Tail larger than body + terminator is clamped so the request line
        // and header lines are always sent up front.
        let req = RaceRequest::post("http://example.test/", "a").unwrap();
        let bytes = req.serialize(false).unwrap();
        let split = split_point(bytes.len(), 1, 32);
        assert_eq!(&bytes[split..], b"\r\n\r\na");
    }

    #[test]
    fn test_pre_and_post_concatenation_is_identity() {
        let req = RaceRequest::post("http://example.test/", "payload").unwrap();
        let bytes = req.serialize(false).unwrap();
        let split = split_point(bytes.len(), 7, 3);
        let mut joined = bytes[..split].to_vec();
        joined.extend_from_slice(&bytes[split..]);
        assert_eq!(joined, bytes);
    }
}
