use std::fmt::Display;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::error::ProxyError;
use crate::http1::url::Url;

pub const SP: &[u8] = b" ";
pub const CRLF: &[u8] = b"\r\n";
pub const CRLF_CRLF: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr, Default)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Method {
    Connect,
    Delete,
    #[default]
    Get,
    Head,
    Options,
    Patch,
    Post,
    Put,
    Trace,
}

impl Method {
    pub fn parse(raw: &str) -> Result<Method, ProxyError> {
        Method::from_str(raw).map_err(|_| ProxyError::InvalidMethod)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    Http1_0,
    #[default]
    Http1_1,
    Http2_0,
    Http3_0,
}

impl Version {
    pub fn parse(raw: &str) -> Result<Version, ProxyError> {
        match raw {
            "HTTP/1.0" => Ok(Version::Http1_0),
            "HTTP/1.1" => Ok(Version::Http1_1),
            "HTTP/2.0" | "HTTP/2" => Ok(Version::Http2_0),
            "HTTP/3.0" | "HTTP/3" => Ok(Version::Http3_0),
            _ => Err(ProxyError::InvalidVersion),
        }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Version::Http1_0 => "HTTP/1.0",
            Version::Http1_1 => "HTTP/1.1",
            Version::Http2_0 => "HTTP/2.0",
            Version::Http3_0 => "HTTP/3.0",
        };
        f.write_str(s)
    }
}

/// Numeric status; the reason phrase is regenerated on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status(pub u16);

impl Status {
    pub const CONTINUE: Status = Status(100);
    pub const SWITCHING_PROTOCOLS: Status = Status(101);
    pub const OK: Status = Status(200);
    pub const NO_CONTENT: Status = Status(204);
    pub const NOT_MODIFIED: Status = Status(304);
    pub const BAD_REQUEST: Status = Status(400);
    pub const REQUEST_TIMEOUT: Status = Status(408);
    pub const INTERNAL_SERVER_ERROR: Status = Status(500);
    pub const BAD_GATEWAY: Status = Status(502);
    pub const GATEWAY_TIMEOUT: Status = Status(504);

    pub fn parse(raw: &str) -> Result<Status, ProxyError> {
        if raw.len() != 3 {
            return Err(ProxyError::InvalidStatus);
        }
        raw.parse::<u16>()
            .map(Status)
            .map_err(|_| ProxyError::InvalidStatus)
    }

    pub fn is_1xx(&self) -> bool {
        (100..200).contains(&self.0)
    }

    pub fn is_2xx(&self) -> bool {
        (200..300).contains(&self.0)
    }

    pub fn is_3xx(&self) -> bool {
        (300..400).contains(&self.0)
    }

    pub fn reason(&self) -> &'static str {
        match self.0 {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            206 => "Partial Content",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            411 => "Length Required",
            413 => "Payload Too Large",
            418 => "I'm a teapot",
            426 => "Upgrade Required",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            505 => "HTTP Version Not Supported",
            _ => "Unknown",
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Header multimap preserving insertion order and repeated keys. Lookups
/// are case-insensitive; stored names keep the case they arrived with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

fn iequals(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace every entry for `name` with a single value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.add(name, value);
    }

    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !iequals(n, name));
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| iequals(n, name))
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| iequals(n, name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| iequals(n, name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// All values for `name` are non-empty (and at least one exists).
    pub fn is_nonempty(&self, name: &str) -> bool {
        let values = self.get_all(name);
        !values.is_empty() && values.iter().all(|v| !v.is_empty())
    }

    pub fn has_value(&self, name: &str, value: &str, case_insensitive: bool) -> bool {
        self.get_all(name).iter().any(|v| {
            if case_insensitive {
                iequals(v, value)
            } else {
                *v == value
            }
        })
    }

    /// Comma-separated token match, e.g. `Connection: keep-alive, Upgrade`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .iter()
            .any(|v| v.split(',').any(|t| iequals(t.trim(), token)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn write_headers_and_body(out: &mut BytesMut, headers: &Headers, body: &Bytes) {
    for (name, value) in headers.iter() {
        out.put_slice(name.as_bytes());
        out.put_slice(b": ");
        out.put_slice(value.as_bytes());
        out.put_slice(CRLF);
    }
    out.put_slice(CRLF);

    if headers.has_token("Transfer-Encoding", "chunked") {
        if !body.is_empty() {
            out.put_slice(format!("{:x}", body.len()).as_bytes());
            out.put_slice(CRLF);
            out.put_slice(body);
            out.put_slice(CRLF);
        }
        out.put_slice(b"0");
        out.put_slice(CRLF_CRLF);
    } else {
        out.put_slice(body);
    }
}

fn should_close_connection(headers: &Headers, version: Version) -> bool {
    if let Some(connection) = headers.get("Connection") {
        if iequals(connection, "keep-alive") {
            return false;
        }
        if iequals(connection, "close") {
            return true;
        }
    }
    version == Version::Http1_0
}

#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub version: Version,
    pub method: Method,
    pub url: Url,
    pub headers: Headers,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn should_close_connection(&self) -> bool {
        should_close_connection(&self.headers, self.version)
    }

    pub fn set_content_length(&mut self) {
        self.headers.set("Content-Length", self.body.len().to_string());
    }

    pub fn write_to(&self, out: &mut BytesMut) {
        out.put_slice(self.method.as_ref().as_bytes());
        out.put_slice(SP);
        out.put_slice(self.url.to_string().as_bytes());
        out.put_slice(SP);
        out.put_slice(self.version.to_string().as_bytes());
        out.put_slice(CRLF);
        write_headers_and_body(out, &self.headers, &self.body);
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub version: Version,
    pub status: Status,
    pub headers: Headers,
    pub body: Bytes,
}

impl Default for HttpResponse {
    fn default() -> Self {
        HttpResponse {
            version: Version::Http1_1,
            status: Status::OK,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }
}

impl HttpResponse {
    pub fn should_close_connection(&self) -> bool {
        should_close_connection(&self.headers, self.version)
    }

    pub fn set_content_length(&mut self) {
        self.headers.set("Content-Length", self.body.len().to_string());
    }

    pub fn write_to(&self, out: &mut BytesMut) {
        out.put_slice(self.version.to_string().as_bytes());
        out.put_slice(SP);
        out.put_slice(self.status.to_string().as_bytes());
        out.put_slice(SP);
        out.put_slice(self.status.reason().as_bytes());
        out.put_slice(CRLF);
        write_headers_and_body(out, &self.headers, &self.body);
    }
}
