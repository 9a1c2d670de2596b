use crate::error::ProxyError;
use crate::http1::message::{Headers, HttpRequest, HttpResponse};

pub fn is_request_handshake(req: &HttpRequest) -> bool {
    req.headers.has_token("Connection", "Upgrade")
        && req.headers.has_token("Upgrade", "websocket")
        && req.headers.has_value("Sec-WebSocket-Version", "13", false)
        && req.headers.is_nonempty("Sec-WebSocket-Key")
}

pub fn is_response_handshake(res: &HttpResponse) -> bool {
    res.headers.has_token("Connection", "Upgrade")
        && res.headers.has_token("Upgrade", "websocket")
        && res.headers.is_nonempty("Sec-WebSocket-Accept")
}

pub fn client_key(headers: &Headers) -> String {
    headers.get("Sec-WebSocket-Key").unwrap_or("").to_string()
}

pub fn server_accept(headers: &Headers) -> String {
    headers
        .get("Sec-WebSocket-Accept")
        .unwrap_or("")
        .to_string()
}

pub fn protocol(headers: &Headers) -> Option<String> {
    headers.get("Sec-WebSocket-Protocol").map(String::from)
}

/// One negotiated extension: a name plus `param` or `param=value` entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionData {
    pub name: String,
    params: Vec<(String, String)>,
}

impl ExtensionData {
    pub fn new(name: impl Into<String>) -> Self {
        ExtensionData {
            name: name.into(),
            params: Vec::new(),
        }
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.params.iter().any(|(n, _)| n == name)
    }

    pub fn get_param(&self, name: &str) -> Result<&str, ProxyError> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .ok_or(ProxyError::ExtensionParamNotFound)
    }

    pub fn set_param(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        match self.params.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value.into(),
            None => self.params.push((name, value.into())),
        }
    }

    /// Parse a single `name; p1; p2=v` clause. A comma means the caller
    /// failed to split a multi-extension header first.
    pub fn from_header_value(raw: &str) -> Result<ExtensionData, ProxyError> {
        if raw.contains(',') {
            return Err(ProxyError::InvalidExtensionString);
        }
        let mut parts = raw.split(';').map(str::trim);
        let name = parts.next().unwrap_or("");
        if name.is_empty() {
            return Err(ProxyError::InvalidExtensionString);
        }

        let mut data = ExtensionData::new(name);
        for part in parts {
            if part.is_empty() {
                return Err(ProxyError::InvalidExtensionString);
            }
            match part.find('=') {
                Some(assign) => data.set_param(&part[..assign], &part[assign + 1..]),
                None => data.set_param(part, ""),
            }
        }
        Ok(data)
    }
}

/// Extensions may be spread over repeated headers or packed into one
/// comma-separated value. Unparseable entries are skipped.
pub fn parse_extensions(headers: &Headers) -> Vec<ExtensionData> {
    let mut extensions = Vec::new();
    for header in headers.get_all("Sec-WebSocket-Extensions") {
        for clause in header.split(',') {
            let clause = clause.trim();
            if clause.is_empty() {
                continue;
            }
            match ExtensionData::from_header_value(clause) {
                Ok(ext) => extensions.push(ext),
                Err(err) => {
                    tracing::debug!("Unrecognized extension \"{clause}\": {err}");
                }
            }
        }
    }
    extensions
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::http1::message::Status;

    fn upgrade_request() -> HttpRequest {
        let mut req = HttpRequest::default();
        req.headers.add("Connection", "keep-alive, Upgrade");
        req.headers.add("Upgrade", "websocket");
        req.headers.add("Sec-WebSocket-Version", "13");
        req.headers.add("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==");
        req
    }

    #[test]
    fn request_handshake_detection() {
        assert!(is_request_handshake(&upgrade_request()));

        let mut missing_key = upgrade_request();
        missing_key.headers.remove("Sec-WebSocket-Key");
        assert!(!is_request_handshake(&missing_key));

        let mut wrong_version = upgrade_request();
        wrong_version.headers.set("Sec-WebSocket-Version", "8");
        assert!(!is_request_handshake(&wrong_version));
    }

    #[test]
    fn response_handshake_detection() {
        let mut res = HttpResponse {
            status: Status::SWITCHING_PROTOCOLS,
            ..HttpResponse::default()
        };
        res.headers.add("Connection", "Upgrade");
        res.headers.add("Upgrade", "websocket");
        res.headers
            .add("Sec-WebSocket-Accept", "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert!(is_response_handshake(&res));

        res.headers.remove("Sec-WebSocket-Accept");
        assert!(!is_response_handshake(&res));
    }

    #[test]
    fn extension_parsing() {
        let ext = ExtensionData::from_header_value("mux; max-channels=4; flow-control").unwrap();
        assert_eq!(ext.name, "mux");
        assert_eq!(ext.get_param("max-channels").unwrap(), "4");
        assert!(ext.has_param("flow-control"));
        assert_eq!(
            ext.get_param("missing").unwrap_err(),
            ProxyError::ExtensionParamNotFound
        );
    }

    #[test]
    fn multi_extension_clause_is_invalid() {
        assert_eq!(
            ExtensionData::from_header_value("a, b").unwrap_err(),
            ProxyError::InvalidExtensionString
        );
    }

    #[test]
    fn extensions_across_headers_and_commas() {
        let mut headers = Headers::new();
        headers.add(
            "Sec-WebSocket-Extensions",
            "mux; max-channels=4, deflate-stream",
        );
        headers.add("Sec-WebSocket-Extensions", "private-extension");
        let extensions = parse_extensions(&headers);
        let names: Vec<&str> = extensions.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["mux", "deflate-stream", "private-extension"]);
    }
}
