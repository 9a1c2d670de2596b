use bytes::Bytes;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum AlpnProtocol {
    Http1,
    Http2,
    Http3,
    Unknown(Bytes),
    #[default]
    None,
}

const ALPN_H3: &[u8] = b"h3";
const ALPN_H2: &[u8] = b"h2";
const ALPN_H11: &[u8] = b"http/1.1";

impl AlpnProtocol {
    pub fn to_bytes(&self) -> &[u8] {
        match self {
            AlpnProtocol::Http1 => ALPN_H11,
            AlpnProtocol::Http2 => ALPN_H2,
            AlpnProtocol::Http3 => ALPN_H3,
            AlpnProtocol::Unknown(bytes) => bytes,
            AlpnProtocol::None => &[],
        }
    }

    pub fn from_bytes_opt(alpn: Option<&[u8]>) -> Self {
        match alpn {
            Some(bytes) => AlpnProtocol::from_bytes(bytes),
            None => AlpnProtocol::None,
        }
    }

    pub fn from_bytes(alpn: &[u8]) -> Self {
        match alpn {
            ALPN_H3 => AlpnProtocol::Http3,
            ALPN_H2 => AlpnProtocol::Http2,
            ALPN_H11 => AlpnProtocol::Http1,
            _ => AlpnProtocol::Unknown(Bytes::from(alpn.to_owned())),
        }
    }

    /// True when the protocol can be spoken over the intercepted HTTP/1 path.
    pub fn is_http1_compatible(&self) -> bool {
        matches!(self, AlpnProtocol::Http1 | AlpnProtocol::None)
    }
}

pub fn alp_h1() -> Vec<Vec<u8>> {
    vec![ALPN_H11.to_vec()]
}

/// Remove protocols the intercepted path cannot speak. HTTP/2 and SPDY
/// offers are stripped so the upstream settles on something we can relay.
pub fn filter_offered(offered: &[String]) -> Vec<Vec<u8>> {
    offered
        .iter()
        .filter(|p| {
            !(p.as_str() == "h2"
                || p.starts_with("h2-")
                || p.to_ascii_lowercase().starts_with("spdy"))
        })
        .map(|p| p.as_bytes().to_vec())
        .collect()
}

#[allow(clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_bytes_recognizes_known_protocols() {
        assert_eq!(AlpnProtocol::from_bytes(b"http/1.1"), AlpnProtocol::Http1);
        assert_eq!(AlpnProtocol::from_bytes(b"h2"), AlpnProtocol::Http2);
        assert_eq!(AlpnProtocol::from_bytes(b"h3"), AlpnProtocol::Http3);
    }

    #[test]
    fn from_bytes_opt_handles_none() {
        assert_eq!(AlpnProtocol::from_bytes_opt(None), AlpnProtocol::None);
        assert_eq!(
            AlpnProtocol::from_bytes_opt(Some(b"h2")),
            AlpnProtocol::Http2
        );
    }

    #[test]
    fn unknown_protocol_is_preserved() {
        let raw = b"h3-29";
        let p = AlpnProtocol::from_bytes(raw);
        match &p {
            AlpnProtocol::Unknown(b) => assert_eq!(b.as_ref(), raw),
            other => panic!("expected Unknown, got {:?}", other),
        }
        assert_eq!(p.to_bytes(), raw);
    }

    #[test]
    fn http1_compatibility() {
        assert!(AlpnProtocol::Http1.is_http1_compatible());
        assert!(AlpnProtocol::None.is_http1_compatible());
        assert!(!AlpnProtocol::Http2.is_http1_compatible());
        assert!(!AlpnProtocol::Unknown(Bytes::from_static(b"imap")).is_http1_compatible());
    }

    #[test]
    fn filter_offered_strips_h2_and_spdy() {
        let offered = vec![
            "http/1.1".to_string(),
            "h2".to_string(),
            "h2-14".to_string(),
            "SPDY".to_string(),
            "spdy/3".to_string(),
        ];
        let filtered = filter_offered(&offered);
        assert_eq!(filtered, vec![b"http/1.1".to_vec()]);
    }
}
