use std::collections::BTreeMap;

use crate::buffer::ConstBufferSegment;
use crate::error::ProxyError;

pub const RECORD_HEADER_LENGTH: usize = 5;
const HANDSHAKE_HEADER_LENGTH: usize = 4;

const EXTENSION_SERVER_NAME: u16 = 0x0000;
const EXTENSION_ALPN: u16 = 0x0010;

/// Two-stage resumable reader for the opening TLS record. Operates over a
/// borrowed view of the endpoint input so the bytes can be replayed into the
/// real handshake afterwards.
#[derive(Debug, Default)]
pub struct ClientHelloReader {
    record_length: Option<usize>,
}

impl ClientHelloReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect the buffered bytes. Returns the number of additional bytes
    /// required, or 0 when the full record is buffered. Only the record
    /// header is examined before the declared length is known.
    pub fn read(&mut self, input: &[u8]) -> Result<usize, ProxyError> {
        if self.record_length.is_none() {
            let mut segment = ConstBufferSegment::new(input);
            let Some(header) = segment.read_up_to_bytes(RECORD_HEADER_LENGTH) else {
                // Validate whatever prefix is present before asking for more.
                Self::check_header_prefix(input)?;
                return Ok(RECORD_HEADER_LENGTH - input.len());
            };
            Self::check_header_prefix(header)?;
            let length = u16::from_be_bytes([header[3], header[4]]) as usize;
            self.record_length = Some(RECORD_HEADER_LENGTH + length);
        }

        match self.record_length {
            Some(total) => Ok(total.saturating_sub(input.len())),
            None => Err(ProxyError::InvalidClientHello),
        }
    }

    pub fn record_length(&self) -> Option<usize> {
        self.record_length
    }

    pub fn reset(&mut self) {
        self.record_length = None;
    }

    fn check_header_prefix(prefix: &[u8]) -> Result<(), ProxyError> {
        if let Some(&record_type) = prefix.first()
            && record_type != 0x16
        {
            return Err(ProxyError::InvalidClientHello);
        }
        if let Some(&major) = prefix.get(1)
            && major != 0x03
        {
            return Err(ProxyError::InvalidClientHello);
        }
        if let Some(&minor) = prefix.get(2)
            && minor > 0x03
        {
            return Err(ProxyError::InvalidClientHello);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerNameEntry {
    pub name_type: u8,
    pub host_name: String,
}

/// Structurally parsed ClientHello, no decryption involved. Unknown
/// extensions are retained as opaque byte arrays keyed by type.
#[derive(Debug, Clone, Default)]
pub struct ClientHelloRecord {
    pub record_header: [u8; RECORD_HEADER_LENGTH],
    pub handshake_header: [u8; HANDSHAKE_HEADER_LENGTH],
    pub version: [u8; 2],
    pub random: [u8; 32],
    pub session_id: Vec<u8>,
    pub cipher_suites: Vec<u16>,
    pub compression_methods: Vec<u8>,
    pub extensions: BTreeMap<u16, Vec<u8>>,
    pub server_names: Vec<ServerNameEntry>,
    pub alpn: Vec<String>,
}

struct Walker<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Walker<'a> {
    fn new(data: &'a [u8]) -> Self {
        Walker { data, pos: 0 }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], ProxyError> {
        if self.pos + count > self.data.len() {
            return Err(ProxyError::ReadAccessViolation);
        }
        let view = &self.data[self.pos..self.pos + count];
        self.pos += count;
        Ok(view)
    }

    fn read_u8(&mut self) -> Result<usize, ProxyError> {
        Ok(self.take(1)?[0] as usize)
    }

    fn read_u16(&mut self) -> Result<usize, ProxyError> {
        let raw = self.take(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]) as usize)
    }
}

impl ClientHelloRecord {
    /// Parse a complete handshake record as gathered by the reader. Any
    /// bounds violation is reported as an invalid hello so the flow can
    /// downgrade to a tunnel.
    pub fn from_raw_data(raw: &[u8]) -> Result<ClientHelloRecord, ProxyError> {
        Self::from_raw_data_impl(raw).map_err(|err| match err {
            ProxyError::ReadAccessViolation => ProxyError::InvalidClientHello,
            other => other,
        })
    }

    fn from_raw_data_impl(raw: &[u8]) -> Result<ClientHelloRecord, ProxyError> {
        if raw.len() < RECORD_HEADER_LENGTH + HANDSHAKE_HEADER_LENGTH {
            return Err(ProxyError::InvalidClientHello);
        }

        let mut walker = Walker::new(raw);
        let mut record = ClientHelloRecord::default();
        record.record_header.copy_from_slice(walker.take(RECORD_HEADER_LENGTH)?);
        record
            .handshake_header
            .copy_from_slice(walker.take(HANDSHAKE_HEADER_LENGTH)?);

        // Must be a ClientHello handshake message.
        if record.handshake_header[0] != 0x01 {
            return Err(ProxyError::InvalidClientHello);
        }
        let handshake_length = u32::from_be_bytes([
            0,
            record.handshake_header[1],
            record.handshake_header[2],
            record.handshake_header[3],
        ]) as usize;
        if handshake_length != raw.len() - RECORD_HEADER_LENGTH - HANDSHAKE_HEADER_LENGTH {
            return Err(ProxyError::InvalidClientHello);
        }

        record.version.copy_from_slice(walker.take(2)?);
        record.random.copy_from_slice(walker.take(32)?);

        let session_id_length = walker.read_u8()?;
        record.session_id = walker.take(session_id_length)?.to_vec();

        let ciphers_length = walker.read_u16()?;
        if ciphers_length % 2 != 0 {
            return Err(ProxyError::InvalidClientHello);
        }
        for _ in 0..ciphers_length / 2 {
            record.cipher_suites.push(walker.read_u16()? as u16);
        }

        let compression_length = walker.read_u8()?;
        record.compression_methods = walker.take(compression_length)?.to_vec();

        let extensions_length = walker.read_u16()?;
        if extensions_length != 0 {
            // Extensions run to the end of the record.
            while walker.pos < raw.len() {
                let ext_type = walker.read_u16()? as u16;
                let ext_length = walker.read_u16()?;

                match ext_type {
                    EXTENSION_SERVER_NAME => {
                        let end = walker.pos + ext_length;
                        walker.read_u16()?; // server name list length
                        while walker.pos < end {
                            let name_type = walker.take(1)?[0];
                            let name_length = walker.read_u16()?;
                            let host_name = String::from_utf8(walker.take(name_length)?.to_vec())
                                .map_err(|_| ProxyError::InvalidClientHello)?;
                            record.server_names.push(ServerNameEntry {
                                name_type,
                                host_name,
                            });
                        }
                        if walker.pos != end {
                            return Err(ProxyError::InvalidClientHello);
                        }
                    }
                    EXTENSION_ALPN => {
                        let alpn_length = walker.read_u16()?;
                        let end = walker.pos + alpn_length;
                        while walker.pos < end {
                            let entry_length = walker.read_u8()?;
                            let protocol = String::from_utf8(walker.take(entry_length)?.to_vec())
                                .map_err(|_| ProxyError::InvalidClientHello)?;
                            record.alpn.push(protocol);
                        }
                        if walker.pos != end {
                            return Err(ProxyError::InvalidClientHello);
                        }
                    }
                    other => {
                        let data = walker.take(ext_length)?.to_vec();
                        if record.extensions.insert(other, data).is_some() {
                            return Err(ProxyError::InvalidClientHello);
                        }
                    }
                }
            }
        }

        if walker.pos != raw.len() {
            return Err(ProxyError::InvalidClientHello);
        }
        Ok(record)
    }

    pub fn has_server_names_extension(&self) -> bool {
        !self.server_names.is_empty()
    }

    pub fn has_alpn_extension(&self) -> bool {
        !self.alpn.is_empty()
    }

    pub fn sni_hostnames(&self) -> Vec<String> {
        self.server_names
            .iter()
            .map(|entry| entry.host_name.clone())
            .collect()
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    /// Assemble a syntactically valid ClientHello for tests.
    pub(crate) fn build_client_hello(
        sni: &[&str],
        alpn: &[&str],
        ciphers: &[u16],
    ) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // client version
        body.extend_from_slice(&[0xAB; 32]); // random
        body.push(0); // empty session id

        body.extend_from_slice(&((ciphers.len() * 2) as u16).to_be_bytes());
        for c in ciphers {
            body.extend_from_slice(&c.to_be_bytes());
        }
        body.push(1); // one compression method
        body.push(0); // null

        let mut extensions = Vec::new();
        if !sni.is_empty() {
            let mut list = Vec::new();
            for name in sni {
                list.push(0u8); // host_name type
                list.extend_from_slice(&(name.len() as u16).to_be_bytes());
                list.extend_from_slice(name.as_bytes());
            }
            let mut ext = Vec::new();
            ext.extend_from_slice(&(list.len() as u16).to_be_bytes());
            ext.extend_from_slice(&list);

            extensions.extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
            extensions.extend_from_slice(&(ext.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&ext);
        }
        if !alpn.is_empty() {
            let mut list = Vec::new();
            for protocol in alpn {
                list.push(protocol.len() as u8);
                list.extend_from_slice(protocol.as_bytes());
            }
            let mut ext = Vec::new();
            ext.extend_from_slice(&(list.len() as u16).to_be_bytes());
            ext.extend_from_slice(&list);

            extensions.extend_from_slice(&EXTENSION_ALPN.to_be_bytes());
            extensions.extend_from_slice(&(ext.len() as u16).to_be_bytes());
            extensions.extend_from_slice(&ext);
        }
        // One opaque extension to exercise retention.
        extensions.extend_from_slice(&0x002bu16.to_be_bytes()); // supported_versions
        extensions.extend_from_slice(&3u16.to_be_bytes());
        extensions.extend_from_slice(&[0x02, 0x03, 0x04]);

        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = Vec::new();
        handshake.push(0x01); // client_hello
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = Vec::new();
        record.push(0x16);
        record.extend_from_slice(&[0x03, 0x01]);
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn reader_rejects_non_handshake_first_byte() {
        let mut reader = ClientHelloReader::new();
        assert_eq!(
            reader.read(b"G").unwrap_err(),
            ProxyError::InvalidClientHello
        );
    }

    #[test]
    fn reader_needs_header_then_body() {
        let raw = build_client_hello(&["example.test"], &["http/1.1"], &[0x1301]);
        let mut reader = ClientHelloReader::new();

        assert_eq!(reader.read(&raw[..2]).unwrap(), 3);
        assert_eq!(reader.read(&raw[..5]).unwrap(), raw.len() - 5);
        assert_eq!(reader.read(&raw).unwrap(), 0);
        assert_eq!(reader.record_length(), Some(raw.len()));
    }

    #[test]
    fn reader_rejects_bad_version_byte() {
        let mut reader = ClientHelloReader::new();
        assert_eq!(
            reader.read(&[0x16, 0x02]).unwrap_err(),
            ProxyError::InvalidClientHello
        );
        let mut reader = ClientHelloReader::new();
        assert_eq!(
            reader.read(&[0x16, 0x03, 0x04]).unwrap_err(),
            ProxyError::InvalidClientHello
        );
    }

    #[test]
    fn parses_sni_alpn_ciphers_and_opaque_extensions() {
        let raw = build_client_hello(
            &["example.test", "alt.example.test"],
            &["http/1.1", "spdy/3"],
            &[0x1301, 0x1302, 0xc02f],
        );
        let record = ClientHelloRecord::from_raw_data(&raw).unwrap();

        assert_eq!(
            record.sni_hostnames(),
            vec!["example.test".to_string(), "alt.example.test".to_string()]
        );
        assert_eq!(record.alpn, vec!["http/1.1", "spdy/3"]);
        assert_eq!(record.cipher_suites, vec![0x1301, 0x1302, 0xc02f]);
        assert_eq!(record.compression_methods, vec![0]);
        assert!(record.extensions.contains_key(&0x002b));
        assert!(record.has_server_names_extension());
        assert!(record.has_alpn_extension());
    }

    #[test]
    fn truncated_record_is_invalid() {
        let raw = build_client_hello(&["example.test"], &[], &[0x1301]);
        assert_eq!(
            ClientHelloRecord::from_raw_data(&raw[..raw.len() - 3]).unwrap_err(),
            ProxyError::InvalidClientHello
        );
    }

    #[test]
    fn non_client_hello_handshake_is_invalid() {
        let mut raw = build_client_hello(&[], &[], &[0x1301]);
        raw[5] = 0x02; // server_hello
        assert_eq!(
            ClientHelloRecord::from_raw_data(&raw).unwrap_err(),
            ProxyError::InvalidClientHello
        );
    }
}
