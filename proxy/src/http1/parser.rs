use bytes::BytesMut;
use itertools::Itertools;

use crate::buffer::BufferSegment;
use crate::error::ProxyError;
use crate::http1::exchange::HttpExchange;
use crate::http1::message::{CRLF, Headers, Method, SP, Status, Version};
use crate::http1::url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageMode {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    None,
    Given,
    Chunked,
    All,
}

#[derive(Debug)]
struct BodyState {
    mode: MessageMode,
    kind: BodyKind,
    expected: usize,
    read: usize,
    chunk_size_known: bool,
    finished: bool,
}

/// Streaming HTTP/1.x parser. Head parsing expects the full head to be
/// buffered; body parsing is resumable across socket reads, with its state
/// reset automatically once a body completes so the same parser serves the
/// opposite direction and subsequent exchanges.
#[derive(Debug)]
pub struct HttpParser {
    body_size_limit: usize,
    state: Option<BodyState>,
    body_buf: BufferSegment,
    chunk_header_buf: BufferSegment,
    chunk_suffix_buf: BufferSegment,
}

fn utf8(raw: &[u8], err: ProxyError) -> Result<&str, ProxyError> {
    std::str::from_utf8(raw).map_err(|_| err)
}

fn trim_hws(value: &str) -> &str {
    value.trim_matches(|c| c == ' ' || c == '\t')
}

impl HttpParser {
    pub fn new(body_size_limit: usize) -> Self {
        HttpParser {
            body_size_limit,
            state: None,
            body_buf: BufferSegment::new(),
            chunk_header_buf: BufferSegment::new(),
            chunk_suffix_buf: BufferSegment::new(),
        }
    }

    pub fn read_request_line(
        &mut self,
        input: &mut BytesMut,
        exchange: &mut HttpExchange,
    ) -> Result<(), ProxyError> {
        let mut method_buf = BufferSegment::new();
        let mut target_buf = BufferSegment::new();
        let mut version_buf = BufferSegment::new();
        if !method_buf.read_until(input, SP)
            || !target_buf.read_until(input, SP)
            || !version_buf.read_until(input, CRLF)
        {
            return Err(ProxyError::InvalidRequestLine);
        }

        let method = Method::parse(utf8(method_buf.committed(), ProxyError::InvalidRequestLine)?)?;
        let target = Url::parse_target(
            utf8(target_buf.committed(), ProxyError::InvalidRequestLine)?,
            method,
        )?;
        let version = Version::parse(utf8(
            version_buf.committed(),
            ProxyError::InvalidRequestLine,
        )?)?;

        let request = exchange.request_mut();
        request.method = method;
        request.url = target;
        request.version = version;
        Ok(())
    }

    pub fn read_response_line(
        &mut self,
        input: &mut BytesMut,
        exchange: &mut HttpExchange,
    ) -> Result<(), ProxyError> {
        let mut version_buf = BufferSegment::new();
        let mut code_buf = BufferSegment::new();
        let mut reason_buf = BufferSegment::new();
        if !version_buf.read_until(input, SP)
            || !code_buf.read_until(input, SP)
            || !reason_buf.read_until(input, CRLF)
        {
            return Err(ProxyError::InvalidResponseLine);
        }

        let version = Version::parse(utf8(
            version_buf.committed(),
            ProxyError::InvalidResponseLine,
        )?)?;
        let status = Status::parse(utf8(code_buf.committed(), ProxyError::InvalidResponseLine)?)?;
        // The reason phrase is discarded and regenerated on write.

        let response = exchange.make_response();
        response.version = version;
        response.status = status;
        Ok(())
    }

    pub fn read_headers(
        &mut self,
        input: &mut BytesMut,
        headers: &mut Headers,
    ) -> Result<(), ProxyError> {
        let mut header_buf = BufferSegment::new();
        loop {
            if !header_buf.read_until(input, CRLF) {
                return Err(ProxyError::InvalidHeader);
            }
            let line = utf8(header_buf.committed(), ProxyError::InvalidHeader)?;
            if line.is_empty() {
                return Ok(());
            }
            let Some(delim) = line.find(':') else {
                return Err(ProxyError::InvalidHeader);
            };
            let name = &line[..delim];
            let value = trim_hws(&line[delim + 1..]);
            headers.add(name, value);
            header_buf.reset();
        }
    }

    /// Body framing, computed once per exchange direction.
    fn expected_body_size(
        &self,
        exchange: &HttpExchange,
        mode: MessageMode,
    ) -> Result<(BodyKind, usize), ProxyError> {
        const NONE: (BodyKind, usize) = (BodyKind::None, 0);
        let request = exchange.request();

        let headers = match mode {
            MessageMode::Request => {
                if request.headers.has_value("Expect", "100-continue", true) {
                    return Ok(NONE);
                }
                &request.headers
            }
            MessageMode::Response => {
                let response = exchange.response()?;
                if request.method == Method::Head {
                    return Ok(NONE);
                }
                if response.status.is_1xx() {
                    return Ok(NONE);
                }
                if response.status == Status::NO_CONTENT {
                    return Ok(NONE);
                }
                if response.status == Status::NOT_MODIFIED {
                    return Ok(NONE);
                }
                if response.status == Status::OK && request.method == Method::Connect {
                    return Ok(NONE);
                }
                &response.headers
            }
        };

        if headers.has_token("Transfer-Encoding", "chunked") {
            return Ok((BodyKind::Chunked, 0));
        }

        if headers.has("Content-Length") {
            let sizes = headers.get_all("Content-Length");
            if !sizes.iter().all_equal() {
                return Err(ProxyError::InvalidBodySize);
            }
            let size = sizes[0]
                .parse::<u64>()
                .map_err(|_| ProxyError::InvalidBodySize)?;
            return Ok((BodyKind::Given, size as usize));
        }

        match mode {
            MessageMode::Request => Ok(NONE),
            MessageMode::Response => Ok((BodyKind::All, 0)),
        }
    }

    /// Consume whatever body bytes are available. Returns true when the body
    /// is complete and has been moved into the message; false when more
    /// socket data is needed. `eof` marks that the stream has ended.
    pub fn read_body(
        &mut self,
        input: &mut BytesMut,
        exchange: &mut HttpExchange,
        mode: MessageMode,
        eof: bool,
    ) -> Result<bool, ProxyError> {
        if self.state.is_none() {
            let (kind, expected) = self.expected_body_size(exchange, mode)?;
            if kind == BodyKind::None {
                return Ok(true);
            }
            if expected > self.body_size_limit {
                return Err(ProxyError::BodySizeTooLarge);
            }
            self.state = Some(BodyState {
                mode,
                kind,
                expected,
                read: 0,
                chunk_size_known: false,
                finished: false,
            });
        }

        let Some(state) = self.state.as_mut() else {
            return Err(ProxyError::ParserError);
        };
        if state.mode != mode {
            return Err(ProxyError::ParserError);
        }

        match state.kind {
            BodyKind::Chunked => {
                'chunks: loop {
                    if !state.chunk_size_known {
                        if !self.chunk_header_buf.read_until(input, CRLF) {
                            break 'chunks;
                        }
                        let line =
                            utf8(self.chunk_header_buf.committed(), ProxyError::InvalidChunkedBody)?;
                        // Chunk extensions after ';' are ignored.
                        let size_part = line.split(';').next().unwrap_or("").trim();
                        let size = usize::from_str_radix(size_part, 16)
                            .map_err(|_| ProxyError::InvalidChunkedBody)?;
                        self.chunk_header_buf.reset();

                        if state.read + size > self.body_size_limit {
                            return Err(ProxyError::BodySizeTooLarge);
                        }
                        state.expected = size;
                        state.chunk_size_known = true;
                    }

                    if state.expected == 0 {
                        // Terminator: consume optional trailer headers up to
                        // the empty line; trailers are not retained.
                        loop {
                            if !self.chunk_suffix_buf.read_until(input, CRLF) {
                                break 'chunks;
                            }
                            let blank = self.chunk_suffix_buf.committed().is_empty();
                            self.chunk_suffix_buf.reset();
                            if blank {
                                state.finished = true;
                                break 'chunks;
                            }
                        }
                    } else {
                        if !self
                            .body_buf
                            .read_up_to_bytes(input, state.read + state.expected)
                        {
                            break 'chunks;
                        }
                        if !self.chunk_suffix_buf.read_until(input, CRLF) {
                            break 'chunks;
                        }
                        if !self.chunk_suffix_buf.committed().is_empty() {
                            return Err(ProxyError::InvalidChunkedBody);
                        }
                        self.chunk_suffix_buf.reset();
                        state.read += state.expected;
                        state.expected = 0;
                        state.chunk_size_known = false;
                        // Keep the chunk, allow the next one to append.
                        self.body_buf.mark_as_incomplete();
                    }
                }
            }
            BodyKind::Given => {
                if self.body_buf.read_up_to_bytes(input, state.expected) {
                    state.read = state.expected;
                    state.finished = true;
                }
            }
            BodyKind::All => {
                let just_read = self.body_buf.read_all(input);
                state.read += just_read;
                if state.read > self.body_size_limit {
                    return Err(ProxyError::BodySizeTooLarge);
                }
                if eof {
                    state.finished = true;
                }
            }
            BodyKind::None => {}
        }

        if state.finished {
            let body = self.body_buf.take();
            match mode {
                MessageMode::Request => exchange.request_mut().body = body,
                MessageMode::Response => exchange.response_mut()?.body = body,
            }
            self.reset_body_state();
            return Ok(true);
        }
        Ok(false)
    }

    pub fn reset_body_state(&mut self) {
        self.state = None;
        self.body_buf.reset();
        self.chunk_header_buf.reset();
        self.chunk_suffix_buf.reset();
    }
}
