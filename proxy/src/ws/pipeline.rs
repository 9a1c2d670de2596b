use std::{
    collections::VecDeque,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;

use crate::http1::exchange::HttpExchange;
use crate::ws::frame::{Frame, Opcode};
use crate::ws::handshake::{self, ExtensionData};

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Which side of the proxied WebSocket session something belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsEndpoint {
    Client,
    Server,
}

impl WsEndpoint {
    pub fn opposite(self) -> WsEndpoint {
        match self {
            WsEndpoint::Client => WsEndpoint::Server,
            WsEndpoint::Server => WsEndpoint::Client,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

impl Default for CloseFrame {
    fn default() -> Self {
        CloseFrame {
            code: CLOSE_NORMAL,
            reason: String::new(),
        }
    }
}

/// A reassembled data message as handed to interceptors. A blocked message
/// is dropped instead of forwarded.
#[derive(Debug, Clone)]
pub struct WebSocketMessage {
    pub opcode: Opcode,
    pub origin: WsEndpoint,
    content: Bytes,
    blocked: bool,
}

impl WebSocketMessage {
    pub fn new(opcode: Opcode, origin: WsEndpoint, content: Bytes) -> Self {
        WebSocketMessage {
            opcode,
            origin,
            content,
            blocked: false,
        }
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn set_content(&mut self, content: impl Into<Bytes>) {
        self.content = content.into();
    }

    pub fn blocked(&self) -> bool {
        self.blocked
    }

    pub fn block(&mut self) {
        self.blocked = true;
    }
}

#[derive(Debug, Default)]
struct CloseState {
    closed_by: Option<WsEndpoint>,
    frame: CloseFrame,
}

/// Shared state of one proxied WebSocket session: handshake metadata, the
/// close record, and per-direction injection queues. Interceptors may
/// inject from threads other than the flow's own task, hence the mutexes.
#[derive(Debug)]
pub struct WebSocketPipeline {
    intercept: AtomicBool,
    closed: AtomicBool,
    close_state: Mutex<CloseState>,

    client_key: String,
    client_protocol: Option<String>,
    server_accept: String,
    server_protocol: Option<String>,
    extensions: Vec<ExtensionData>,

    client_frames: Mutex<VecDeque<Frame>>,
    server_frames: Mutex<VecDeque<Frame>>,
    client_messages: Mutex<VecDeque<WebSocketMessage>>,
    server_messages: Mutex<VecDeque<WebSocketMessage>>,
}

impl WebSocketPipeline {
    /// Capture the handshake exchange. The response headers carry what the
    /// upstream actually negotiated.
    pub fn new(handshake: &HttpExchange, intercept: bool) -> Self {
        let request = handshake.request();
        let response_headers = handshake
            .response()
            .map(|res| res.headers.clone())
            .unwrap_or_default();

        WebSocketPipeline {
            intercept: AtomicBool::new(intercept),
            closed: AtomicBool::new(false),
            close_state: Mutex::new(CloseState::default()),
            client_key: handshake::client_key(&request.headers),
            client_protocol: handshake::protocol(&request.headers),
            server_accept: handshake::server_accept(&response_headers),
            server_protocol: handshake::protocol(&response_headers),
            extensions: handshake::parse_extensions(&response_headers),
            client_frames: Mutex::new(VecDeque::new()),
            server_frames: Mutex::new(VecDeque::new()),
            client_messages: Mutex::new(VecDeque::new()),
            server_messages: Mutex::new(VecDeque::new()),
        }
    }

    pub fn should_intercept(&self) -> bool {
        self.intercept.load(Ordering::Relaxed)
    }

    pub fn set_interception(&self, flag: bool) {
        self.intercept.store(flag, Ordering::Relaxed);
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn closed_by(&self) -> Option<WsEndpoint> {
        self.close_state.lock().ok().and_then(|s| s.closed_by)
    }

    pub fn close_frame(&self) -> CloseFrame {
        self.close_state
            .lock()
            .map(|s| s.frame.clone())
            .unwrap_or_default()
    }

    /// Record how the session closed; first closer wins. Marks the pipeline
    /// closed so further enqueues are rejected.
    pub fn set_close_state(&self, closer: WsEndpoint, frame: CloseFrame) {
        if let Ok(mut state) = self.close_state.lock()
            && state.closed_by.is_none()
        {
            state.closed_by = Some(closer);
            state.frame = frame;
        }
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn client_key(&self) -> &str {
        &self.client_key
    }

    pub fn client_protocol(&self) -> Option<&str> {
        self.client_protocol.as_deref()
    }

    pub fn server_accept(&self) -> &str {
        &self.server_accept
    }

    pub fn server_protocol(&self) -> Option<&str> {
        self.server_protocol.as_deref()
    }

    pub fn extensions(&self) -> &[ExtensionData] {
        &self.extensions
    }

    fn frame_queue(&self, destination: WsEndpoint) -> &Mutex<VecDeque<Frame>> {
        match destination {
            WsEndpoint::Client => &self.client_frames,
            WsEndpoint::Server => &self.server_frames,
        }
    }

    fn message_queue(&self, destination: WsEndpoint) -> &Mutex<VecDeque<WebSocketMessage>> {
        match destination {
            WsEndpoint::Client => &self.client_messages,
            WsEndpoint::Server => &self.server_messages,
        }
    }

    /// Queue a frame for delivery toward `destination`. Rejected once the
    /// pipeline has closed.
    pub fn inject_frame(&self, destination: WsEndpoint, frame: Frame) -> bool {
        if self.closed() {
            return false;
        }
        match self.frame_queue(destination).lock() {
            Ok(mut queue) => {
                queue.push_back(frame);
                true
            }
            Err(_) => false,
        }
    }

    pub fn pop_frame(&self, destination: WsEndpoint) -> Option<Frame> {
        self.frame_queue(destination)
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
    }

    pub fn inject_message(&self, destination: WsEndpoint, message: WebSocketMessage) -> bool {
        if self.closed() {
            return false;
        }
        match self.message_queue(destination).lock() {
            Ok(mut queue) => {
                queue.push_back(message);
                true
            }
            Err(_) => false,
        }
    }

    pub fn pop_message(&self, destination: WsEndpoint) -> Option<WebSocketMessage> {
        self.message_queue(destination)
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
    }
}
