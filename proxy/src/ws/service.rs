use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::{
    connection::{ConnectionFlow, ReadEnd, WriteEnd},
    error::ProxyError,
    http1::exchange::HttpExchange,
    intercept::{WebSocketEvent, WebSocketMessageEvent},
    service::{ServerContext, Transition},
    ws::{
        frame::{Frame, FrameCodec, MessageAssembler, Opcode},
        pipeline::{
            CLOSE_INTERNAL_ERROR, CLOSE_PROTOCOL_ERROR, CloseFrame, WebSocketMessage,
            WebSocketPipeline, WsEndpoint,
        },
    },
};

/// Re-emitted messages are fragmented to these payload sizes; the client
/// side loses four bytes to the masking key.
const CLIENT_CHUNK_SIZE: usize = 4092 - 4;
const SERVER_CHUNK_SIZE: usize = 4092;

/// One direction of the proxied session: reads `source`, writes the peer's
/// half via `dest`.
struct WsDirection {
    source_ep: WsEndpoint,
    dest_ep: WsEndpoint,
    source: ReadEnd,
    dest: WriteEnd,
    codec: FrameCodec,
    assembler: MessageAssembler,
    ready_to_intercept: bool,
}

impl WsDirection {
    fn chunk_size(&self) -> usize {
        match self.source_ep {
            WsEndpoint::Client => CLIENT_CHUNK_SIZE,
            WsEndpoint::Server => SERVER_CHUNK_SIZE,
        }
    }
}

fn lock_flow<'a, 'f>(
    flow: &'a Mutex<&'f mut ConnectionFlow>,
) -> MutexGuard<'a, &'f mut ConnectionFlow> {
    match flow.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Frame pipeline between the upgraded client and upstream connections.
pub struct WebSocketService<'a> {
    flow: &'a mut ConnectionFlow,
    cxt: &'a ServerContext,
    handshake: HttpExchange,
}

impl<'a> WebSocketService<'a> {
    pub fn new(
        flow: &'a mut ConnectionFlow,
        cxt: &'a ServerContext,
        handshake: HttpExchange,
    ) -> Self {
        WebSocketService {
            flow,
            cxt,
            handshake,
        }
    }

    pub async fn run(self) -> Transition {
        let intercept = self.cxt.options.ws_intercept_default || self.flow.intercept_ws;
        let pipeline = Arc::new(WebSocketPipeline::new(&self.handshake, intercept));

        let client = match self.flow.take_client() {
            Ok(endpoint) => endpoint,
            Err(err) => {
                self.flow.error = err;
                return Transition::Stop;
            }
        };
        let server = match self.flow.take_server() {
            Ok(endpoint) => endpoint,
            Err(err) => {
                self.flow.error = err;
                return Transition::Stop;
            }
        };

        self.cxt
            .interceptors
            .run_websocket(WebSocketEvent::Start, self.flow, &pipeline);

        let (client_read, client_write) = client.into_split();
        let (server_read, server_write) = server.into_split();

        // Frames toward the upstream are re-masked; frames toward the
        // client are sent unmasked, per the server role.
        let upstream = WsDirection {
            source_ep: WsEndpoint::Client,
            dest_ep: WsEndpoint::Server,
            source: client_read,
            dest: server_write,
            codec: FrameCodec::new(true),
            assembler: MessageAssembler::default(),
            ready_to_intercept: true,
        };
        let downstream = WsDirection {
            source_ep: WsEndpoint::Server,
            dest_ep: WsEndpoint::Client,
            source: server_read,
            dest: client_write,
            codec: FrameCodec::new(false),
            assembler: MessageAssembler::default(),
            ready_to_intercept: true,
        };

        trace!("flow {}: websocket pipeline running", self.flow.id);
        let cxt = self.cxt;
        let flow_cell = Mutex::new(&mut *self.flow);
        tokio::join!(
            direction_loop(upstream, &pipeline, &flow_cell, cxt),
            direction_loop(downstream, &pipeline, &flow_cell, cxt),
        );
        drop(flow_cell);

        self.cxt
            .interceptors
            .run_websocket(WebSocketEvent::Stop, self.flow, &pipeline);
        Transition::Stop
    }
}

async fn direction_loop(
    mut dir: WsDirection,
    pipeline: &WebSocketPipeline,
    flow: &Mutex<&mut ConnectionFlow>,
    cxt: &ServerContext,
) {
    loop {
        // Closed by the peer: deliver the recorded close frame and finish.
        if pipeline.closed() {
            finish_with_close(&mut dir, pipeline).await;
            return;
        }

        let frames = match dir.codec.decode_all(&mut dir.source.input) {
            Ok(frames) => frames,
            Err(err) => {
                protocol_failure(&mut dir, pipeline, flow, cxt, err).await;
                return;
            }
        };

        for frame in frames {
            let handled = handle_frame(&mut dir, frame, pipeline, flow, cxt);
            if let Err(err) = handled {
                protocol_failure(&mut dir, pipeline, flow, cxt, err).await;
                return;
            }
        }

        // An event handler may have closed the pipeline just now.
        if pipeline.closed() {
            finish_with_close(&mut dir, pipeline).await;
            return;
        }

        // Drain whatever interceptors injected toward this destination.
        while let Some(frame) = pipeline.pop_frame(dir.dest_ep) {
            if let Err(err) = dir.codec.encode(&frame, &mut dir.dest.output) {
                protocol_failure(&mut dir, pipeline, flow, cxt, err).await;
                return;
            }
        }
        while let Some(message) = pipeline.pop_message(dir.dest_ep) {
            if let Err(err) = emit_message(&mut dir, &message) {
                protocol_failure(&mut dir, pipeline, flow, cxt, err).await;
                return;
            }
        }

        if let Err(err) = dir.dest.write_untimed().await {
            io_failure(&mut dir, pipeline, flow, cxt, err.os_error(), false).await;
            return;
        }

        match dir.source.read_some().await {
            Ok(0) => {
                // Stream ended; no use trying to send a close frame.
                io_failure(&mut dir, pipeline, flow, cxt, None, true).await;
                return;
            }
            Err(err) => {
                if pipeline.closed() {
                    // The peer finished and cancelled us; close this side.
                    finish_with_close(&mut dir, pipeline).await;
                    return;
                }
                io_failure(&mut dir, pipeline, flow, cxt, err.os_error(), false).await;
                return;
            }
            Ok(_) => {}
        }
    }
}

fn handle_frame(
    dir: &mut WsDirection,
    frame: Frame,
    pipeline: &WebSocketPipeline,
    flow: &Mutex<&mut ConnectionFlow>,
    cxt: &ServerContext,
) -> Result<(), ProxyError> {
    match frame.opcode {
        Opcode::Ping => {
            // Answer the sender and forward the ping.
            pipeline.inject_frame(dir.source_ep, Frame::pong(frame.payload.clone()));
            dir.codec.encode(&frame, &mut dir.dest.output)
        }
        Opcode::Pong => Ok(()),
        Opcode::Close => {
            let (code, reason) = frame.parse_close();
            pipeline.set_close_state(dir.source_ep, CloseFrame { code, reason });
            Ok(())
        }
        Opcode::Text | Opcode::Binary | Opcode::Continuation => {
            handle_data_frame(dir, frame, pipeline, flow, cxt)
        }
    }
}

fn handle_data_frame(
    dir: &mut WsDirection,
    frame: Frame,
    pipeline: &WebSocketPipeline,
    flow: &Mutex<&mut ConnectionFlow>,
    cxt: &ServerContext,
) -> Result<(), ProxyError> {
    if !pipeline.should_intercept() {
        dir.ready_to_intercept = false;
        return dir.codec.encode(&frame, &mut dir.dest.output);
    }

    // Interception switched on mid-message: keep relaying until the next
    // frame boundary, then start assembling.
    if !dir.ready_to_intercept {
        if frame.fin {
            dir.ready_to_intercept = true;
        }
        return dir.codec.encode(&frame, &mut dir.dest.output);
    }

    let Some((opcode, content)) = dir.assembler.push(&frame)? else {
        return Ok(());
    };

    let mut message = WebSocketMessage::new(opcode, dir.source_ep, content);
    {
        let mut guard = lock_flow(flow);
        cxt.interceptors.run_websocket_message(
            WebSocketMessageEvent::Received,
            &mut **guard,
            pipeline,
            &mut message,
        );
    }

    if message.blocked() {
        debug!("websocket message blocked by interceptor");
        return Ok(());
    }
    emit_message(dir, &message)
}

/// Re-emit one message as frames no larger than the direction's chunk size.
fn emit_message(dir: &mut WsDirection, message: &WebSocketMessage) -> Result<(), ProxyError> {
    if message.blocked() {
        return Ok(());
    }
    let chunk_size = dir.chunk_size();
    let content = message.content();
    let mut offset = 0usize;
    let mut first = true;
    loop {
        let end = (offset + chunk_size).min(content.len());
        let fin = end == content.len();
        let opcode = if first { message.opcode } else { Opcode::Continuation };
        let payload = Bytes::copy_from_slice(&content[offset..end]);
        dir.codec
            .encode(&Frame::data(opcode, fin, payload), &mut dir.dest.output)?;
        first = false;
        if fin {
            return Ok(());
        }
        offset = end;
    }
}

async fn finish_with_close(dir: &mut WsDirection, pipeline: &WebSocketPipeline) {
    let close = pipeline.close_frame();
    let frame = Frame::close(close.code, &close.reason);
    let mut out = BytesMut::new();
    if dir.codec.encode(&frame, &mut out).is_ok() {
        dir.dest.output.extend_from_slice(&out);
        let _ = dir.dest.write_untimed().await;
    }
    dir.dest.shutdown().await;
}

async fn protocol_failure(
    dir: &mut WsDirection,
    pipeline: &WebSocketPipeline,
    flow: &Mutex<&mut ConnectionFlow>,
    cxt: &ServerContext,
    err: ProxyError,
) {
    if !pipeline.closed() {
        pipeline.set_close_state(
            dir.source_ep,
            CloseFrame {
                code: CLOSE_PROTOCOL_ERROR,
                reason: err.to_string(),
            },
        );
    }
    {
        let mut guard = lock_flow(flow);
        guard.error.set_proxy_error(err);
        cxt.interceptors
            .run_websocket(WebSocketEvent::Error, &mut **guard, pipeline);
    }
    finish_with_close(dir, pipeline).await;
}

async fn io_failure(
    dir: &mut WsDirection,
    pipeline: &WebSocketPipeline,
    flow: &Mutex<&mut ConnectionFlow>,
    cxt: &ServerContext,
    os: Option<&std::io::Error>,
    eof: bool,
) {
    let reason = os.map(|e| e.to_string()).unwrap_or_else(|| "eof".to_string());
    if !pipeline.closed() {
        pipeline.set_close_state(
            dir.source_ep,
            CloseFrame {
                code: CLOSE_INTERNAL_ERROR,
                reason: reason.clone(),
            },
        );
    }
    {
        let mut guard = lock_flow(flow);
        if let Some(os) = os {
            guard
                .error
                .set_os_error(std::io::Error::new(os.kind(), os.to_string()));
        }
        cxt.interceptors
            .run_websocket(WebSocketEvent::Error, &mut **guard, pipeline);
    }

    if eof {
        dir.dest.shutdown().await;
    } else {
        finish_with_close(dir, pipeline).await;
    }
}
