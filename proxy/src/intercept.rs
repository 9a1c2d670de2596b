use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::connection::ConnectionFlow;
use crate::http1::exchange::HttpExchange;
use crate::tls::store::CertificateIdentity;
use crate::ws::pipeline::{WebSocketMessage, WebSocketPipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpEvent {
    AnyRequest,
    Connect,
    Request,
    WebSocketHandshake,
    Response,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsEvent {
    Established,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelEvent {
    Start,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebSocketEvent {
    Start,
    Error,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebSocketMessageEvent {
    Received,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateEvent {
    Search,
    Create,
}

pub type InterceptorHandle = u64;

pub type HttpCallback = dyn Fn(&mut ConnectionFlow, &mut HttpExchange) + Send + Sync;
pub type FlowCallback = dyn Fn(&mut ConnectionFlow) + Send + Sync;
pub type WsCallback = dyn Fn(&mut ConnectionFlow, &WebSocketPipeline) + Send + Sync;
pub type WsMessageCallback =
    dyn Fn(&mut ConnectionFlow, &WebSocketPipeline, &mut WebSocketMessage) + Send + Sync;
pub type CertificateCallback =
    dyn Fn(&mut ConnectionFlow, &mut CertificateIdentity) + Send + Sync;

/// One event family: a dense slot per event variant mapping numeric handles
/// to callbacks. Attachment returns the handle; detachment takes it.
struct Slots<F: ?Sized> {
    slots: Vec<BTreeMap<InterceptorHandle, Arc<F>>>,
}

impl<F: ?Sized> Slots<F> {
    fn new(variants: usize) -> Self {
        Slots {
            slots: (0..variants).map(|_| BTreeMap::new()).collect(),
        }
    }

    fn attach(&mut self, event: usize, handle: InterceptorHandle, callback: Arc<F>) {
        self.slots[event].insert(handle, callback);
    }

    fn detach(&mut self, handle: InterceptorHandle) -> bool {
        self.slots.iter_mut().any(|slot| slot.remove(&handle).is_some())
    }

    fn callbacks(&self, event: usize) -> impl Iterator<Item = &Arc<F>> {
        self.slots[event].values()
    }
}

/// Event-keyed callback registry. Attach everything before the server
/// starts; dispatch is lock-free reads over the frozen maps.
pub struct InterceptorRegistry {
    next_handle: AtomicU64,
    http: Slots<HttpCallback>,
    tls: Slots<FlowCallback>,
    tunnel: Slots<FlowCallback>,
    websocket: Slots<WsCallback>,
    websocket_message: Slots<WsMessageCallback>,
    certificate: Slots<CertificateCallback>,
}

impl Default for InterceptorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InterceptorRegistry {
    pub fn new() -> Self {
        InterceptorRegistry {
            next_handle: AtomicU64::new(1),
            http: Slots::new(6),
            tls: Slots::new(2),
            tunnel: Slots::new(2),
            websocket: Slots::new(3),
            websocket_message: Slots::new(1),
            certificate: Slots::new(2),
        }
    }

    fn handle(&self) -> InterceptorHandle {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    pub fn attach_http(
        &mut self,
        event: HttpEvent,
        callback: impl Fn(&mut ConnectionFlow, &mut HttpExchange) + Send + Sync + 'static,
    ) -> InterceptorHandle {
        let handle = self.handle();
        self.http.attach(event as usize, handle, Arc::new(callback));
        handle
    }

    pub fn attach_tls(
        &mut self,
        event: TlsEvent,
        callback: impl Fn(&mut ConnectionFlow) + Send + Sync + 'static,
    ) -> InterceptorHandle {
        let handle = self.handle();
        self.tls.attach(event as usize, handle, Arc::new(callback));
        handle
    }

    pub fn attach_tunnel(
        &mut self,
        event: TunnelEvent,
        callback: impl Fn(&mut ConnectionFlow) + Send + Sync + 'static,
    ) -> InterceptorHandle {
        let handle = self.handle();
        self.tunnel.attach(event as usize, handle, Arc::new(callback));
        handle
    }

    pub fn attach_websocket(
        &mut self,
        event: WebSocketEvent,
        callback: impl Fn(&mut ConnectionFlow, &WebSocketPipeline) + Send + Sync + 'static,
    ) -> InterceptorHandle {
        let handle = self.handle();
        self.websocket
            .attach(event as usize, handle, Arc::new(callback));
        handle
    }

    pub fn attach_websocket_message(
        &mut self,
        event: WebSocketMessageEvent,
        callback: impl Fn(&mut ConnectionFlow, &WebSocketPipeline, &mut WebSocketMessage)
        + Send
        + Sync
        + 'static,
    ) -> InterceptorHandle {
        let handle = self.handle();
        self.websocket_message
            .attach(event as usize, handle, Arc::new(callback));
        handle
    }

    pub fn attach_certificate(
        &mut self,
        event: CertificateEvent,
        callback: impl Fn(&mut ConnectionFlow, &mut CertificateIdentity) + Send + Sync + 'static,
    ) -> InterceptorHandle {
        let handle = self.handle();
        self.certificate
            .attach(event as usize, handle, Arc::new(callback));
        handle
    }

    pub fn detach(&mut self, handle: InterceptorHandle) -> bool {
        self.http.detach(handle)
            || self.tls.detach(handle)
            || self.tunnel.detach(handle)
            || self.websocket.detach(handle)
            || self.websocket_message.detach(handle)
            || self.certificate.detach(handle)
    }

    pub fn run_http(&self, event: HttpEvent, flow: &mut ConnectionFlow, exchange: &mut HttpExchange) {
        for callback in self.http.callbacks(event as usize) {
            callback(flow, exchange);
        }
    }

    pub fn run_tls(&self, event: TlsEvent, flow: &mut ConnectionFlow) {
        for callback in self.tls.callbacks(event as usize) {
            callback(flow);
        }
    }

    pub fn run_tunnel(&self, event: TunnelEvent, flow: &mut ConnectionFlow) {
        for callback in self.tunnel.callbacks(event as usize) {
            callback(flow);
        }
    }

    pub fn run_websocket(
        &self,
        event: WebSocketEvent,
        flow: &mut ConnectionFlow,
        pipeline: &WebSocketPipeline,
    ) {
        for callback in self.websocket.callbacks(event as usize) {
            callback(flow, pipeline);
        }
    }

    pub fn run_websocket_message(
        &self,
        event: WebSocketMessageEvent,
        flow: &mut ConnectionFlow,
        pipeline: &WebSocketPipeline,
        message: &mut WebSocketMessage,
    ) {
        for callback in self.websocket_message.callbacks(event as usize) {
            callback(flow, pipeline, message);
        }
    }

    pub fn run_certificate(
        &self,
        event: CertificateEvent,
        flow: &mut ConnectionFlow,
        identity: &mut CertificateIdentity,
    ) {
        for callback in self.certificate.callbacks(event as usize) {
            callback(flow, identity);
        }
    }

    /// Register every event-named method a hub defines; routing goes
    /// through the shared hub object. Returns the handles in attachment
    /// order for later detachment.
    pub fn attach_hub(&mut self, hub: Arc<dyn InterceptorHub>) -> Vec<InterceptorHandle> {
        let mut handles = Vec::new();

        for event in [
            HttpEvent::AnyRequest,
            HttpEvent::Connect,
            HttpEvent::Request,
            HttpEvent::WebSocketHandshake,
            HttpEvent::Response,
            HttpEvent::Error,
        ] {
            let hub = hub.clone();
            handles.push(self.attach_http(event, move |flow, exchange| {
                hub.http(event, flow, exchange)
            }));
        }
        for event in [TlsEvent::Established, TlsEvent::Error] {
            let hub = hub.clone();
            handles.push(self.attach_tls(event, move |flow| hub.tls(event, flow)));
        }
        for event in [TunnelEvent::Start, TunnelEvent::Stop] {
            let hub = hub.clone();
            handles.push(self.attach_tunnel(event, move |flow| hub.tunnel(event, flow)));
        }
        for event in [
            WebSocketEvent::Start,
            WebSocketEvent::Error,
            WebSocketEvent::Stop,
        ] {
            let hub = hub.clone();
            handles.push(self.attach_websocket(event, move |flow, pipeline| {
                hub.websocket(event, flow, pipeline)
            }));
        }
        {
            let hub = hub.clone();
            handles.push(self.attach_websocket_message(
                WebSocketMessageEvent::Received,
                move |flow, pipeline, message| hub.websocket_message(flow, pipeline, message),
            ));
        }
        for event in [CertificateEvent::Search, CertificateEvent::Create] {
            let hub = hub.clone();
            handles.push(self.attach_certificate(event, move |flow, identity| {
                hub.certificate(event, flow, identity)
            }));
        }

        handles
    }
}

impl std::fmt::Debug for InterceptorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorRegistry").finish()
    }
}

/// Convenience trait for attaching one object to every event at once;
/// override only the events of interest.
pub trait InterceptorHub: Send + Sync + 'static {
    fn http(&self, _event: HttpEvent, _flow: &mut ConnectionFlow, _exchange: &mut HttpExchange) {}
    fn tls(&self, _event: TlsEvent, _flow: &mut ConnectionFlow) {}
    fn tunnel(&self, _event: TunnelEvent, _flow: &mut ConnectionFlow) {}
    fn websocket(
        &self,
        _event: WebSocketEvent,
        _flow: &mut ConnectionFlow,
        _pipeline: &WebSocketPipeline,
    ) {
    }
    fn websocket_message(
        &self,
        _flow: &mut ConnectionFlow,
        _pipeline: &WebSocketPipeline,
        _message: &mut WebSocketMessage,
    ) {
    }
    fn certificate(
        &self,
        _event: CertificateEvent,
        _flow: &mut ConnectionFlow,
        _identity: &mut CertificateIdentity,
    ) {
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_flow() -> ConnectionFlow {
        // A flow record without endpoints is enough for dispatch tests.
        let mut flow = ConnectionFlow::new_detached();
        flow.set_target("example.test", 443);
        flow
    }

    #[test]
    fn callbacks_run_in_attachment_order() {
        let mut registry = InterceptorRegistry::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = seen.clone();
            registry.attach_http(HttpEvent::Request, move |_, _| {
                seen.lock().unwrap().push(tag);
            });
        }

        let mut flow = test_flow();
        let mut exchange = HttpExchange::default();
        registry.run_http(HttpEvent::Request, &mut flow, &mut exchange);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn detach_removes_callback() {
        let mut registry = InterceptorRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let handle = registry.attach_tls(TlsEvent::Established, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut flow = test_flow();
        registry.run_tls(TlsEvent::Established, &mut flow);
        assert!(registry.detach(handle));
        registry.run_tls(TlsEvent::Established, &mut flow);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!registry.detach(handle));
    }

    #[test]
    fn events_are_isolated() {
        let mut registry = InterceptorRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        registry.attach_http(HttpEvent::Connect, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut flow = test_flow();
        let mut exchange = HttpExchange::default();
        registry.run_http(HttpEvent::Response, &mut flow, &mut exchange);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        registry.run_http(HttpEvent::Connect, &mut flow, &mut exchange);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    struct CountingHub {
        http_events: AtomicUsize,
    }

    impl InterceptorHub for CountingHub {
        fn http(
            &self,
            _event: HttpEvent,
            _flow: &mut ConnectionFlow,
            _exchange: &mut HttpExchange,
        ) {
            self.http_events.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn hub_attachment_routes_events() {
        let mut registry = InterceptorRegistry::new();
        let hub = Arc::new(CountingHub {
            http_events: AtomicUsize::new(0),
        });
        let handles = registry.attach_hub(hub.clone());
        assert_eq!(handles.len(), 16);

        let mut flow = test_flow();
        let mut exchange = HttpExchange::default();
        registry.run_http(HttpEvent::AnyRequest, &mut flow, &mut exchange);
        registry.run_http(HttpEvent::Response, &mut flow, &mut exchange);
        assert_eq!(hub.http_events.load(Ordering::SeqCst), 2);
    }
}
