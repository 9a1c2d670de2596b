use crate::error::ProxyError;
use crate::http1::message::{HttpRequest, HttpResponse};

/// One request paired with its eventual response. Interceptors may set the
/// response early to short-circuit the upstream round trip, and may mask a
/// CONNECT so it is treated as a normal request with no tunnel established.
#[derive(Debug, Default)]
pub struct HttpExchange {
    request: HttpRequest,
    response: Option<HttpResponse>,
    mask_connect: bool,
}

impl HttpExchange {
    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut HttpRequest {
        &mut self.request
    }

    pub fn has_response(&self) -> bool {
        self.response.is_some()
    }

    pub fn response(&self) -> Result<&HttpResponse, ProxyError> {
        self.response.as_ref().ok_or(ProxyError::NoResponse)
    }

    pub fn response_mut(&mut self) -> Result<&mut HttpResponse, ProxyError> {
        self.response.as_mut().ok_or(ProxyError::NoResponse)
    }

    pub fn set_response(&mut self, response: HttpResponse) {
        self.response = Some(response);
    }

    /// Response slot, created with defaults if empty.
    pub fn make_response(&mut self) -> &mut HttpResponse {
        self.response.get_or_insert_with(HttpResponse::default)
    }

    pub fn mask_connect(&self) -> bool {
        self.mask_connect
    }

    pub fn set_mask_connect(&mut self, mask: bool) {
        self.mask_connect = mask;
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_access_requires_one_set() {
        let mut exchange = HttpExchange::default();
        assert_eq!(exchange.response().unwrap_err(), ProxyError::NoResponse);

        exchange.set_response(HttpResponse::default());
        assert!(exchange.has_response());
        assert!(exchange.response().is_ok());
    }

    #[test]
    fn make_response_is_idempotent() {
        let mut exchange = HttpExchange::default();
        exchange.make_response().status = crate::http1::message::Status::BAD_GATEWAY;
        assert_eq!(
            exchange.response().unwrap().status,
            crate::http1::message::Status::BAD_GATEWAY
        );
        exchange.make_response();
        assert_eq!(
            exchange.response().unwrap().status,
            crate::http1::message::Status::BAD_GATEWAY
        );
    }
}
