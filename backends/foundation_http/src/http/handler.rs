use crate::errors::ErrorCode;
use crate::synca::{self, Completer, Completion};

use super::headers::Headers;
use super::stream::HttpStreamRef;

/// Which header block a headers callback belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderBlock {
    /// A `1xx` interim response; there may be several before the main one.
    Informational,
    Main,
    /// Trailers following a chunked body.
    Trailing,
}

/// Response side of the stream callback protocol.
///
/// Every method runs on an engine event loop thread, never on the thread
/// that activated the stream. The order per stream is headers, body, then
/// exactly one `on_response_complete`; nothing is called after it.
pub trait HttpResponseHandler: Send + 'static {
    fn on_response_headers(
        &mut self,
        _stream: &HttpStreamRef,
        _status: u16,
        _block: HeaderBlock,
        _headers: &Headers,
    ) {
    }

    /// Once for every header block after its headers were delivered.
    fn on_response_headers_done(&mut self, _stream: &HttpStreamRef, _block: HeaderBlock) {}

    /// Returns the number of bytes to widen the flow-control window by.
    ///
    /// Returning `data.len()` keeps the window at its current size; returning
    /// less narrows it, and once it reaches zero delivery pauses until
    /// `HttpStream::increment_window` is called. Ignored unless the manager
    /// uses manual window management.
    fn on_response_body(&mut self, _stream: &HttpStreamRef, data: &[u8]) -> u64 {
        data.len() as u64
    }

    /// Terminal callback; `code` is [`ErrorCode::SUCCESS`] for a complete
    /// response.
    fn on_response_complete(&mut self, stream: &HttpStreamRef, code: ErrorCode);
}

/// Everything a [`CollectingHandler`] saw.
#[derive(Debug, Clone)]
pub struct CollectedResponse {
    pub error_code: ErrorCode,
    pub status: u16,
    pub headers: Headers,
    pub informational: Vec<(u16, Headers)>,
    pub trailers: Headers,
    pub body: Vec<u8>,
}

impl CollectedResponse {
    fn empty() -> Self {
        Self {
            error_code: ErrorCode::SUCCESS,
            status: 0,
            headers: Headers::default(),
            informational: Vec::new(),
            trailers: Headers::default(),
            body: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error_code.is_success()
    }

    #[must_use]
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Buffers the whole response and hands it over through a [`Completion`]
/// when the exchange ends.
#[derive(Debug)]
pub struct CollectingHandler {
    response: CollectedResponse,
    done: Option<Completer<CollectedResponse>>,
}

impl CollectingHandler {
    #[must_use]
    pub fn new() -> (Self, Completion<CollectedResponse>) {
        let (done, completion) = synca::channel();
        (
            Self {
                response: CollectedResponse::empty(),
                done: Some(done),
            },
            completion,
        )
    }
}

impl HttpResponseHandler for CollectingHandler {
    fn on_response_headers(
        &mut self,
        _stream: &HttpStreamRef,
        status: u16,
        block: HeaderBlock,
        headers: &Headers,
    ) {
        match block {
            HeaderBlock::Informational => self.response.informational.push((status, headers.clone())),
            HeaderBlock::Main => {
                self.response.status = status;
                self.response.headers = headers.clone();
            }
            HeaderBlock::Trailing => self.response.trailers = headers.clone(),
        }
    }

    fn on_response_body(&mut self, _stream: &HttpStreamRef, data: &[u8]) -> u64 {
        self.response.body.extend_from_slice(data);
        data.len() as u64
    }

    fn on_response_complete(&mut self, _stream: &HttpStreamRef, code: ErrorCode) {
        self.response.error_code = code;
        if let Some(done) = self.done.take() {
            let response = std::mem::replace(&mut self.response, CollectedResponse::empty());
            let _ = done.complete(response);
        }
    }
}
