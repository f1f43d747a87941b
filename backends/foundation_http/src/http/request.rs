use std::str::FromStr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::errors::ConfigError;

use super::body::{ByteArrayBodyStream, HttpRequestBodyStream};
use super::headers::{Headers, HeadersBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
    Trace,
}

impl Method {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
            Self::Trace => "TRACE",
        }
    }
}

impl core::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Method {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "HEAD" => Ok(Self::Head),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            "OPTIONS" => Ok(Self::Options),
            "TRACE" => Ok(Self::Trace),
            _ => Err(ConfigError::InvalidRequest(format!("unsupported method {s}"))),
        }
    }
}

/// Shared handle to a body source; the engine locks it while pulling.
pub type SharedBodyStream = Arc<Mutex<Box<dyn HttpRequestBodyStream>>>;

/// An immutable HTTP request: method, encoded path, headers and an optional
/// pull body.
///
/// Cloning shares the body source, so a clone sent after the original
/// continues from wherever the body was left; rewind it with
/// [`HttpRequestBodyStream::reset_position`] first.
#[derive(Clone)]
pub struct Request {
    method: Method,
    path: String,
    headers: Headers,
    body: Option<SharedBodyStream>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("headers", &self.headers)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

impl Request {
    pub fn builder(method: Method, path: impl Into<String>) -> RequestBuilder {
        RequestBuilder {
            method,
            path: path.into(),
            headers: HeadersBuilder::default(),
            body: None,
            chunked: false,
        }
    }

    pub fn get(path: impl Into<String>) -> RequestBuilder {
        Self::builder(Method::Get, path)
    }

    pub fn head(path: impl Into<String>) -> RequestBuilder {
        Self::builder(Method::Head, path)
    }

    pub fn post(path: impl Into<String>) -> RequestBuilder {
        Self::builder(Method::Post, path)
    }

    pub fn put(path: impl Into<String>) -> RequestBuilder {
        Self::builder(Method::Put, path)
    }

    pub fn patch(path: impl Into<String>) -> RequestBuilder {
        Self::builder(Method::Patch, path)
    }

    pub fn delete(path: impl Into<String>) -> RequestBuilder {
        Self::builder(Method::Delete, path)
    }

    #[must_use]
    pub fn method(&self) -> Method {
        self.method
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    #[must_use]
    pub fn body(&self) -> Option<&SharedBodyStream> {
        self.body.as_ref()
    }

    /// True when the body goes out with `Transfer-Encoding: chunked`.
    #[must_use]
    pub fn is_chunked(&self) -> bool {
        self.headers.has_token("transfer-encoding", "chunked")
    }

    /// True for chunked requests without a pull body; their chunks are
    /// supplied through `HttpStream::write_chunk`.
    #[must_use]
    pub fn expects_chunk_writes(&self) -> bool {
        self.body.is_none() && self.is_chunked()
    }
}

pub struct RequestBuilder {
    method: Method,
    path: String,
    headers: HeadersBuilder,
    body: Option<Box<dyn HttpRequestBodyStream>>,
    chunked: bool,
}

impl std::fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBuilder")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("headers", &self.headers)
            .field("has_body", &self.body.is_some())
            .field("chunked", &self.chunked)
            .finish()
    }
}

impl RequestBuilder {
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(name, value);
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl HttpRequestBodyStream + 'static) -> Self {
        self.body = Some(Box::new(body));
        self
    }

    /// In-memory body, sent with `Content-Length`.
    #[must_use]
    pub fn body_bytes(self, data: impl Into<Bytes>) -> Self {
        self.body(ByteArrayBodyStream::new(data))
    }

    /// Sends the body with chunked framing. Without a pull body, chunks are
    /// written through `HttpStream::write_chunk`.
    #[must_use]
    pub fn chunked(mut self) -> Self {
        self.chunked = true;
        self
    }

    /// # Errors
    ///
    /// [`ConfigError::InvalidRequest`] for a malformed path or conflicting
    /// framing, [`ConfigError::InvalidHeader`] for invalid headers.
    pub fn build(mut self) -> Result<Request, ConfigError> {
        let path_ok = self.path == "*" || self.path.starts_with('/');
        if !path_ok || self.path.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
            return Err(ConfigError::InvalidRequest(format!(
                "request path must be an encoded origin-form path: {:?}",
                self.path
            )));
        }

        let declared_length = self.headers.contains("content-length");
        if self.chunked && declared_length {
            return Err(ConfigError::InvalidRequest(
                "chunked requests must not declare Content-Length".into(),
            ));
        }

        if self.chunked && !self.headers.contains("transfer-encoding") {
            self.headers.push("Transfer-Encoding", "chunked");
        }
        if !self.chunked && !declared_length {
            if let Some(length) = self.body.as_ref().and_then(|body| body.length()) {
                self.headers.push("Content-Length", length.to_string());
            }
        }

        Ok(Request {
            method: self.method,
            path: self.path,
            headers: self.headers.build()?,
            body: self.body.map(|body| Arc::new(Mutex::new(body))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_with_content_length_for_sized_bodies() {
        let request = Request::put("/objects/1")
            .header("X-Trace", "1")
            .body_bytes(b"abc".to_vec())
            .build()
            .expect("request");

        assert_eq!(request.method(), Method::Put);
        assert_eq!(request.headers().get("content-length"), Some("3"));
        assert!(!request.is_chunked());
        assert!(request.body().is_some());
    }

    #[test]
    fn chunked_without_body_expects_chunk_writes() {
        let request = Request::post("/upload").chunked().build().expect("request");
        assert!(request.is_chunked());
        assert!(request.expects_chunk_writes());
        assert!(!request.headers().contains("content-length"));
    }

    #[test]
    fn rejects_bad_paths_and_conflicting_framing() {
        assert!(Request::get("no-slash").build().is_err());
        assert!(Request::get("/with space").build().is_err());
        assert!(Request::post("/x")
            .header("Content-Length", "3")
            .chunked()
            .build()
            .is_err());
        assert!(Request::get("/")
            .header("Bad Header", "v")
            .build()
            .is_err());
    }

    #[test]
    fn methods_parse_case_insensitively() {
        assert_eq!("patch".parse::<Method>().ok(), Some(Method::Patch));
        assert!("BREW".parse::<Method>().is_err());
        assert_eq!(Method::Delete.to_string(), "DELETE");
    }
}
