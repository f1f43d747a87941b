//! HTTP/1.1 request encoding and incremental response decoding.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use memchr::memmem;

use crate::errors::ErrorCode;
use crate::http::{HeaderBlock, Headers, HttpHeader, Method, Request};

const MAX_HEAD_BYTES: usize = 64 * 1024;
const CRLF: &[u8] = b"\r\n";
const HEAD_END: &[u8] = b"\r\n\r\n";
pub(crate) const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// How a request body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    None,
    /// Raw bytes; the caller declared `Content-Length`.
    Length,
    Chunked,
}

/// Picks the framing for `request`, returning any header the encoder must
/// add so the framing is announced.
pub(crate) fn request_framing(request: &Request) -> (BodyFraming, Option<(&'static str, String)>) {
    let headers = request.headers();
    if headers.has_token("transfer-encoding", "chunked") {
        return (BodyFraming::Chunked, None);
    }
    if headers.contains("content-length") {
        return (BodyFraming::Length, None);
    }

    match request.body() {
        Some(body) => {
            let length = crate::synca::lock_or_recover(body).length();
            match length {
                Some(len) => (BodyFraming::Length, Some(("Content-Length", len.to_string()))),
                None => (
                    BodyFraming::Chunked,
                    Some(("Transfer-Encoding", "chunked".to_string())),
                ),
            }
        }
        None if matches!(request.method(), Method::Post | Method::Put | Method::Patch) => {
            (BodyFraming::None, Some(("Content-Length", "0".to_string())))
        }
        None => (BodyFraming::None, None),
    }
}

/// Writes the request line and headers.
///
/// `target` is the request target as it goes on the wire: origin form for
/// direct connections, absolute form when forwarding through a proxy.
pub(crate) fn encode_head(
    request: &Request,
    target: &str,
    authority: &str,
    extra: &[(&str, String)],
    out: &mut BytesMut,
) {
    out.put_slice(request.method().as_str().as_bytes());
    out.put_u8(b' ');
    out.put_slice(target.as_bytes());
    out.put_slice(b" HTTP/1.1\r\n");

    if !request.headers().contains("host") {
        put_header(out, "Host", authority);
    }
    for header in request.headers() {
        put_header(out, header.name(), header.value());
    }
    for (name, value) in extra {
        put_header(out, name, value);
    }
    out.put_slice(CRLF);
}

fn put_header(out: &mut BytesMut, name: &str, value: &str) {
    out.put_slice(name.as_bytes());
    out.put_slice(b": ");
    out.put_slice(value.as_bytes());
    out.put_slice(CRLF);
}

/// Frames `data` as one chunk. Empty input writes nothing because a zero
/// sized chunk would terminate the body.
pub(crate) fn encode_chunk(data: &[u8], out: &mut BytesMut) {
    if data.is_empty() {
        return;
    }
    out.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
    out.put_slice(data);
    out.put_slice(CRLF);
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum DecodeError {
    #[error("malformed status line: {0}")]
    StatusLine(String),

    #[error("malformed header line: {0}")]
    HeaderLine(String),

    #[error("invalid content-length: {0}")]
    ContentLength(String),

    #[error("invalid chunk size line: {0}")]
    ChunkSize(String),

    #[error("response head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("protocol upgrades are not supported")]
    Upgrade,

    #[error("connection closed before the response completed")]
    UnexpectedEof,
}

impl DecodeError {
    pub(crate) fn code(&self) -> ErrorCode {
        match self {
            Self::UnexpectedEof => ErrorCode::SOCKET_CLOSED,
            _ => ErrorCode::PROTOCOL_ERROR,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DecodeEvent {
    NeedMore,
    Head {
        block: HeaderBlock,
        status: u16,
        headers: Headers,
    },
    Body(Bytes),
    Trailers(Headers),
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Length(u64),
    UntilClose,
    ChunkSize,
    ChunkData(u64),
    ChunkDataEnd,
    Trailers,
    Complete,
    Finished,
}

/// Incremental decoder for one response.
#[derive(Debug)]
pub(crate) struct ResponseDecoder {
    state: State,
    head_request: bool,
    keep_alive: bool,
}

impl ResponseDecoder {
    pub(crate) fn new(head_request: bool) -> Self {
        Self {
            state: State::Head,
            head_request,
            keep_alive: true,
        }
    }

    /// Whether the connection may carry another exchange once this response
    /// completes.
    pub(crate) fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    /// Consumes what it can from `buf` and reports the next event.
    pub(crate) fn decode(&mut self, buf: &mut BytesMut) -> Result<DecodeEvent, DecodeError> {
        match self.state {
            State::Head => self.decode_head(buf),
            State::Length(remaining) => {
                if buf.is_empty() {
                    return Ok(DecodeEvent::NeedMore);
                }
                let take = usize::try_from(remaining).unwrap_or(usize::MAX).min(buf.len());
                let data = buf.split_to(take).freeze();
                let left = remaining - take as u64;
                self.state = if left == 0 { State::Complete } else { State::Length(left) };
                Ok(DecodeEvent::Body(data))
            }
            State::UntilClose => {
                if buf.is_empty() {
                    return Ok(DecodeEvent::NeedMore);
                }
                Ok(DecodeEvent::Body(buf.split().freeze()))
            }
            State::ChunkSize => {
                let Some(end) = memmem::find(buf, CRLF) else {
                    return Ok(DecodeEvent::NeedMore);
                };
                let line = String::from_utf8_lossy(&buf[..end]).to_string();
                buf.advance(end + CRLF.len());

                let digits = line.split(';').next().unwrap_or_default().trim();
                let size = u64::from_str_radix(digits, 16)
                    .map_err(|_| DecodeError::ChunkSize(line.clone()))?;
                self.state = if size == 0 { State::Trailers } else { State::ChunkData(size) };
                self.decode(buf)
            }
            State::ChunkData(remaining) => {
                if buf.is_empty() {
                    return Ok(DecodeEvent::NeedMore);
                }
                let take = usize::try_from(remaining).unwrap_or(usize::MAX).min(buf.len());
                let data = buf.split_to(take).freeze();
                let left = remaining - take as u64;
                self.state = if left == 0 { State::ChunkDataEnd } else { State::ChunkData(left) };
                Ok(DecodeEvent::Body(data))
            }
            State::ChunkDataEnd => {
                if buf.len() < CRLF.len() {
                    return Ok(DecodeEvent::NeedMore);
                }
                if &buf[..CRLF.len()] != CRLF {
                    return Err(DecodeError::ChunkSize("missing CRLF after chunk data".into()));
                }
                buf.advance(CRLF.len());
                self.state = State::ChunkSize;
                self.decode(buf)
            }
            State::Trailers => {
                if buf.starts_with(CRLF) {
                    buf.advance(CRLF.len());
                    self.state = State::Complete;
                    return self.decode(buf);
                }
                let Some(end) = memmem::find(buf, HEAD_END) else {
                    if buf.len() > MAX_HEAD_BYTES {
                        return Err(DecodeError::HeadTooLarge(MAX_HEAD_BYTES));
                    }
                    return Ok(DecodeEvent::NeedMore);
                };
                let block = buf.split_to(end + HEAD_END.len());
                let text = String::from_utf8_lossy(&block[..end]).to_string();
                let trailers = parse_header_lines(text.split("\r\n"))?;
                self.state = State::Complete;
                Ok(DecodeEvent::Trailers(trailers))
            }
            State::Complete => {
                self.state = State::Finished;
                Ok(DecodeEvent::Complete)
            }
            State::Finished => Ok(DecodeEvent::NeedMore),
        }
    }

    /// Called when the peer closed the connection.
    pub(crate) fn finish_on_eof(&mut self) -> Result<DecodeEvent, DecodeError> {
        self.keep_alive = false;
        match self.state {
            State::UntilClose | State::Complete => {
                self.state = State::Finished;
                Ok(DecodeEvent::Complete)
            }
            _ => Err(DecodeError::UnexpectedEof),
        }
    }

    fn decode_head(&mut self, buf: &mut BytesMut) -> Result<DecodeEvent, DecodeError> {
        let Some(end) = memmem::find(buf, HEAD_END) else {
            if buf.len() > MAX_HEAD_BYTES {
                return Err(DecodeError::HeadTooLarge(MAX_HEAD_BYTES));
            }
            return Ok(DecodeEvent::NeedMore);
        };

        let raw = buf.split_to(end + HEAD_END.len());
        let text = String::from_utf8_lossy(&raw[..end]).to_string();
        let mut lines = text.split("\r\n");

        let status_line = lines.next().unwrap_or_default();
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        let status = parts
            .next()
            .and_then(|code| code.parse::<u16>().ok())
            .filter(|code| (100..=999).contains(code))
            .ok_or_else(|| DecodeError::StatusLine(status_line.to_string()))?;
        if !version.starts_with("HTTP/1.") {
            return Err(DecodeError::StatusLine(status_line.to_string()));
        }

        let headers = parse_header_lines(lines)?;

        if status == 101 {
            return Err(DecodeError::Upgrade);
        }
        if (100..200).contains(&status) {
            return Ok(DecodeEvent::Head {
                block: HeaderBlock::Informational,
                status,
                headers,
            });
        }

        self.keep_alive = if version == "HTTP/1.0" {
            headers.has_token("connection", "keep-alive")
        } else {
            !headers.has_token("connection", "close")
        };

        self.state = if self.head_request || status == 204 || status == 304 {
            State::Complete
        } else if headers.has_token("transfer-encoding", "chunked") {
            State::ChunkSize
        } else if let Some(length) = headers.get("content-length") {
            let length = length
                .trim()
                .parse::<u64>()
                .map_err(|_| DecodeError::ContentLength(length.to_string()))?;
            if length == 0 {
                State::Complete
            } else {
                State::Length(length)
            }
        } else {
            self.keep_alive = false;
            State::UntilClose
        };

        Ok(DecodeEvent::Head {
            block: HeaderBlock::Main,
            status,
            headers,
        })
    }
}

fn parse_header_lines<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> Result<Headers, DecodeError> {
    let mut entries = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| DecodeError::HeaderLine(line.to_string()))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(DecodeError::HeaderLine(line.to_string()));
        }
        entries.push(HttpHeader::new(name, value.trim()));
    }
    Ok(Headers::from_entries(entries))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut ResponseDecoder, buf: &mut BytesMut) -> Vec<DecodeEvent> {
        let mut events = Vec::new();
        loop {
            match decoder.decode(buf).expect("decodes") {
                DecodeEvent::NeedMore => return events,
                DecodeEvent::Complete => {
                    events.push(DecodeEvent::Complete);
                    return events;
                }
                event => events.push(event),
            }
        }
    }

    fn body_of(events: &[DecodeEvent]) -> Vec<u8> {
        events
            .iter()
            .filter_map(|e| match e {
                DecodeEvent::Body(b) => Some(b.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn encodes_head_with_host_and_framing() {
        let request = Request::post("/upload")
            .header("X-Trace", "abc")
            .body_bytes(b"hello".to_vec())
            .build()
            .expect("request");

        let (framing, extra) = request_framing(&request);
        assert_eq!(framing, BodyFraming::Length);

        let mut out = BytesMut::new();
        encode_head(&request, "/upload", "example.test:8080", &[], &mut out);
        let text = String::from_utf8(out.to_vec()).expect("utf8");

        assert!(extra.is_none());
        assert!(text.starts_with("POST /upload HTTP/1.1\r\nHost: example.test:8080\r\n"));
        assert!(text.contains("X-Trace: abc\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn chunk_encoding_skips_empty_chunks() {
        let mut out = BytesMut::new();
        encode_chunk(b"", &mut out);
        encode_chunk(b"0123456789abcdef!", &mut out);
        assert_eq!(&out[..], b"11\r\n0123456789abcdef!\r\n");
    }

    #[test]
    fn decodes_content_length_response_split_across_reads() {
        let mut decoder = ResponseDecoder::new(false);
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Len"[..]);
        assert_eq!(decoder.decode(&mut buf), Ok(DecodeEvent::NeedMore));

        buf.extend_from_slice(b"gth: 5\r\n\r\nhel");
        let mut events = drain(&mut decoder, &mut buf);
        buf.extend_from_slice(b"lo");
        events.extend(drain(&mut decoder, &mut buf));

        assert!(matches!(
            &events[0],
            DecodeEvent::Head { block: HeaderBlock::Main, status: 200, .. }
        ));
        assert_eq!(body_of(&events), b"hello");
        assert_eq!(events.last(), Some(&DecodeEvent::Complete));
        assert!(decoder.keep_alive());
    }

    #[test]
    fn decodes_informational_then_chunked_with_trailers() {
        let mut decoder = ResponseDecoder::new(false);
        let mut buf = BytesMut::from(
            &b"HTTP/1.1 100 Continue\r\n\r\n\
               HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
               4;ext=1\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Checksum: 42\r\n\r\n"[..],
        );

        let events = drain(&mut decoder, &mut buf);
        assert!(matches!(
            &events[0],
            DecodeEvent::Head { block: HeaderBlock::Informational, status: 100, .. }
        ));
        assert!(matches!(
            &events[1],
            DecodeEvent::Head { block: HeaderBlock::Main, status: 200, .. }
        ));
        assert_eq!(body_of(&events), b"Wikipedia");

        let trailers = events
            .iter()
            .find_map(|e| match e {
                DecodeEvent::Trailers(t) => Some(t.clone()),
                _ => None,
            })
            .expect("trailers");
        assert_eq!(trailers.get("x-checksum"), Some("42"));
        assert_eq!(events.last(), Some(&DecodeEvent::Complete));
        assert!(buf.is_empty());
    }

    #[test]
    fn head_and_no_content_responses_have_no_body() {
        let mut decoder = ResponseDecoder::new(true);
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n"[..]);
        let events = drain(&mut decoder, &mut buf);
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], DecodeEvent::Complete);

        let mut decoder = ResponseDecoder::new(false);
        let mut buf = BytesMut::from(&b"HTTP/1.1 204 No Content\r\n\r\n"[..]);
        assert_eq!(drain(&mut decoder, &mut buf).len(), 2);
    }

    #[test]
    fn until_close_body_completes_on_eof() {
        let mut decoder = ResponseDecoder::new(false);
        let mut buf = BytesMut::from(&b"HTTP/1.0 200 OK\r\n\r\npartial"[..]);
        let events = drain(&mut decoder, &mut buf);
        assert_eq!(body_of(&events), b"partial");
        assert!(!decoder.keep_alive());
        assert_eq!(decoder.finish_on_eof(), Ok(DecodeEvent::Complete));
    }

    #[test]
    fn early_eof_is_an_error() {
        let mut decoder = ResponseDecoder::new(false);
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc"[..]);
        drain(&mut decoder, &mut buf);
        let err = decoder.finish_on_eof().expect_err("truncated");
        assert_eq!(err.code(), ErrorCode::SOCKET_CLOSED);
    }

    #[test]
    fn connection_close_disables_keep_alive() {
        let mut decoder = ResponseDecoder::new(false);
        let mut buf = BytesMut::from(
            &b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n"[..],
        );
        drain(&mut decoder, &mut buf);
        assert!(!decoder.keep_alive());
    }

    #[test]
    fn malformed_input_is_a_protocol_error() {
        let mut decoder = ResponseDecoder::new(false);
        let mut buf = BytesMut::from(&b"SMTP ready\r\n\r\n"[..]);
        let err = decoder.decode(&mut buf).expect_err("bad status line");
        assert_eq!(err.code(), ErrorCode::PROTOCOL_ERROR);

        let mut decoder = ResponseDecoder::new(false);
        let mut buf =
            BytesMut::from(&b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n"[..]);
        drain_until_error(&mut decoder, &mut buf);
    }

    fn drain_until_error(decoder: &mut ResponseDecoder, buf: &mut BytesMut) {
        loop {
            match decoder.decode(buf) {
                Err(DecodeError::ChunkSize(_)) => return,
                Ok(DecodeEvent::NeedMore | DecodeEvent::Complete) | Err(_) => {
                    panic!("expected a chunk size error")
                }
                Ok(_) => {}
            }
        }
    }
}
