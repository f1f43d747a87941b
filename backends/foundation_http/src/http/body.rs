//! Pull-based request body sources.

use std::io::{self, Read, Seek, SeekFrom};

use bytes::Bytes;

use crate::io::MutableBuffer;

/// A request body the engine pulls from while sending.
///
/// `send_request_body` is called repeatedly with a bounded buffer. It writes
/// as many bytes as fit and returns `true` once the whole body was written.
pub trait HttpRequestBodyStream: Send {
    /// # Errors
    ///
    /// Any read error of the underlying source; the exchange then completes
    /// with `BODY_READ_FAILURE`.
    fn send_request_body(&mut self, buffer: &mut MutableBuffer<'_>) -> io::Result<bool>;

    /// Rewinds to the start. Returns false for sources that cannot rewind.
    fn reset_position(&mut self) -> bool {
        false
    }

    /// Total length when known up front. Known lengths are sent with
    /// `Content-Length`, unknown ones with chunked framing.
    fn length(&self) -> Option<u64> {
        None
    }
}

/// Body held entirely in memory.
#[derive(Debug, Clone)]
pub struct ByteArrayBodyStream {
    data: Bytes,
    position: usize,
}

impl ByteArrayBodyStream {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            position: 0,
        }
    }
}

impl HttpRequestBodyStream for ByteArrayBodyStream {
    fn send_request_body(&mut self, buffer: &mut MutableBuffer<'_>) -> io::Result<bool> {
        let remaining = self.data.len() - self.position;
        let written = buffer.write(&self.data, self.position, remaining);
        self.position += written;
        Ok(self.position == self.data.len())
    }

    fn reset_position(&mut self) -> bool {
        self.position = 0;
        true
    }

    fn length(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

fn fill_from(reader: &mut impl Read, buffer: &mut MutableBuffer<'_>) -> io::Result<bool> {
    while !buffer.is_full() {
        match reader.read(buffer.unfilled_mut()) {
            Ok(0) => return Ok(true),
            Ok(n) => buffer.advance(n),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(false)
}

/// Body read from a seekable source such as a file. The body spans from the
/// source's position at construction to its end, and can be rewound.
#[derive(Debug)]
pub struct SeekableBodyStream<R> {
    source: R,
    start: u64,
    length: u64,
    done: bool,
}

impl<R: Read + Seek + Send> SeekableBodyStream<R> {
    /// # Errors
    ///
    /// Seek errors while measuring the source.
    pub fn new(mut source: R) -> io::Result<Self> {
        let start = source.stream_position()?;
        let end = source.seek(SeekFrom::End(0))?;
        source.seek(SeekFrom::Start(start))?;

        Ok(Self {
            source,
            start,
            length: end.saturating_sub(start),
            done: false,
        })
    }

    pub fn into_inner(self) -> R {
        self.source
    }
}

impl<R: Read + Seek + Send> HttpRequestBodyStream for SeekableBodyStream<R> {
    fn send_request_body(&mut self, buffer: &mut MutableBuffer<'_>) -> io::Result<bool> {
        if self.done {
            return Ok(true);
        }
        self.done = fill_from(&mut self.source, buffer)?;
        Ok(self.done)
    }

    fn reset_position(&mut self) -> bool {
        match self.source.seek(SeekFrom::Start(self.start)) {
            Ok(_) => {
                self.done = false;
                true
            }
            Err(err) => {
                warn!("failed to rewind request body: {err}");
                false
            }
        }
    }

    fn length(&self) -> Option<u64> {
        Some(self.length)
    }
}

/// Body read once from a forward-only source. It cannot be rewound.
#[derive(Debug)]
pub struct ReaderBodyStream<R> {
    source: R,
    length: Option<u64>,
    done: bool,
}

impl<R: Read + Send> ReaderBodyStream<R> {
    /// Unknown length; the body goes out with chunked framing.
    pub fn new(source: R) -> Self {
        Self {
            source,
            length: None,
            done: false,
        }
    }

    /// The caller vouches that `source` yields exactly `length` bytes.
    pub fn with_length(source: R, length: u64) -> Self {
        Self {
            source,
            length: Some(length),
            done: false,
        }
    }
}

impl<R: Read + Send> HttpRequestBodyStream for ReaderBodyStream<R> {
    fn send_request_body(&mut self, buffer: &mut MutableBuffer<'_>) -> io::Result<bool> {
        if self.done {
            return Ok(true);
        }
        self.done = fill_from(&mut self.source, buffer)?;
        Ok(self.done)
    }

    fn length(&self) -> Option<u64> {
        self.length
    }
}
