//! Byte range views handed across the body-source boundary.

/// Read-only view over a byte range.
#[derive(Debug, Clone, Copy)]
pub struct Buffer<'a> {
    data: &'a [u8],
}

impl<'a> Buffer<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    #[must_use]
    pub fn as_slice(&self) -> &'a [u8] {
        self.data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Fixed-capacity writable view that tracks how much of it is filled.
///
/// Writers never exceed [`MutableBuffer::write_remaining`]; a write into a
/// full buffer is a zero-length write, not an error.
#[derive(Debug)]
pub struct MutableBuffer<'a> {
    data: &'a mut [u8],
    filled: usize,
}

impl<'a> MutableBuffer<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data, filled: 0 }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.filled
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.filled == self.data.len()
    }

    #[must_use]
    pub fn write_remaining(&self) -> usize {
        self.data.len() - self.filled
    }

    /// Copies up to `length` bytes of `src` starting at `offset`, bounded by
    /// the remaining capacity. Returns the number of bytes written.
    pub fn write(&mut self, src: &[u8], offset: usize, length: usize) -> usize {
        if offset >= src.len() {
            return 0;
        }

        let available = (src.len() - offset).min(length);
        let count = available.min(self.write_remaining());
        self.data[self.filled..self.filled + count].copy_from_slice(&src[offset..offset + count]);
        self.filled += count;
        count
    }

    /// The unfilled tail, for sources that read straight into the buffer.
    /// Pair with [`MutableBuffer::advance`].
    pub fn unfilled_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.filled..]
    }

    /// Marks `count` more bytes as filled, clamped to the capacity.
    pub fn advance(&mut self, count: usize) {
        self.filled = (self.filled + count).min(self.data.len());
    }

    #[must_use]
    pub fn filled(&self) -> &[u8] {
        &self.data[..self.filled]
    }

    pub fn as_buffer(&self) -> Buffer<'_> {
        Buffer::new(self.filled())
    }

    pub fn clear(&mut self) {
        self.filled = 0;
    }
}
