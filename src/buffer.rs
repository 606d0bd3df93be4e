// Resizable byte buffer with independent read and write cursors
//
// Backs the incremental protocol parsers. Appending past the writable tail
// compacts unread data to the front before growing. Integer helpers use
// network byte order. The buffer is not synchronized; its owner serializes
// access.

/// Initial capacity of a fresh buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Two-cursor byte container: `[.. read_index .. write_index .. capacity]`.
/// Bytes between the cursors are readable; bytes past the write cursor are
/// writable.
#[derive(Debug)]
pub struct ByteBuffer {
    storage: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: vec![0; capacity],
            read_index: 0,
            write_index: 0,
        }
    }

    /// Number of unread bytes.
    pub fn readable_bytes(&self) -> usize {
        self.write_index - self.read_index
    }

    /// Room left past the write cursor.
    pub fn writable_bytes(&self) -> usize {
        self.storage.len() - self.write_index
    }

    pub fn is_empty(&self) -> bool {
        self.readable_bytes() == 0
    }

    /// Append bytes, compacting and growing as needed.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.storage[self.write_index..self.write_index + data.len()].copy_from_slice(data);
        self.write_index += data.len();
    }

    /// Append a big-endian i32.
    pub fn append_i32(&mut self, value: i32) {
        self.append(&value.to_be_bytes());
    }

    /// Append a big-endian u32.
    pub fn append_u32(&mut self, value: u32) {
        self.append(&value.to_be_bytes());
    }

    /// View the next `n` unread bytes without advancing, or `None` if fewer
    /// are available.
    pub fn peek(&self, n: usize) -> Option<&[u8]> {
        if self.readable_bytes() < n {
            return None;
        }
        Some(&self.storage[self.read_index..self.read_index + n])
    }

    /// View all unread bytes.
    pub fn peek_all(&self) -> &[u8] {
        &self.storage[self.read_index..self.write_index]
    }

    /// Read a big-endian i32 without advancing.
    pub fn peek_i32(&self) -> Option<i32> {
        self.peek(4)
            .map(|b| i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a big-endian u32 without advancing.
    pub fn peek_u32(&self) -> Option<u32> {
        self.peek(4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a big-endian u16 without advancing.
    pub fn peek_u16(&self) -> Option<u16> {
        self.peek(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    /// Consume and return the next `n` bytes, or `None` if fewer are
    /// available.
    pub fn read(&mut self, n: usize) -> Option<Vec<u8>> {
        if self.readable_bytes() < n {
            return None;
        }
        let out = self.storage[self.read_index..self.read_index + n].to_vec();
        self.retrieve(n);
        Some(out)
    }

    /// Consume and return a big-endian i32.
    pub fn read_i32(&mut self) -> Option<i32> {
        let value = self.peek_i32()?;
        self.retrieve(4);
        Some(value)
    }

    /// Consume and return a big-endian u32.
    pub fn read_u32(&mut self) -> Option<u32> {
        let value = self.peek_u32()?;
        self.retrieve(4);
        Some(value)
    }

    /// Discard up to `n` unread bytes. Discarding everything resets both
    /// cursors to the front.
    pub fn retrieve(&mut self, n: usize) {
        debug_assert!(n <= self.readable_bytes());
        if n < self.readable_bytes() {
            self.read_index += n;
        } else {
            self.retrieve_all();
        }
    }

    /// Discard all unread bytes and reset both cursors.
    pub fn retrieve_all(&mut self) {
        self.read_index = 0;
        self.write_index = 0;
    }

    fn ensure_writable(&mut self, n: usize) {
        if n <= self.writable_bytes() {
            return;
        }
        // Compact unread data to the front, then grow if still short.
        let readable = self.readable_bytes();
        self.storage.copy_within(self.read_index..self.write_index, 0);
        self.read_index = 0;
        self.write_index = readable;
        if n > self.writable_bytes() {
            self.storage.resize(readable + n, 0);
        }
    }
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}
