//! Fixed-capacity byte ring
//!
//! Backs each TCP connection's receive buffer. Writes are all-or-nothing:
//! a segment that does not fit in the free space is rejected whole.

use alloc::vec;
use alloc::vec::Vec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    /// Not enough free space for the whole write
    Full,
    /// Nothing to read
    Empty,
}

/// Circular byte buffer with a capacity fixed at construction
#[derive(Debug, Clone)]
pub struct ByteRing {
    buffer: Vec<u8>,
    head: usize,
    count: usize,
}

impl ByteRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0; capacity],
            head: 0,
            count: 0,
        }
    }

    /// Append `data` if it fits entirely
    pub fn push(&mut self, data: &[u8]) -> Result<(), BufferError> {
        if data.len() > self.free() {
            return Err(BufferError::Full);
        }

        let cap = self.capacity();
        let mut tail = (self.head + self.count) % cap.max(1);
        for &byte in data {
            self.buffer[tail] = byte;
            tail = (tail + 1) % cap;
        }
        self.count += data.len();
        Ok(())
    }

    /// Move up to `out.len()` bytes into `out`, returning how many were copied
    pub fn pop(&mut self, out: &mut [u8]) -> Result<usize, BufferError> {
        if self.count == 0 {
            return Err(BufferError::Empty);
        }

        let cap = self.capacity();
        let n = out.len().min(self.count);
        for slot in out.iter_mut().take(n) {
            *slot = self.buffer[self.head];
            self.head = (self.head + 1) % cap;
        }
        self.count -= n;
        Ok(n)
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.capacity()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn free(&self) -> usize {
        self.capacity() - self.count
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }
}
