//! Growable read buffer with a configurable upper bound.
//!
//! The buffer is retained and reused across requests and reconnects so the
//! steady state performs no allocation. Consuming rotates the remaining
//! committed bytes to the front.

use crate::error::{Error, Result};

const APPEND_SIZE: usize = 4096;

#[derive(Debug)]
pub(crate) struct ReadBuffer {
    data: Vec<u8>,
    committed: usize,
    max_size: usize,
}

impl Default for ReadBuffer {
    fn default() -> Self {
        ReadBuffer {
            data: Vec::new(),
            committed: 0,
            max_size: usize::MAX,
        }
    }
}

impl ReadBuffer {
    /// Makes room for the next network read.
    ///
    /// Fails without side effects when growing would exceed the configured
    /// maximum.
    pub fn prepare(&mut self) -> Result<()> {
        let target = self
            .committed
            .checked_add(APPEND_SIZE)
            .ok_or(Error::ExceedsMaximumReadBufferSize)?;
        if target > self.max_size {
            return Err(Error::ExceedsMaximumReadBufferSize);
        }
        if self.data.len() < target {
            self.data.resize(target, 0);
        }
        Ok(())
    }

    /// Writable region for the next read. Only valid after
    /// [`prepare`](Self::prepare).
    pub fn writable(&mut self) -> &mut [u8] {
        &mut self.data[self.committed..]
    }

    /// Marks `n` received bytes as committed.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.committed + n <= self.data.len());
        self.committed += n;
    }

    /// The committed, not yet consumed bytes.
    pub fn committed(&self) -> &[u8] {
        &self.data[..self.committed]
    }

    /// Drops `n` committed bytes from the front, rotating the remainder.
    /// Returns how many bytes were actually consumed.
    pub fn consume(&mut self, n: usize) -> usize {
        let n = n.min(self.committed);
        self.data.copy_within(n..self.committed, 0);
        self.committed -= n;
        n
    }

    pub fn reserve(&mut self, additional: usize) {
        self.data.reserve(additional);
    }

    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
    }

    pub fn clear(&mut self) {
        self.committed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_commit_consume() {
        let mut buf = ReadBuffer::default();
        buf.prepare().unwrap();
        let writable = buf.writable();
        writable[..5].copy_from_slice(b"hello");
        buf.commit(5);
        assert_eq!(buf.committed(), b"hello");

        assert_eq!(buf.consume(2), 2);
        assert_eq!(buf.committed(), b"llo");

        // Consuming more than committed is clamped.
        assert_eq!(buf.consume(10), 3);
        assert!(buf.committed().is_empty());
    }

    #[test]
    fn prepare_fails_past_max_size() {
        let mut buf = ReadBuffer::default();
        buf.set_max_size(APPEND_SIZE - 1);
        assert!(matches!(
            buf.prepare(),
            Err(Error::ExceedsMaximumReadBufferSize)
        ));

        // A failed prepare has no side effects.
        assert!(buf.committed().is_empty());

        buf.set_max_size(APPEND_SIZE);
        buf.prepare().unwrap();
        buf.commit(APPEND_SIZE);
        assert!(matches!(
            buf.prepare(),
            Err(Error::ExceedsMaximumReadBufferSize)
        ));
    }

    #[test]
    fn clear_keeps_allocation() {
        let mut buf = ReadBuffer::default();
        buf.prepare().unwrap();
        buf.commit(10);
        let capacity = buf.data.capacity();
        buf.clear();
        assert!(buf.committed().is_empty());
        assert_eq!(buf.data.capacity(), capacity);
    }
}
