//! Inbound chunk queue.

use std::collections::VecDeque;

use bytes::Bytes;

/// One unit of inbound data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadChunk {
    /// Bytes received from the peer.
    Data(Bytes),
    /// End of stream. Nothing follows it.
    End,
}

impl ReadChunk {
    /// Payload length (zero for the end marker).
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Data(bytes) => bytes.len(),
            Self::End => 0,
        }
    }

    /// Whether this chunk carries no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// FIFO of chunks that arrived before a consumer was ready for them.
#[derive(Debug, Default)]
pub struct ConnectionQueue {
    chunks: VecDeque<ReadChunk>,
}

impl ConnectionQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk.
    pub fn push(&mut self, chunk: ReadChunk) {
        self.chunks.push_back(chunk);
    }

    /// The oldest chunk, without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<&ReadChunk> {
        self.chunks.front()
    }

    /// Remove and return the oldest chunk.
    pub fn shift(&mut self) -> Option<ReadChunk> {
        self.chunks.pop_front()
    }

    /// Whether the queue holds no chunks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Number of queued chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut queue = ConnectionQueue::new();
        queue.push(ReadChunk::Data(Bytes::from_static(b"a")));
        queue.push(ReadChunk::Data(Bytes::from_static(b"bc")));
        queue.push(ReadChunk::End);
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.peek(), Some(&ReadChunk::Data(Bytes::from_static(b"a"))));
        assert_eq!(queue.shift(), Some(ReadChunk::Data(Bytes::from_static(b"a"))));
        assert_eq!(queue.shift(), Some(ReadChunk::Data(Bytes::from_static(b"bc"))));
        assert_eq!(queue.shift(), Some(ReadChunk::End));
        assert!(queue.is_empty());
        assert_eq!(queue.shift(), None);
    }

    #[test]
    fn test_interleaved_push_shift() {
        let mut queue = ConnectionQueue::new();
        queue.push(ReadChunk::Data(Bytes::from_static(b"1")));
        queue.push(ReadChunk::Data(Bytes::from_static(b"2")));
        assert_eq!(queue.shift().map(|c| c.len()), Some(1));
        queue.push(ReadChunk::Data(Bytes::from_static(b"33")));
        assert_eq!(queue.shift(), Some(ReadChunk::Data(Bytes::from_static(b"2"))));
        assert_eq!(queue.shift(), Some(ReadChunk::Data(Bytes::from_static(b"33"))));
        assert!(queue.peek().is_none());
    }

    #[test]
    fn test_end_marker_is_empty() {
        assert!(ReadChunk::End.is_empty());
        assert!(!ReadChunk::Data(Bytes::from_static(b"x")).is_empty());
    }
}
