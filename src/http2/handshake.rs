//! Client handshake state and the pre-handshake write buffer
//!
//! Until the server answers the extended CONNECT, outbound WebSocket frames
//! cannot go on the wire: a DATA frame before the response would be
//! rejected. They are parked here with their completion promises and
//! either replayed in order or failed together, exactly once.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::completion::Promise;
use crate::error::Error;

/// Where a channel is in its extended CONNECT exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Waiting for peer SETTINGS that enable extended CONNECT
    AwaitingSettings,
    /// Request HEADERS written, response not yet received
    RequestSent,
    Complete,
    Failed,
}

impl HandshakeState {
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            HandshakeState::AwaitingSettings | HandshakeState::RequestSent
        )
    }
}

/// FIFO of writes issued before the handshake completed
#[derive(Debug, Default)]
pub struct PreHandshakeBuffer {
    frames: VecDeque<(Bytes, Promise)>,
    bytes: usize,
    settled: bool,
}

impl PreHandshakeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a write; hands it back if the buffer was already settled
    pub fn push(&mut self, payload: Bytes, promise: Promise) -> Result<(), (Bytes, Promise)> {
        if self.settled {
            return Err((payload, promise));
        }
        self.bytes += payload.len();
        self.frames.push_back((payload, promise));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Buffered payload bytes
    pub fn buffered_bytes(&self) -> usize {
        self.bytes
    }

    pub fn is_settled(&self) -> bool {
        self.settled
    }

    /// Handshake succeeded: take every write, in enqueue order, for replay
    ///
    /// Returns `None` if the buffer was already flushed or failed.
    pub fn take_for_flush(&mut self) -> Option<VecDeque<(Bytes, Promise)>> {
        if self.settled {
            return None;
        }
        self.settled = true;
        self.bytes = 0;
        Some(std::mem::take(&mut self.frames))
    }

    /// Handshake failed: fail every buffered promise with `cause`
    ///
    /// Returns the number of writes failed, or `None` if already settled.
    pub fn fail(&mut self, cause: &Error) -> Option<usize> {
        if self.settled {
            return None;
        }
        self.settled = true;
        self.bytes = 0;
        let count = self.frames.len();
        for (payload, promise) in self.frames.drain(..) {
            drop(payload);
            promise.fail(cause.clone());
        }
        Some(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::Completion;

    #[test]
    fn test_flush_preserves_order() {
        let mut buffer = PreHandshakeBuffer::new();
        let mut completions = Vec::new();
        for payload in ["a", "bb", "ccc"] {
            let (promise, completion) = Completion::pair();
            buffer.push(Bytes::from(payload), promise).unwrap();
            completions.push(completion);
        }
        assert_eq!(buffer.buffered_bytes(), 6);

        let frames = buffer.take_for_flush().unwrap();
        let payloads: Vec<_> = frames.iter().map(|(p, _)| p.clone()).collect();
        assert_eq!(payloads, vec!["a", "bb", "ccc"]);

        // Exactly once: neither a second flush nor a fail is possible
        assert!(buffer.take_for_flush().is_none());
        assert!(buffer.fail(&Error::ChannelClosed).is_none());
        assert!(buffer.is_settled());
    }

    #[test]
    fn test_fail_all() {
        let mut buffer = PreHandshakeBuffer::new();
        let (p1, mut c1) = Completion::pair();
        let (p2, mut c2) = Completion::pair();
        buffer.push(Bytes::from_static(b"x"), p1).unwrap();
        buffer.push(Bytes::from_static(b"y"), p2).unwrap();

        let cause = Error::Handshake("unexpected response status 404".into());
        assert_eq!(buffer.fail(&cause), Some(2));
        assert_eq!(c1.try_result(), Some(Err(cause.clone())));
        assert_eq!(c2.try_result(), Some(Err(cause)));

        assert!(buffer.take_for_flush().is_none());
        let (p3, _c3) = Completion::pair();
        assert!(buffer.push(Bytes::new(), p3).is_err());
    }

    #[test]
    fn test_pending_states() {
        assert!(HandshakeState::AwaitingSettings.is_pending());
        assert!(HandshakeState::RequestSent.is_pending());
        assert!(!HandshakeState::Complete.is_pending());
        assert!(!HandshakeState::Failed.is_pending());
    }
}
