//! One-way, best-effort transport of captured buffers
//!
//! Hooks push into a bounded queue with `try_send` and never wait. Whatever
//! cannot be queued is dropped and counted. A forwarder drains the queue to
//! the controller; see [`transport`].

pub mod frame;
pub mod transport;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

/// Direction of a captured message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Outbound, captured on entry of the compress method
    Request,
    /// Inbound, captured on exit of the decompress method
    Response,
}

impl MessageKind {
    pub fn tag(self) -> u8 {
        match self {
            MessageKind::Request => b'Q',
            MessageKind::Response => b'R',
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'Q' => Some(MessageKind::Request),
            b'R' => Some(MessageKind::Response),
            _ => None,
        }
    }

    pub fn is_request(self) -> bool {
        self == MessageKind::Request
    }

    /// Discriminator used in artifact names
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Request => "request",
            MessageKind::Response => "response",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A buffer copied out at a hook site
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedMessage {
    kind: MessageKind,
    sequence: u64,
    bytes: Vec<u8>,
}

impl CapturedMessage {
    pub fn new(kind: MessageKind, sequence: u64, bytes: Vec<u8>) -> Self {
        CapturedMessage { kind, sequence, bytes }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Position in the capturing hook site's own invocation order
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("outbound queue full, message dropped")]
    QueueFull,
    #[error("channel closed, message dropped")]
    Closed,
}

/// Producer half handed to interceptors
#[derive(Debug, Clone)]
pub struct MessageSender {
    tx: mpsc::Sender<CapturedMessage>,
    dropped: Arc<AtomicU64>,
}

impl MessageSender {
    /// Queue a message without blocking
    pub fn send(&self, message: CapturedMessage) -> Result<(), TransportError> {
        self.tx.try_send(message).map_err(|err| {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            match err {
                mpsc::error::TrySendError::Full(_) => TransportError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
            }
        })
    }

    /// Messages dropped at the queue so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Bounded in-process channel
pub fn pair(capacity: usize) -> (MessageSender, mpsc::Receiver<CapturedMessage>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sender = MessageSender {
        tx,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (sender, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags() {
        assert_eq!(MessageKind::Request.tag(), b'Q');
        assert_eq!(MessageKind::Response.tag(), b'R');
        assert_eq!(MessageKind::from_tag(b'Q'), Some(MessageKind::Request));
        assert_eq!(MessageKind::from_tag(b'R'), Some(MessageKind::Response));
        assert_eq!(MessageKind::from_tag(b'q'), None);
    }

    #[test]
    fn test_send_preserves_order() {
        let (sender, mut rx) = pair(8);
        for sequence in 0..5 {
            sender.send(CapturedMessage::new(MessageKind::Response, sequence, vec![sequence as u8])).unwrap();
        }
        for sequence in 0..5 {
            assert_eq!(rx.try_recv().unwrap().sequence(), sequence);
        }
    }

    #[test]
    fn test_full_queue_drops() {
        let (sender, _rx) = pair(1);
        sender.send(CapturedMessage::new(MessageKind::Request, 0, vec![1])).unwrap();
        let result = sender.send(CapturedMessage::new(MessageKind::Request, 1, vec![2]));
        assert_eq!(result, Err(TransportError::QueueFull));
        assert_eq!(sender.dropped(), 1);
    }

    #[test]
    fn test_closed_channel_drops() {
        let (sender, rx) = pair(4);
        drop(rx);
        let result = sender.send(CapturedMessage::new(MessageKind::Response, 0, vec![1]));
        assert_eq!(result, Err(TransportError::Closed));
        assert_eq!(sender.dropped(), 1);
    }
}
