//! Interceptors: what runs at a hook site
//!
//! Interceptors execute on the game's own threads, synchronously, inside the
//! hooked call. They copy one array out and `try_send` it; nothing else.
//! Every failure is swallowed here after a `trace!`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::backend::ExtractError;
use crate::channel::{CapturedMessage, MessageKind, MessageSender};
use crate::il2cpp::ManagedArrayReader;

/// Number of integer register arguments forwarded through a detour
pub const FORWARDED_ARGS: usize = 4;

/// Raw register arguments of an intercepted call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arguments([usize; FORWARDED_ARGS]);

impl Arguments {
    pub fn new(raw: [usize; FORWARDED_ARGS]) -> Self {
        Arguments(raw)
    }

    pub fn get(&self, index: usize) -> Option<usize> {
        self.0.get(index).copied()
    }

    pub fn raw(&self) -> [usize; FORWARDED_ARGS] {
        self.0
    }
}

/// Entry/exit callbacks for one hook site
pub trait Interceptor: Send + Sync {
    fn on_enter(&self, _args: &Arguments) {}

    fn on_leave(&self, _retval: usize) {}
}

/// State shared by both capture interceptors, fixed at install time
struct Capture {
    kind: MessageKind,
    reader: Arc<ManagedArrayReader>,
    sender: MessageSender,
    sequence: AtomicU64,
}

impl Capture {
    fn new(kind: MessageKind, reader: Arc<ManagedArrayReader>, sender: MessageSender) -> Self {
        Capture {
            kind,
            reader,
            sender,
            sequence: AtomicU64::new(0),
        }
    }

    fn forward(&self, bytes: Vec<u8>) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let len = bytes.len();
        match self.sender.send(CapturedMessage::new(self.kind, sequence, bytes)) {
            Ok(()) => tracing::trace!(kind = %self.kind, sequence, len, "captured"),
            Err(err) => tracing::trace!(kind = %self.kind, sequence, error = %err, "capture dropped"),
        }
    }

    fn captured(&self) -> u64 {
        self.sequence.load(Ordering::Relaxed)
    }
}

/// Exit hook on `DecompressResponse`: the return value is the decompressed body
pub struct ResponseCapture {
    capture: Capture,
}

impl ResponseCapture {
    pub fn new(reader: Arc<ManagedArrayReader>, sender: MessageSender) -> Self {
        ResponseCapture {
            capture: Capture::new(MessageKind::Response, reader, sender),
        }
    }

    /// Buffers extracted at this site so far, delivered or not
    pub fn captured(&self) -> u64 {
        self.capture.captured()
    }
}

impl Interceptor for ResponseCapture {
    fn on_leave(&self, retval: usize) {
        if retval == 0 {
            return;
        }
        match self.capture.reader.read(retval) {
            Ok(bytes) => self.capture.forward(bytes),
            Err(err) => tracing::trace!(error = %err, "response extraction failed"),
        }
    }
}

/// Entry hook on `CompressRequest`
///
/// Which argument carries the body is not certain, so the primary position is
/// tried first and the fallback position only if that extraction fails.
pub struct RequestCapture {
    capture: Capture,
    primary: usize,
    fallback: Option<usize>,
}

impl RequestCapture {
    pub fn new(reader: Arc<ManagedArrayReader>, sender: MessageSender) -> Self {
        RequestCapture {
            capture: Capture::new(MessageKind::Request, reader, sender),
            primary: 0,
            fallback: Some(1),
        }
    }

    /// Override the argument positions; an empty order disables the capture
    pub fn with_argument_order(mut self, order: &[usize]) -> Self {
        self.primary = order.first().copied().unwrap_or(FORWARDED_ARGS);
        self.fallback = order.get(1).copied();
        self
    }

    pub fn captured(&self) -> u64 {
        self.capture.captured()
    }

    fn extract(&self, args: &Arguments, index: usize) -> Result<Vec<u8>, ExtractError> {
        let handle = args.get(index).ok_or(ExtractError::NullHandle(0))?;
        self.capture.reader.read(handle)
    }
}

impl Interceptor for RequestCapture {
    fn on_enter(&self, args: &Arguments) {
        let extracted = self.extract(args, self.primary).or_else(|primary_err| {
            let Some(fallback) = self.fallback else {
                return Err(primary_err);
            };
            tracing::trace!(error = %primary_err, fallback, "primary request argument failed");
            self.extract(args, fallback)
        });

        match extracted {
            Ok(bytes) => self.capture.forward(bytes),
            Err(err) => tracing::trace!(error = %err, "request extraction failed"),
        }
    }
}
