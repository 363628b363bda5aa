//! Consumer side: decode and persist whatever the agents send
//!
//! One consumer drains the queue and handles each message on its own. There
//! is no request/response pairing; the sequence numbers are only logged.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::channel::{CapturedMessage, MessageKind};
use crate::envelope::{DecodeError, EnvelopeDecoder, Framing};
use crate::sink::{PersistenceSink, SinkError};

/// What happened to one message
#[derive(Debug)]
pub enum Outcome {
    Persisted(PathBuf),
    /// Not decodable; nothing was written
    Discarded(DecodeError),
    /// Decoded but could not be written
    Failed(SinkError),
}

/// Counters and recent artifacts, shared with the status endpoint
#[derive(Debug)]
pub struct ControllerState {
    received: AtomicU64,
    requests: AtomicU64,
    responses: AtomicU64,
    headered: AtomicU64,
    persisted: AtomicU64,
    discarded: AtomicU64,
    failed: AtomicU64,
    recent: Mutex<VecDeque<PathBuf>>,
    recent_limit: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub received: u64,
    pub requests: u64,
    pub responses: u64,
    pub headered: u64,
    pub persisted: u64,
    pub discarded: u64,
    pub failed: u64,
}

impl ControllerState {
    pub fn new(recent_limit: usize) -> Self {
        ControllerState {
            received: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            responses: AtomicU64::new(0),
            headered: AtomicU64::new(0),
            persisted: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            recent: Mutex::new(VecDeque::with_capacity(recent_limit)),
            recent_limit,
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            received: self.received.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            headered: self.headered.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Most recent artifact paths, newest first
    pub fn recent(&self) -> Vec<PathBuf> {
        match self.recent.lock() {
            Ok(recent) => recent.iter().rev().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    fn remember(&self, path: PathBuf) {
        if self.recent_limit == 0 {
            return;
        }
        if let Ok(mut recent) = self.recent.lock() {
            if recent.len() == self.recent_limit {
                recent.pop_front();
            }
            recent.push_back(path);
        }
    }
}

pub struct Controller<S> {
    decoder: EnvelopeDecoder,
    sink: S,
    state: Arc<ControllerState>,
}

impl<S: PersistenceSink> Controller<S> {
    pub fn new(sink: S, recent_limit: usize) -> Self {
        Controller {
            decoder: EnvelopeDecoder::new(),
            sink,
            state: Arc::new(ControllerState::new(recent_limit)),
        }
    }

    pub fn state(&self) -> Arc<ControllerState> {
        self.state.clone()
    }

    /// Decode and persist one message
    pub fn handle(&mut self, message: &CapturedMessage) -> Outcome {
        let state = &self.state;
        state.received.fetch_add(1, Ordering::Relaxed);
        match message.kind() {
            MessageKind::Request => state.requests.fetch_add(1, Ordering::Relaxed),
            MessageKind::Response => state.responses.fetch_add(1, Ordering::Relaxed),
        };

        let envelope = match self.decoder.decode(message.bytes(), message.kind().is_request()) {
            Ok(envelope) => envelope,
            Err(err) => {
                state.discarded.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    kind = %message.kind(),
                    sequence = message.sequence(),
                    len = message.bytes().len(),
                    error = %err,
                    "discarding undecodable message"
                );
                return Outcome::Discarded(err);
            }
        };
        if let Framing::Headered { header_size } = envelope.framing() {
            state.headered.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(header_size, sequence = message.sequence(), "stripped request header");
        }

        match self.sink.persist(message.kind(), &envelope) {
            Ok(path) => {
                state.persisted.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    kind = %message.kind(),
                    sequence = message.sequence(),
                    path = %path.display(),
                    "saved"
                );
                state.remember(path.clone());
                Outcome::Persisted(path)
            }
            Err(err) => {
                state.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(kind = %message.kind(), error = %err, "persist failed");
                Outcome::Failed(err)
            }
        }
    }

    /// Drain the queue until every sender is gone
    pub async fn run(mut self, mut rx: mpsc::Receiver<CapturedMessage>) {
        while let Some(message) = rx.recv().await {
            self.handle(&message);
        }
        let stats = self.state.snapshot();
        tracing::info!(
            received = stats.received,
            persisted = stats.persisted,
            discarded = stats.discarded,
            "controller stopped"
        );
    }
}
