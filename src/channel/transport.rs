//! TCP transport between the agent and the controller
//!
//! The agent side runs on its own thread with a single-threaded tokio runtime
//! so nothing ever executes on the host's threads except `try_send`. It
//! connects lazily, and after a write failure reconnects on the next message;
//! a message that cannot be written is gone.

use std::net::SocketAddr;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

use super::frame::{read_frame, write_frame};
use super::{pair, CapturedMessage, MessageSender};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Background thread draining the outbound queue to the controller
#[derive(Debug)]
pub struct Forwarder {
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Forwarder {
    /// Stop forwarding and wait for the thread to exit. Queued messages are dropped.
    pub fn shutdown(mut self) {
        self.signal();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("forwarder thread panicked");
            }
        }
    }

    fn signal(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.signal();
    }
}

/// Start the agent-side forwarder towards `addr`
pub fn spawn_forwarder(addr: String, capacity: usize) -> std::io::Result<(MessageSender, Forwarder)> {
    let (sender, rx) = pair(capacity);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let thread = std::thread::Builder::new()
        .name("netcap-forwarder".to_string())
        .spawn(move || runtime.block_on(forward(addr, rx, shutdown_rx)))?;

    let forwarder = Forwarder {
        shutdown: Some(shutdown_tx),
        thread: Some(thread),
    };
    Ok((sender, forwarder))
}

async fn connect(addr: &str) -> Option<TcpStream> {
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            tracing::info!(controller = addr, "connected to controller");
            Some(stream)
        }
        Ok(Err(err)) => {
            tracing::debug!(controller = addr, error = %err, "controller unreachable");
            None
        }
        Err(_) => {
            tracing::debug!(controller = addr, "controller connect timed out");
            None
        }
    }
}

async fn forward(
    addr: String,
    mut rx: mpsc::Receiver<CapturedMessage>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut stream: Option<TcpStream> = None;
    let mut forwarded: u64 = 0;
    let mut lost: u64 = 0;

    loop {
        let message = tokio::select! {
            _ = &mut shutdown => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        if stream.is_none() {
            stream = connect(&addr).await;
        }
        let Some(conn) = stream.as_mut() else {
            lost += 1;
            continue;
        };

        match write_frame(conn, &message).await {
            Ok(()) => forwarded += 1,
            Err(err) => {
                tracing::debug!(error = %err, kind = %message.kind(), "dropping message, connection lost");
                stream = None;
                lost += 1;
            }
        }
    }

    tracing::info!(forwarded, lost, "forwarder stopped");
}

/// Bind the controller listener; frames from every agent connection land in one queue
pub async fn listen(
    addr: &str,
    capacity: usize,
) -> std::io::Result<(SocketAddr, mpsc::Receiver<CapturedMessage>)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    let (tx, rx) = mpsc::channel(capacity.max(1));

    tokio::spawn(accept_loop(listener, tx));
    tracing::info!(addr = %local, "listening for agent connections");
    Ok((local, rx))
}

async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<CapturedMessage>) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = tx.closed() => break,
        };

        match accepted {
            Ok((stream, peer)) => {
                tracing::info!(%peer, "agent connected");
                tokio::spawn(read_connection(stream, peer, tx.clone()));
            }
            Err(err) => tracing::warn!(error = %err, "accept failed"),
        }
    }
}

async fn read_connection(mut stream: TcpStream, peer: SocketAddr, tx: mpsc::Sender<CapturedMessage>) {
    loop {
        match read_frame(&mut stream).await {
            Ok(Some(message)) => {
                if tx.send(message).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                tracing::info!(%peer, "agent disconnected");
                return;
            }
            Err(err) => {
                tracing::warn!(%peer, error = %err, "closing connection after bad frame");
                return;
            }
        }
    }
}
