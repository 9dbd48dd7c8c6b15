//! Server-side representative of one connected participant.
//!
//! A [`Session`] is shared (`Arc`) between the connection's receive path and
//! the game controller. Outbound messages go through a bounded channel to a
//! dedicated writer task, so sending never blocks the caller. A peer that
//! stops reading fills the queue, which closes the session. Inbound messages
//! are read by the single owner of the matching [`SessionReader`].

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::protocol::{FrameError, FramedReader, Framer, Message};

pub type SessionId = Uuid;

/// Messages that may wait for the writer before the peer counts as stalled.
pub const OUTBOUND_CAPACITY: usize = 256;

/// How long a closed session keeps trying to deliver what was queued.
pub const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session already registered")]
    AlreadyRegistered,

    #[error("session is closed")]
    Closed,

    #[error("connection to the participant was lost")]
    TransportLost,
}

/// What one call to [`SessionReader::receive`] produced.
#[derive(Debug)]
pub enum Received {
    Message(Message),
    /// A segment arrived but could not be decoded.
    Malformed(FrameError),
    /// The transport closed. Returned exactly once.
    Closed,
}

pub struct Session {
    id: SessionId,
    peer: SocketAddr,
    name: OnceLock<String>,
    closed: AtomicBool,
    strikes: AtomicU32,
    outbound: mpsc::Sender<Message>,
    shutdown: watch::Sender<bool>,
}

impl Session {
    /// Wrap a transport. Spawns the writer task and returns the shared
    /// session along with the reader that drives its inbound side.
    pub fn open<R, W>(peer: SocketAddr, reader: R, writer: W) -> (Arc<Session>, SessionReader<R>)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let session = Arc::new(Session {
            id: Uuid::new_v4(),
            peer,
            name: OnceLock::new(),
            closed: AtomicBool::new(false),
            strikes: AtomicU32::new(0),
            outbound,
            shutdown,
        });

        tokio::spawn(write_loop(
            Arc::downgrade(&session),
            writer,
            outbound_rx,
            session.shutdown.subscribe(),
        ));

        let reader = SessionReader {
            session: Arc::clone(&session),
            frames: FramedReader::new(reader),
            shutdown: shutdown_rx,
            finished: false,
        };

        (session, reader)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Display name, once registered.
    pub fn name(&self) -> Option<&str> {
        self.name.get().map(String::as_str)
    }

    pub fn is_registered(&self) -> bool {
        self.name.get().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Bind a display name to this session. Accepted once.
    pub fn register(&self, name: impl Into<String>) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.name
            .set(name.into())
            .map_err(|_| SessionError::AlreadyRegistered)
    }

    /// Queue a message for delivery.
    ///
    /// A transport failure is detected by the writer task, which closes the
    /// session; later sends then report it. A full queue means the peer has
    /// stopped reading and closes the session at once.
    pub fn send(&self, message: Message) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        match self.outbound.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                log::warn!("Outbound queue for {} is full, closing", self.label());
                self.close();
                Err(SessionError::TransportLost)
            }
            Err(TrySendError::Closed(_)) => {
                self.close();
                Err(SessionError::TransportLost)
            }
        }
    }

    /// Release the transport. Safe to call repeatedly and from any task.
    /// Messages already queued are still written for up to [`CLOSE_GRACE`];
    /// the write half is dropped after that even if the peer is stuck.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            log::debug!("Closing session {} ({})", self.id, self.peer);
            self.shutdown.send_replace(true);
        }
    }

    /// Record a protocol violation and return the running total.
    pub fn strike(&self) -> u32 {
        self.strikes.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Short label for log lines.
    pub fn label(&self) -> String {
        match self.name() {
            Some(name) => format!("{} ({})", name, self.peer),
            None => self.peer.to_string(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("name", &self.name())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Inbound half of a session. Owned by the connection's receive path.
pub struct SessionReader<R> {
    session: Arc<Session>,
    frames: FramedReader<R>,
    shutdown: watch::Receiver<bool>,
    finished: bool,
}

impl<R: AsyncRead + Unpin> SessionReader<R> {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Wait for the next message or the end of the stream.
    ///
    /// Closing the session from elsewhere unblocks a pending call with
    /// [`Received::Closed`]. After that every call returns
    /// [`SessionError::Closed`].
    pub async fn receive(&mut self) -> Result<Received, SessionError> {
        if self.finished {
            return Err(SessionError::Closed);
        }

        let received = tokio::select! {
            biased;
            _ = closed_signal(&mut self.shutdown) => Received::Closed,
            frame = self.frames.next_frame() => match frame {
                Ok(Some(Ok(message))) => Received::Message(message),
                Ok(Some(Err(e))) => Received::Malformed(e),
                Ok(None) => Received::Closed,
                Err(e) => {
                    log::debug!("Read from {} failed: {}", self.session.label(), e);
                    Received::Closed
                }
            },
        };

        if matches!(received, Received::Closed) {
            self.finished = true;
            self.session.close();
        }
        Ok(received)
    }
}

/// Resolves once the session is marked closed.
async fn closed_signal(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let closed = *shutdown.borrow_and_update();
        if closed || shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn write_loop<W>(
    session: Weak<Session>,
    mut writer: W,
    mut outbound: mpsc::Receiver<Message>,
    mut shutdown: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    let grace_expired = {
        let mut shutdown = shutdown.clone();
        async move {
            closed_signal(&mut shutdown).await;
            tokio::time::sleep(CLOSE_GRACE).await;
        }
    };

    let delivered = tokio::select! {
        result = deliver(&mut writer, &mut outbound, &mut shutdown) => result,
        _ = grace_expired => {
            log::debug!("Peer stopped reading, dropping undelivered messages");
            return;
        }
    };

    match delivered {
        Ok(()) => {
            let _ = tokio::time::timeout(CLOSE_GRACE, writer.shutdown()).await;
        }
        Err(e) => {
            log::debug!("Write failed, closing session: {}", e);
            if let Some(session) = session.upgrade() {
                session.close();
            }
        }
    }
}

/// Write queued messages until the session closes and the queue is empty.
async fn deliver<W>(
    writer: &mut W,
    outbound: &mut mpsc::Receiver<Message>,
    shutdown: &mut watch::Receiver<bool>,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        // Queued messages go out before the close is noticed.
        let message = tokio::select! {
            biased;
            message = outbound.recv() => message,
            _ = closed_signal(shutdown) => None,
        };
        let Some(message) = message else {
            return Ok(());
        };
        write_message(writer, &message).await?;
    }
}

async fn write_message<W>(writer: &mut W, message: &Message) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = Framer::encode(message).map_err(io::Error::other)?;
    writer.write_all(&bytes).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn open_pair() -> (
        Arc<Session>,
        SessionReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
        tokio::io::DuplexStream,
    ) {
        let (client, server) = tokio::io::duplex(1024);
        let (read, write) = tokio::io::split(server);
        let (session, reader) = Session::open(peer(), read, write);
        (session, reader, client)
    }

    #[tokio::test]
    async fn test_register_once() {
        let (session, _reader, _client) = open_pair();

        assert!(session.name().is_none());
        assert_eq!(session.register("alice"), Ok(()));
        assert_eq!(session.register("bob"), Err(SessionError::AlreadyRegistered));
        assert_eq!(session.name(), Some("alice"));
    }

    #[tokio::test]
    async fn test_register_after_close_fails() {
        let (session, _reader, _client) = open_pair();
        session.close();
        assert_eq!(session.register("alice"), Err(SessionError::Closed));
    }

    #[tokio::test]
    async fn test_send_writes_one_line_per_message() {
        let (session, _reader, client) = open_pair();
        session.send(Message::Pong).unwrap();
        session
            .send(Message::Welcome {
                name: "alice".to_string(),
                players: 1,
            })
            .unwrap();

        let mut lines = BufReader::new(client).lines();
        let first = lines.next_line().await.unwrap().unwrap();
        let second = lines.next_line().await.unwrap().unwrap();
        assert_eq!(first, r#"{"kind":"pong"}"#);
        assert!(second.contains("\"kind\":\"welcome\""));
    }

    #[tokio::test]
    async fn test_receive_then_end_of_stream_once() {
        let (_session, mut reader, mut client) = open_pair();
        client.write_all(b"{\"kind\":\"ping\"}\nnonsense\n").await.unwrap();
        drop(client);

        assert!(matches!(reader.receive().await, Ok(Received::Message(Message::Ping))));
        assert!(matches!(reader.receive().await, Ok(Received::Malformed(_))));
        assert!(matches!(reader.receive().await, Ok(Received::Closed)));
        assert!(matches!(reader.receive().await, Err(SessionError::Closed)));
        assert!(reader.session().is_closed());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_unblocks_receive() {
        let (session, mut reader, _client) = open_pair();

        let pending = tokio::spawn(async move { reader.receive().await });
        tokio::task::yield_now().await;

        session.close();
        session.close();

        let received = pending.await.unwrap();
        assert!(matches!(received, Ok(Received::Closed)));
        assert_eq!(session.send(Message::Ping), Err(SessionError::Closed));
    }

    #[tokio::test]
    async fn test_queued_messages_flushed_on_close() {
        let (session, _reader, client) = open_pair();
        session.send(Message::GameEnd { entries: vec![] }).unwrap();
        session.close();

        let mut lines = BufReader::new(client).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert!(line.contains("game_end"));
        assert!(lines.next_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_fails_after_peer_vanishes() {
        let (session, _reader, client) = open_pair();
        drop(client);

        // The writer notices on its first write; a later send reports it.
        let _ = session.send(Message::Ping);
        for _ in 0..100 {
            if session.is_closed() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(session.is_closed());
        assert!(session.send(Message::Ping).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_peer_is_closed_and_released() {
        let (mut client, server) = tokio::io::duplex(64);
        let (read, write) = tokio::io::split(server);
        let (session, reader) = Session::open(peer(), read, write);

        // The client never reads, so the queue fills and the session closes.
        let mut accepted = 0;
        while session.send(Message::Pong).is_ok() {
            accepted += 1;
            assert!(accepted <= OUTBOUND_CAPACITY, "queue never filled");
        }
        assert!(session.is_closed());
        assert_eq!(session.send(Message::Pong), Err(SessionError::Closed));

        tokio::time::sleep(CLOSE_GRACE + Duration::from_secs(1)).await;
        drop(reader);

        let mut received = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(1), client.read_to_end(&mut received)).await;
        assert!(read.is_ok(), "write half was never dropped");
        assert!(received.len() <= 64);
        assert!(client.write_all(b"{\"kind\":\"ping\"}\n").await.is_err());
    }

    #[tokio::test]
    async fn test_strikes_accumulate() {
        let (session, _reader, _client) = open_pair();
        assert_eq!(session.strike(), 1);
        assert_eq!(session.strike(), 2);
    }
}
