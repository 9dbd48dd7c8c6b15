//! TCP listener, per-connection receive paths and server lifecycle.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::data::{load_questions, validate_questions, LoadError};
use crate::models::Question;
use crate::protocol::{ErrorCode, FrameError, Framer, LeaderboardEntry, Message};

use super::config::ServerConfig;
use super::game::{Event, GameController};
use super::scorer::Scorer;
use super::session::{Received, Session, SessionReader};

/// Failure to start the server. Nothing is running when one is returned.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Questions(#[from] LoadError),

    #[error("question bank is empty")]
    NoQuestions,

    #[error("failed to listen on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
}

/// Everything a connection task needs, shared by clone.
#[derive(Clone)]
pub struct ServerContext {
    config: Arc<ServerConfig>,
    scorer: Arc<Scorer>,
    events: mpsc::UnboundedSender<Event>,
    live_connections: Arc<AtomicUsize>,
}

impl ServerContext {
    pub fn new(config: ServerConfig, scorer: Arc<Scorer>, events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            config: Arc::new(config),
            scorer,
            events,
            live_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn live_connections(&self) -> usize {
        self.live_connections.load(Ordering::Acquire)
    }

    /// Claim a connection slot, or `None` if the cap is reached.
    fn try_reserve(&self) -> Option<ConnectionSlot> {
        let max = self.config.max_connections.unwrap_or(usize::MAX);
        self.live_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| (live < max).then_some(live + 1))
            .ok()
            .map(|_| ConnectionSlot {
                live_connections: Arc::clone(&self.live_connections),
            })
    }
}

/// Releases its connection slot on drop.
struct ConnectionSlot {
    live_connections: Arc<AtomicUsize>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.live_connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Turn a transport into a session and spawn its receive path.
pub fn attach<R, W>(context: &ServerContext, peer: SocketAddr, reader: R, writer: W) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    spawn_session(context.clone(), peer, reader, writer, None)
}

fn spawn_session<R, W>(
    context: ServerContext,
    peer: SocketAddr,
    reader: R,
    writer: W,
    slot: Option<ConnectionSlot>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (session, reader) = Session::open(peer, reader, writer);
    if context.events.send(Event::Connected(Arc::clone(&session))).is_err() {
        session.close();
    }

    tokio::spawn(async move {
        let _slot = slot;
        receive_loop(&context, reader).await;

        if let Some(name) = session.name() {
            context.scorer.deactivate(name, session.id());
        }
        let _ = context.events.send(Event::Disconnected(session));
    })
}

/// Read messages from one participant until its transport closes.
async fn receive_loop<R>(context: &ServerContext, mut reader: SessionReader<R>)
where
    R: AsyncRead + Unpin,
{
    let session = Arc::clone(reader.session());

    loop {
        let received = match context.config.idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, reader.receive()).await {
                Ok(received) => received,
                Err(_) => {
                    log::info!("Disconnecting idle session {}", session.label());
                    session.close();
                    continue;
                }
            },
            None => reader.receive().await,
        };

        match received {
            Ok(Received::Message(Message::Ping)) => {
                let _ = session.send(Message::Pong);
            }
            Ok(Received::Message(message)) => {
                let event = Event::Inbound {
                    session: Arc::clone(&session),
                    message,
                };
                if context.events.send(event).is_err() {
                    session.close();
                }
            }
            Ok(Received::Malformed(e)) => {
                let code = match e {
                    FrameError::Oversized { .. } => ErrorCode::Oversized,
                    _ => ErrorCode::Malformed,
                };
                log::warn!("Bad frame from {}: {}", session.label(), e);
                let _ = session.send(Message::error(code, e.to_string()));
                let strikes = session.strike();
                if strikes >= context.config.game.max_strikes {
                    log::warn!("Disconnecting {} after {} violations", session.label(), strikes);
                    session.close();
                }
            }
            Ok(Received::Closed) | Err(_) => break,
        }
    }
}

/// Accept connections until the task is aborted.
async fn accept_loop(listener: TcpListener, context: ServerContext) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let Some(slot) = context.try_reserve() else {
                    log::warn!("Refusing {}: connection limit reached", peer);
                    tokio::spawn(refuse(stream));
                    continue;
                };
                if let Err(e) = stream.set_nodelay(true) {
                    log::debug!("Could not disable Nagle for {}: {}", peer, e);
                }
                let (read, write) = stream.into_split();
                spawn_session(context.clone(), peer, read, write, Some(slot));
            }
            Err(e) => {
                log::error!("Failed to accept connection: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

async fn refuse(mut stream: TcpStream) {
    let message = Message::error(ErrorCode::ServerFull, "Server is full");
    if let Ok(bytes) = Framer::encode(&message) {
        let _ = stream.write_all(&bytes).await;
    }
    let _ = stream.shutdown().await;
}

/// A bound, not yet running quiz server.
pub struct Server {
    listener: TcpListener,
    context: ServerContext,
    controller: GameController,
}

impl Server {
    /// Validate the question bank and bind the listener.
    pub async fn bind(config: ServerConfig, questions: Vec<Question>) -> Result<Self, ServerError> {
        if questions.is_empty() {
            return Err(ServerError::NoQuestions);
        }
        validate_questions(&questions)?;

        let address = config.address();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| ServerError::Bind {
                address: address.clone(),
                source,
            })?;

        let (events, events_rx) = mpsc::unbounded_channel();
        let scorer = Arc::new(Scorer::new());
        let controller = GameController::new(config.game.clone(), questions, Arc::clone(&scorer), events_rx);
        let context = ServerContext::new(config, scorer, events);

        Ok(Self {
            listener,
            context,
            controller,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until the game is over. Returns the final standings.
    pub async fn run(self) -> Option<Vec<LeaderboardEntry>> {
        let Server {
            listener,
            context,
            controller,
        } = self;

        if let Ok(address) = listener.local_addr() {
            log::info!("Server listening on {}", address);
        }
        let acceptor = tokio::spawn(accept_loop(listener, context));
        let standings = controller.run().await;
        acceptor.abort();
        log::info!("Server stopped");
        standings
    }
}

/// Run the quiz server.
pub async fn run<P: AsRef<Path>>(config: ServerConfig, questions_path: P) -> Result<(), ServerError> {
    let questions = load_questions(questions_path)?;
    let server = Server::bind(config, questions).await?;
    server.run().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::TriviaClient;
    use crate::server::config::GameConfig;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
    use tokio::time::Instant;

    type TestClient = TriviaClient<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn lobby_config() -> ServerConfig {
        ServerConfig {
            game: GameConfig {
                min_participants: 2,
                ..GameConfig::default()
            },
            ..ServerConfig::default()
        }
    }

    fn start(config: ServerConfig) -> (ServerContext, Arc<Scorer>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let scorer = Arc::new(Scorer::new());
        let questions = vec![Question::new("2+2?", vec!["3".to_string(), "4".to_string()], 1)];
        let controller = GameController::new(config.game.clone(), questions, Arc::clone(&scorer), events_rx);
        tokio::spawn(controller.run());
        (ServerContext::new(config, Arc::clone(&scorer), events), scorer)
    }

    fn connect(context: &ServerContext) -> (JoinHandle<()>, TestClient) {
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let task = attach(context, "127.0.0.1:40000".parse().unwrap(), server_read, server_write);
        let (client_read, client_write) = tokio::io::split(client);
        (task, TriviaClient::from_parts(client_read, client_write))
    }

    async fn join(client: &mut TestClient, name: &str) {
        client.register(name).await.unwrap();
        client.wait_for(|m| matches!(m, Message::Welcome { .. })).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_session_is_disconnected_after_idle_timeout() {
        let config = ServerConfig {
            idle_timeout: Some(Duration::from_secs(60)),
            ..lobby_config()
        };
        let (context, scorer) = start(config);
        let started = Instant::now();
        let (task, mut client) = connect(&context);
        join(&mut client, "alice").await;
        assert!(scorer.is_active("alice"));

        task.await.unwrap();
        assert!(Instant::now() - started >= Duration::from_secs(60));
        assert!(!scorer.is_active("alice"));
        while client.next_message().await.unwrap().is_some() {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_resets_idle_timer() {
        let config = ServerConfig {
            idle_timeout: Some(Duration::from_secs(60)),
            ..lobby_config()
        };
        let (context, _scorer) = start(config);
        let (task, mut client) = connect(&context);

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(45)).await;
            client.send(&Message::Ping).await.unwrap();
            assert_eq!(client.wait_for(|m| matches!(m, Message::Pong)).await.unwrap(), Message::Pong);
        }
        assert!(!task.is_finished());
    }

    #[tokio::test]
    async fn test_repeated_malformed_lines_disconnect() {
        let (context, scorer) = start(lobby_config());
        let (task, mut client) = connect(&context);
        join(&mut client, "alice").await;

        for _ in 0..3 {
            client.send_raw(b"not json at all\n").await.unwrap();
        }
        for _ in 0..3 {
            match client.wait_for(|m| matches!(m, Message::Error { .. })).await.unwrap() {
                Message::Error { code, .. } => assert_eq!(code, ErrorCode::Malformed),
                _ => unreachable!(),
            }
        }
        assert!(client.next_message().await.unwrap().is_none());

        task.await.unwrap();
        assert!(!scorer.is_active("alice"));
    }
}
