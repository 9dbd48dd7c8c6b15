//! TCP client speaking the line protocol.

use std::io;

use futures_util::Stream;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::protocol::{FrameError, FramedReader, Framer, Message};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("server closed the connection")]
    Disconnected,
}

/// One participant's connection to a quiz server.
pub struct TriviaClient<R, W> {
    frames: FramedReader<R>,
    writer: W,
}

impl TriviaClient<OwnedReadHalf, OwnedWriteHalf> {
    /// Connect to a server.
    pub async fn connect<A: ToSocketAddrs>(address: A) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok(Self::from_parts(read, write))
    }
}

impl<R, W> TriviaClient<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn from_parts(reader: R, writer: W) -> Self {
        Self {
            frames: FramedReader::new(reader),
            writer,
        }
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), ClientError> {
        let bytes = Framer::encode(message)?;
        self.send_raw(&bytes).await
    }

    /// Write bytes as-is, without framing.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        self.writer.write_all(bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn register(&mut self, name: &str) -> Result<(), ClientError> {
        self.send(&Message::Register {
            name: name.to_string(),
        })
        .await
    }

    pub async fn answer(&mut self, index: usize, choice: usize) -> Result<(), ClientError> {
        self.send(&Message::Answer { index, choice }).await
    }

    /// Next message from the server, or `None` once it hangs up.
    pub async fn next_message(&mut self) -> Result<Option<Message>, ClientError> {
        match self.frames.next_frame().await? {
            Some(frame) => Ok(Some(frame?)),
            None => Ok(None),
        }
    }

    /// Skip messages until one matches.
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> Result<Message, ClientError>
    where
        F: FnMut(&Message) -> bool,
    {
        loop {
            match self.next_message().await? {
                Some(message) if predicate(&message) => return Ok(message),
                Some(_) => continue,
                None => return Err(ClientError::Disconnected),
            }
        }
    }

    /// Stop sending and consume the rest of the connection as a stream.
    pub fn into_messages(self) -> impl Stream<Item = Result<Message, FrameError>> {
        self.frames.into_stream()
    }
}
