//! Socket plumbing: frame-oriented reader/writer and the accept loop.

use std::sync::Arc;

use bytes::BytesMut;
use chat_protocol::ProtocolMessage;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::errors::SessionError;
use crate::session::Session;

/// Initial read buffer capacity per connection.
const READ_BUFFER_CAPACITY: usize = 4 * 1024;

/// Reads frames from a byte stream, reassembling frames that arrive
/// split across reads.
pub struct FrameReader<R> {
    io: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(io: R) -> Self {
        FrameReader {
            io,
            buf: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
        }
    }

    /// The next complete frame, or `Ok(None)` on a clean end of stream.
    /// EOF in the middle of a frame is an error. Input that fails to
    /// parse is discarded and reading continues; the framing carries no
    /// resync marker, so the whole buffer goes with it.
    pub async fn next_frame(&mut self) -> Result<Option<ProtocolMessage>, SessionError> {
        loop {
            match chat_protocol::decode(&mut self.buf) {
                Ok(Some(msg)) => return Ok(Some(msg)),
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "discarding unparseable input");
                    self.buf.clear();
                }
            }
            let read = self.io.read_buf(&mut self.buf).await?;
            if read == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(SessionError::TruncatedFrame)
                };
            }
        }
    }
}

/// Writes frames to a byte stream with a bounded number of write
/// attempts per frame.
pub struct FrameWriter<W> {
    io: W,
    retry_limit: u32,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(io: W, retry_limit: u32) -> Self {
        FrameWriter { io, retry_limit }
    }

    /// Writes one frame. Each partial write consumes one attempt from
    /// the retry budget; a peer that stops draining its socket gets the
    /// session dropped instead of wedging the server.
    pub async fn send(&mut self, msg: &ProtocolMessage) -> Result<(), SessionError> {
        let frame = chat_protocol::encode(msg);
        let mut written = 0;
        let mut attempts = 0;
        while written < frame.len() {
            if attempts == self.retry_limit {
                return Err(SessionError::WriteExhausted { attempts });
            }
            attempts += 1;
            let chunk = frame.get(written..).unwrap_or_default();
            let n = self.io.write(chunk).await?;
            if n == 0 {
                return Err(SessionError::Transport(std::io::Error::from(
                    std::io::ErrorKind::WriteZero,
                )));
            }
            written += n;
        }
        self.io.flush().await?;
        Ok(())
    }
}

/// Accepts connections until `shutdown` fires, spawning one session task
/// per client. One client's failure never reaches this loop.
pub async fn serve(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    config: Arc<Config>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!(address = %listener.local_addr()?, "listening");
    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                info!("shutdown requested, stopping accept loop");
                dispatcher.cancel_all();
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let (read_half, write_half) = stream.into_split();
                        Session::spawn(
                            FrameReader::new(read_half),
                            FrameWriter::new(write_half, config.write_retry_limit),
                            Some(peer),
                            Arc::clone(&dispatcher),
                            &config,
                            &shutdown,
                        );
                        info!(%peer, sessions = dispatcher.session_count(), "client connected");
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to accept connection");
                    }
                }
            }
        }
    }
}
