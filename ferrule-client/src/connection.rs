//! Pipelined connection to a single server
//!
//! Every socket is owned by one tokio task. Handles submit encoded frames
//! over an unbounded channel; the task writes them and queues the reply
//! sender, so channel order, write order and reply order coincide and the
//! n-th queued command receives the n-th reply.
//!
//! Replies that arrive while nothing is pending (pub/sub messages) go to the
//! `on_message` handler.

use crate::command::{Command, NullEncoding};
use crate::config::{ConnectionConfig, split_address};
use crate::error::{Error, Result};
use crate::parser::ReplyParser;
use crate::reply::Reply;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

type ReplySender = oneshot::Sender<Result<Reply>>;

/// Called once when the connection fails
pub type ExceptionHandler = Arc<dyn Fn(&Error) + Send + Sync>;
/// Called once when the connection has terminated, for any reason
pub type EndHandler = Arc<dyn Fn() + Send + Sync>;
/// Called for every unsolicited reply
pub type MessageHandler = Arc<dyn Fn(Reply) + Send + Sync>;

/// Single-slot handlers; a later registration replaces the earlier one
#[derive(Default)]
struct Handlers {
    exception: Option<ExceptionHandler>,
    end: Option<EndHandler>,
    message: Option<MessageHandler>,
}

struct Shared {
    address: String,
    closed: AtomicBool,
    handlers: Mutex<Handlers>,
}

enum Request {
    Command { frame: Bytes, reply: ReplySender },
    Pause,
    Resume,
    Close,
}

/// Handle to a connection task
///
/// Cheap to clone. The connection closes when [`Connection::close`] is called
/// or when the last handle is dropped.
#[derive(Clone)]
pub struct Connection {
    tx: mpsc::UnboundedSender<Request>,
    shared: Arc<Shared>,
    null_encoding: NullEncoding,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.shared.address)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Open a TCP connection to `addr` (`host:port`) and start its task
    pub async fn connect(addr: &str, config: &ConnectionConfig) -> Result<Self> {
        split_address(addr)?;

        let stream =
            match tokio::time::timeout(config.connect_timeout(), TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    error!("Failed to connect to {}: {}", addr, e);
                    return Err(e.into());
                }
                Err(_) => {
                    error!(
                        "Connect to {} timed out after {}ms",
                        addr, config.connect_timeout_ms
                    );
                    return Err(Error::ConnectTimeout(addr.to_string()));
                }
            };
        stream.set_nodelay(true)?;
        info!("Connected to {}", addr);

        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            address: addr.to_string(),
            closed: AtomicBool::new(false),
            handlers: Mutex::new(Handlers::default()),
        });

        let task = ConnectionTask {
            rx,
            reader,
            writer,
            shared: Arc::clone(&shared),
            parser: ReplyParser::new(),
            read_buf: BytesMut::with_capacity(config.read_buffer_size),
            write_buf: BytesMut::new(),
            pending: VecDeque::new(),
            paused: false,
        };
        tokio::spawn(task.run());

        Ok(Self {
            tx,
            shared,
            null_encoding: config.null_encoding,
        })
    }

    /// Send a command and wait for its reply
    ///
    /// A server error reply is returned as [`Error::Reply`] with the raw text.
    pub async fn send(&self, command: &Command) -> Result<Reply> {
        self.send_frame(command.encode_with(self.null_encoding)).await
    }

    /// Send an already encoded frame
    pub(crate) async fn send_frame(&self, frame: Bytes) -> Result<Reply> {
        let pending = self.submit(frame)?;
        pending.await.unwrap_or(Err(Error::ConnectionClosed))
    }

    /// Queue a frame without waiting; frames submitted in sequence are
    /// written back to back
    pub(crate) fn submit(&self, frame: Bytes) -> Result<oneshot::Receiver<Result<Reply>>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Command { frame, reply })
            .map_err(|_| Error::ConnectionClosed)?;
        Ok(rx)
    }

    /// Stop reading from the socket; replies stay buffered in the kernel
    pub fn pause(&self) {
        let _ = self.tx.send(Request::Pause);
    }

    /// Resume reading from the socket
    pub fn resume(&self) {
        let _ = self.tx.send(Request::Resume);
    }

    /// Close the socket; pending commands fail with [`Error::ConnectionClosed`]
    pub fn close(&self) {
        let _ = self.tx.send(Request::Close);
    }

    pub fn on_exception(&self, handler: impl Fn(&Error) + Send + Sync + 'static) {
        self.shared.handlers.lock().exception = Some(Arc::new(handler));
    }

    pub fn on_end(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.shared.handlers.lock().end = Some(Arc::new(handler));
    }

    pub fn on_message(&self, handler: impl Fn(Reply) + Send + Sync + 'static) {
        self.shared.handlers.lock().message = Some(Arc::new(handler));
    }

    /// Address this connection was opened to
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// True once the connection task has terminated
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }
}

struct ConnectionTask {
    rx: mpsc::UnboundedReceiver<Request>,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    shared: Arc<Shared>,
    parser: ReplyParser,
    read_buf: BytesMut,
    write_buf: BytesMut,
    pending: VecDeque<ReplySender>,
    paused: bool,
}

impl ConnectionTask {
    async fn run(mut self) {
        let cause = loop {
            tokio::select! {
                request = self.rx.recv() => {
                    if let Err(cause) = self.on_request(request).await {
                        break cause;
                    }
                }
                read = self.reader.read_buf(&mut self.read_buf), if !self.paused => {
                    match read {
                        Ok(0) => {
                            debug!("Connection to {} closed by peer", self.shared.address);
                            break None;
                        }
                        Ok(_) => {
                            if let Err(e) = self.dispatch() {
                                break Some(e);
                            }
                        }
                        Err(e) => break Some(e.into()),
                    }
                }
            }
        };

        self.terminate(cause).await;
    }

    /// Handle one request plus everything already queued behind it, then
    /// flush the accumulated frames in a single write
    async fn on_request(&mut self, first: Option<Request>) -> std::result::Result<(), Option<Error>> {
        let mut flow = self.apply(first);
        while flow.is_continue() {
            match self.rx.try_recv() {
                Ok(request) => flow = self.apply(Some(request)),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => flow = self.apply(None),
            }
        }
        if flow.is_break() {
            return Err(None);
        }

        if !self.write_buf.is_empty() {
            let frames = self.write_buf.split();
            if let Err(e) = self.writer.write_all(&frames).await {
                return Err(Some(e.into()));
            }
        }
        Ok(())
    }

    fn apply(&mut self, request: Option<Request>) -> ControlFlow<()> {
        match request {
            Some(Request::Command { frame, reply }) => {
                self.write_buf.extend_from_slice(&frame);
                self.pending.push_back(reply);
            }
            Some(Request::Pause) => self.paused = true,
            Some(Request::Resume) => self.paused = false,
            Some(Request::Close) | None => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    /// Hand every complete reply in the read buffer to its receiver
    fn dispatch(&mut self) -> Result<()> {
        while let Some(reply) = self.parser.decode(&mut self.read_buf)? {
            match self.pending.pop_front() {
                Some(sender) => {
                    let result = match reply {
                        Reply::Error(text) => Err(Error::Reply(text)),
                        other => Ok(other),
                    };
                    // Receiver gone means the caller stopped waiting
                    let _ = sender.send(result);
                }
                None => self.unsolicited(reply),
            }
        }
        Ok(())
    }

    fn unsolicited(&self, reply: Reply) {
        let handler = self.shared.handlers.lock().message.clone();
        match handler {
            Some(handler) => handler(reply),
            None => warn!(
                "Dropping unsolicited {} reply from {}",
                reply.kind(),
                self.shared.address
            ),
        }
    }

    async fn terminate(mut self, cause: Option<Error>) {
        self.shared.closed.store(true, Ordering::Release);
        self.rx.close();
        while let Ok(request) = self.rx.try_recv() {
            if let Request::Command { reply, .. } = request {
                let _ = reply.send(Err(Error::ConnectionClosed));
            }
        }
        for sender in self.pending.drain(..) {
            let _ = sender.send(Err(Error::ConnectionClosed));
        }
        let _ = self.writer.shutdown().await;

        let (exception, end) = {
            let handlers = self.shared.handlers.lock();
            (handlers.exception.clone(), handlers.end.clone())
        };
        if let Some(err) = cause {
            error!("Connection to {} failed: {}", self.shared.address, err);
            if let Some(handler) = exception {
                handler(&err);
            }
        } else {
            info!("Connection to {} closed", self.shared.address);
        }
        if let Some(handler) = end {
            handler();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let (listener, addr) = listener().await;
        drop(listener);
        let result = Connection::connect(&addr, &ConnectionConfig::default()).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_invalid_address() {
        let result = Connection::connect("no-port", &ConnectionConfig::default()).await;
        assert!(matches!(result, Err(Error::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn test_error_reply_and_coalesced_pipeline() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let mut seen = Vec::new();
            while seen.windows(4).filter(|w| *w == b"PING").count() < 2 {
                let n = socket.read(&mut buf).await.unwrap();
                seen.extend_from_slice(&buf[..n]);
            }
            socket.write_all(b"-ERR nope\r\n+PONG\r\n").await.unwrap();
            let _ = socket.read(&mut buf).await;
        });

        let conn = Connection::connect(&addr, &ConnectionConfig::default())
            .await
            .unwrap();
        let ping = Command::new("PING");
        let (first, second) = tokio::join!(conn.send(&ping), conn.send(&ping));
        assert_eq!(first.unwrap_err().reply_text(), Some("ERR nope"));
        assert_eq!(second.unwrap(), Reply::Status("PONG".into()));
    }

    #[tokio::test]
    async fn test_peer_close_fires_end_without_exception() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let conn = Connection::connect(&addr, &ConnectionConfig::default())
            .await
            .unwrap();
        let exceptions = Arc::new(AtomicUsize::new(0));
        let (end_tx, end_rx) = oneshot::channel();
        let end_tx = Mutex::new(Some(end_tx));
        {
            let exceptions = Arc::clone(&exceptions);
            conn.on_exception(move |_| {
                exceptions.fetch_add(1, Ordering::SeqCst);
            });
        }
        conn.on_end(move || {
            if let Some(tx) = end_tx.lock().take() {
                let _ = tx.send(());
            }
        });

        end_rx.await.unwrap();
        assert_eq!(exceptions.load(Ordering::SeqCst), 0);
        assert!(conn.is_closed());
        assert!(matches!(
            conn.send(&Command::new("PING")).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_protocol_error_fires_exception() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
            let _ = socket.read(&mut buf).await;
            socket.write_all(b"!garbage\r\n").await.unwrap();
            let _ = socket.read(&mut buf).await;
        });

        let conn = Connection::connect(&addr, &ConnectionConfig::default())
            .await
            .unwrap();
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        conn.on_exception(move |err| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(matches!(err, Error::Protocol(_)));
            }
        });

        let result = conn.send(&Command::new("PING")).await;
        assert!(matches!(result, Err(Error::ConnectionClosed)));
        assert!(rx.await.unwrap());
    }
}
