//! Common test utilities: a scripted in-process RESP node

#![allow(dead_code)] // Each test binary uses a different subset

use bytes::BytesMut;
use ferrule_client::{Reply, ReplyParser};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Maps one request (command name upper-cased) to raw reply bytes;
/// an empty reply writes nothing
pub type Handler = Arc<dyn Fn(&[String]) -> Vec<u8> + Send + Sync>;

#[derive(Default)]
struct NodeState {
    log: Vec<Vec<String>>,
    pushers: Vec<mpsc::UnboundedSender<Vec<u8>>>,
    tasks: Vec<JoinHandle<()>>,
}

/// Fake server listening on an ephemeral localhost port
pub struct FakeNode {
    addr: String,
    state: Arc<Mutex<NodeState>>,
}

impl FakeNode {
    pub async fn start(handler: impl Fn(&[String]) -> Vec<u8> + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake node");
        let addr = listener.local_addr().expect("local addr").to_string();
        let state = Arc::new(Mutex::new(NodeState::default()));
        let handler: Handler = Arc::new(handler);

        let accept_state = Arc::clone(&state);
        let accept = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let (push_tx, push_rx) = mpsc::unbounded_channel();
                let task = tokio::spawn(serve(
                    socket,
                    Arc::clone(&handler),
                    Arc::clone(&accept_state),
                    push_rx,
                ));
                let mut state = accept_state.lock();
                state.pushers.push(push_tx);
                state.tasks.push(task);
            }
        });
        state.lock().tasks.push(accept);

        Self { addr, state }
    }

    pub fn addr(&self) -> String {
        self.addr.clone()
    }

    /// Every request received so far, in arrival order
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.state.lock().log.clone()
    }

    /// Number of received requests whose command name is `name`
    pub fn count(&self, name: &str) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|args| args.first().is_some_and(|cmd| cmd.eq_ignore_ascii_case(name)))
            .count()
    }

    /// Write an unsolicited frame to every open client connection
    pub fn push(&self, frame: Vec<u8>) {
        for pusher in &self.state.lock().pushers {
            let _ = pusher.send(frame.clone());
        }
    }

    /// Stop listening and drop every client connection
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        for task in state.tasks.drain(..) {
            task.abort();
        }
        state.pushers.clear();
    }
}

impl Drop for FakeNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn serve(
    socket: TcpStream,
    handler: Handler,
    state: Arc<Mutex<NodeState>>,
    mut push_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let mut parser = ReplyParser::new();
    let (mut reader, mut writer) = socket.into_split();
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            read = reader.read_buf(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
                let mut out = Vec::new();
                while let Ok(Some(request)) = parser.decode(&mut buf) {
                    let args = request_args(request);
                    state.lock().log.push(args.clone());
                    out.extend(handler(args.as_slice()));
                }
                if !out.is_empty() && writer.write_all(&out).await.is_err() {
                    return;
                }
            }
            Some(frame) = push_rx.recv() => {
                if writer.write_all(&frame).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn request_args(request: Reply) -> Vec<String> {
    let mut args: Vec<String> = request
        .into_multi()
        .unwrap_or_default()
        .into_iter()
        .map(|arg| {
            arg.as_bytes()
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default()
        })
        .collect();
    if let Some(name) = args.first_mut() {
        *name = name.to_ascii_uppercase();
    }
    args
}

/// Poll `condition` until it holds, panicking after two seconds
pub async fn eventually(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
}

/// Address nothing listens on
pub async fn dead_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    drop(listener);
    addr
}

/// Reply encoders
pub mod resp {
    pub fn status(text: &str) -> Vec<u8> {
        format!("+{}\r\n", text).into_bytes()
    }

    pub fn ok() -> Vec<u8> {
        status("OK")
    }

    pub fn error(text: &str) -> Vec<u8> {
        format!("-{}\r\n", text).into_bytes()
    }

    pub fn int(n: i64) -> Vec<u8> {
        format!(":{}\r\n", n).into_bytes()
    }

    pub fn bulk(data: &str) -> Vec<u8> {
        format!("${}\r\n{}\r\n", data.len(), data).into_bytes()
    }

    pub fn null() -> Vec<u8> {
        b"$-1\r\n".to_vec()
    }

    pub fn null_array() -> Vec<u8> {
        b"*-1\r\n".to_vec()
    }

    pub fn array(items: Vec<Vec<u8>>) -> Vec<u8> {
        let mut out = format!("*{}\r\n", items.len()).into_bytes();
        for item in items {
            out.extend(item);
        }
        out
    }

    /// `CLUSTER SLOTS` reply; each shard is `(start, end, [addr, ...])`
    pub fn cluster_slots(shards: &[(u16, u16, Vec<String>)]) -> Vec<u8> {
        array(
            shards
                .iter()
                .map(|(start, end, nodes)| {
                    let mut entry = vec![int(i64::from(*start)), int(i64::from(*end))];
                    for addr in nodes {
                        let (host, port) = addr.rsplit_once(':').expect("host:port");
                        entry.push(array(vec![
                            bulk(host),
                            int(port.parse().expect("port")),
                            bulk("0000000000000000000000000000000000000000"),
                        ]));
                    }
                    array(entry)
                })
                .collect(),
        )
    }
}
