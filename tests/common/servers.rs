//! Minimal plugin processes, run as tokio tasks
//!
//! Each server owns its listener and every connection it accepted; stopping
//! it drops them all, which the registry sees exactly like a plugin process
//! exiting.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::{JoinHandle, JoinSet};

/// What a test plugin answers
#[derive(Debug, Clone)]
pub struct Behavior {
    pub name: String,
    pub interfaces: Vec<String>,
    pub api_version: String,
    pub report: Value,
}

impl Behavior {
    pub fn new(name: &str, interfaces: &[&str], api_version: &str) -> Self {
        Self {
            name: name.to_string(),
            interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
            api_version: api_version.to_string(),
            report: json!({}),
        }
    }

    pub fn with_report(mut self, report: Value) -> Self {
        self.report = report;
        self
    }

    fn handshake(&self) -> Value {
        json!({
            "name": self.name,
            "description": format!("test plugin {}", self.name),
            "interfaces": self.interfaces,
            "api_version": self.api_version,
        })
    }
}

#[derive(Default)]
struct Stats {
    handshakes: AtomicUsize,
    reports: AtomicUsize,
    last_metadata: Mutex<BTreeMap<String, String>>,
}

pub struct TestPlugin {
    path: PathBuf,
    behavior: Arc<Mutex<Behavior>>,
    stats: Arc<Stats>,
    task: JoinHandle<()>,
}

impl TestPlugin {
    /// Serve HTTP/1.1 on a new socket at `path`.
    pub fn http(path: &Path, behavior: Behavior) -> TestPlugin {
        Self::spawn(path, behavior, Protocol::Http)
    }

    /// Serve line-delimited JSON-RPC on a new socket at `path`.
    pub fn jsonrpc(path: &Path, behavior: Behavior) -> TestPlugin {
        Self::spawn(path, behavior, Protocol::JsonRpc)
    }

    fn spawn(path: &Path, behavior: Behavior, protocol: Protocol) -> TestPlugin {
        let listener = UnixListener::bind(path).expect("bind plugin socket");
        let behavior = Arc::new(Mutex::new(behavior));
        let stats = Arc::new(Stats::default());
        let task = tokio::spawn(serve(listener, protocol, behavior.clone(), stats.clone()));
        TestPlugin {
            path: path.to_path_buf(),
            behavior,
            stats,
            task,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_api_version(&self, version: &str) {
        self.behavior.lock().unwrap().api_version = version.to_string();
    }

    pub fn set_report(&self, report: Value) {
        self.behavior.lock().unwrap().report = report;
    }

    pub fn handshakes(&self) -> usize {
        self.stats.handshakes.load(Ordering::SeqCst)
    }

    pub fn reports(&self) -> usize {
        self.stats.reports.load(Ordering::SeqCst)
    }

    pub fn last_metadata(&self) -> BTreeMap<String, String> {
        self.stats.last_metadata.lock().unwrap().clone()
    }

    /// Stop serving but leave the socket file behind, like a crashed
    /// process.
    pub fn crash(&self) {
        self.task.abort();
    }

    /// Stop serving and remove the socket file.
    pub fn shutdown(&self) {
        self.task.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for TestPlugin {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Clone, Copy)]
enum Protocol {
    Http,
    JsonRpc,
}

async fn serve(
    listener: UnixListener,
    protocol: Protocol,
    behavior: Arc<Mutex<Behavior>>,
    stats: Arc<Stats>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { return };
                let behavior = behavior.clone();
                let stats = stats.clone();
                match protocol {
                    Protocol::Http => connections.spawn(serve_http(stream, behavior, stats)),
                    Protocol::JsonRpc => connections.spawn(serve_jsonrpc(stream, behavior, stats)),
                };
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
}

fn answer(is_report: bool, query: BTreeMap<String, String>, behavior: &Mutex<Behavior>, stats: &Stats) -> Value {
    let behavior = behavior.lock().unwrap();
    if is_report {
        stats.reports.fetch_add(1, Ordering::SeqCst);
        behavior.report.clone()
    } else {
        stats.handshakes.fetch_add(1, Ordering::SeqCst);
        *stats.last_metadata.lock().unwrap() = query;
        behavior.handshake()
    }
}

async fn serve_http(mut stream: UnixStream, behavior: Arc<Mutex<Behavior>>, stats: Arc<Stats>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    let head = String::from_utf8_lossy(&buf);
    let target = head.split_whitespace().nth(1).unwrap_or("/").to_string();
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (target.clone(), String::new()),
    };
    let params: BTreeMap<String, String> = url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();

    let body = answer(path == "/report", params, &behavior, &stats).to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

async fn serve_jsonrpc(stream: UnixStream, behavior: Arc<Mutex<Behavior>>, stats: Arc<Stats>) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            return;
        };
        let method = request["method"].as_str().unwrap_or_default().to_string();
        let params: BTreeMap<String, String> =
            serde_json::from_value(request["params"][0].clone()).unwrap_or_default();
        let result = answer(method == "Plugin.Report", params, &behavior, &stats);
        let reply = json!({"id": request["id"], "result": result, "error": null});
        let mut bytes = reply.to_string().into_bytes();
        bytes.push(b'\n');
        if write.write_all(&bytes).await.is_err() {
            return;
        }
    }
}
