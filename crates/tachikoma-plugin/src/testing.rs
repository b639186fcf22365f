//! Scripted in-memory plugins for unit tests.

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};

use crate::protocol::Notification;
use crate::Process;

const DUPLEX_BUFFER: usize = 64 * 1024;

/// Requests seen by a scripted plugin.
#[derive(Clone, Default)]
pub(crate) struct FakeHandle {
    requests: Arc<Mutex<Vec<Value>>>,
}

impl FakeHandle {
    pub(crate) fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn methods(&self) -> Vec<String> {
        self.requests()
            .iter()
            .map(|r| request_method(r).to_string())
            .collect()
    }

    pub(crate) fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

/// A process whose plugin answers each request with the lines `handler` returns.
pub(crate) fn connect<F>(name: &str, mut handler: F) -> (Process, FakeHandle)
where
    F: FnMut(&Value) -> Vec<Value> + Send + 'static,
{
    let (process, mut plugin) = pair(name);
    let handle = FakeHandle::default();
    let requests = Arc::clone(&handle.requests);

    tokio::spawn(async move {
        while let Some(request) = plugin.try_next_request().await {
            requests.lock().unwrap().push(request.clone());
            for line in handler(&request) {
                plugin.send(&line).await;
            }
        }
    });

    (process, handle)
}

/// A process and the plugin end of its pipes, driven by hand.
pub(crate) fn pair(name: &str) -> (Process, PluginSide) {
    let (host, plugin) = tokio::io::duplex(DUPLEX_BUFFER);
    let (host_read, host_write) = tokio::io::split(host);
    let (plugin_read, plugin_write) = tokio::io::split(plugin);

    let process = Process::connect(name, host_read, host_write);
    let side = PluginSide {
        lines: BufReader::new(plugin_read).lines(),
        writer: plugin_write,
    };
    (process, side)
}

/// Plugin end of an in-memory transport.
pub(crate) struct PluginSide {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl PluginSide {
    /// Next request from the host; `None` once the host closed stdin.
    pub(crate) async fn try_next_request(&mut self) -> Option<Value> {
        let line = self.lines.next_line().await.ok()??;
        Some(serde_json::from_str(&line).expect("host sent invalid JSON"))
    }

    pub(crate) async fn next_request(&mut self) -> Value {
        self.try_next_request().await.expect("host closed the pipe")
    }

    pub(crate) async fn send(&mut self, message: &Value) {
        self.send_raw(&message.to_string()).await;
    }

    pub(crate) async fn send_raw(&mut self, line: &str) {
        // The host may already be gone; tests assert on the host side.
        let _ = self.writer.write_all(format!("{line}\n").as_bytes()).await;
    }
}

pub(crate) fn request_id(request: &Value) -> i64 {
    request["id"].as_i64().expect("request without id")
}

pub(crate) fn request_method(request: &Value) -> &str {
    request["method"].as_str().unwrap_or_default()
}

/// Successful response to `request`.
pub(crate) fn reply(request: &Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": request_id(request), "result": result})
}

/// Stream notification carrying `params`.
pub(crate) fn notification(params: Value) -> Value {
    serde_json::to_value(Notification::new("stream", Some(params))).unwrap()
}
