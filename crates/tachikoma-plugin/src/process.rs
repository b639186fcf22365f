//! Plugin process transport
//!
//! A [`Process`] owns one plugin child and turns its stdio into two
//! primitives: [`Process::call`] for request/response and [`Process::stream`]
//! for notification streams. A single reader task per process routes every
//! line it reads from the child.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::codec::{Decoder, FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::protocol::{methods, IncomingMessage, Request, Response, StreamEvent};
use crate::{Manifest, PluginError, Result};

/// Grace period for a plugin to exit after `shutdown` before it is killed.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest line accepted from a plugin (1 MB).
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Buffered events per stream consumer, on each side of its forwarder.
const STREAM_BUFFER: usize = 64;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Waiting side of an in-flight request.
enum Slot {
    Call(oneshot::Sender<Response>),
    /// Request that opened the stream with this subscriber id
    Stream(u64),
}

/// State shared between a [`Process`] handle and its reader task.
struct Shared {
    name: String,
    pending: Mutex<HashMap<i64, Slot>>,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Value>>>,
    /// Cancelled once the reader task has finished
    exited: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn new(name: String) -> Self {
        Self {
            name,
            pending: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            exited: CancellationToken::new(),
        }
    }

    fn dispatch(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let message: IncomingMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                debug!(plugin = %self.name, error = %e, "dropping malformed line");
                return;
            }
        };

        if let Some(id) = message.id {
            let slot = lock(&self.pending).remove(&id);
            match slot {
                Some(Slot::Call(tx)) => {
                    // The caller may have given up already.
                    let _ = tx.send(message.into_response(id));
                    return;
                }
                Some(Slot::Stream(subscriber)) => {
                    self.acknowledge_stream(subscriber, message);
                    return;
                }
                None => {}
            }
        }

        self.notify(message);
    }

    fn notify(&self, message: IncomingMessage) {
        let Some(method) = message.method.as_deref() else {
            debug!(plugin = %self.name, id = ?message.id, "dropping unexpected message");
            return;
        };
        let Some(params) = message.params else {
            trace!(plugin = %self.name, method, "notification without params");
            return;
        };

        let mut subscribers = lock(&self.subscribers);
        if subscribers.is_empty() {
            debug!(plugin = %self.name, method, "notification with no active stream");
            return;
        }

        // The reader never waits on a consumer. A lagging one loses events,
        // and a terminal event it has no room for ends its stream instead.
        let terminal = StreamEvent::is_terminal_value(&params);
        subscribers.retain(|&subscriber, tx| match tx.try_send(params.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) if terminal => {
                warn!(plugin = %self.name, subscriber, "stream consumer lagging, closing stream");
                false
            }
            Err(TrySendError::Full(_)) => {
                warn!(plugin = %self.name, subscriber, "stream consumer lagging, dropping event");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// An error reply to a stream request ends that stream.
    fn acknowledge_stream(&self, subscriber: u64, message: IncomingMessage) {
        let Some(error) = message.error else {
            trace!(plugin = %self.name, subscriber, "stream request acknowledged");
            return;
        };
        let event = json!({
            "type": "error",
            "data": { "message": error.message, "code": error.code },
        });
        let mut subscribers = lock(&self.subscribers);
        if let Some(tx) = subscribers.get(&subscriber) {
            if tx.try_send(event).is_err() {
                subscribers.remove(&subscriber);
            }
        }
    }

    fn release_stream(&self, subscriber: u64, request_id: i64) {
        lock(&self.subscribers).remove(&subscriber);
        let mut pending = lock(&self.pending);
        if matches!(pending.get(&request_id), Some(Slot::Stream(_))) {
            pending.remove(&request_id);
        }
    }

    /// Wake every waiter; dropping the senders is the wake-up.
    fn close(&self) {
        lock(&self.pending).clear();
        lock(&self.subscribers).clear();
        self.exited.cancel();
    }
}

/// Removes a call's slot on every exit path, including a dropped future.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: i64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.shared.pending).remove(&self.id);
    }
}

/// Subscriber and request slot of one stream, released when dropped.
struct StreamRegistration {
    shared: Arc<Shared>,
    subscriber: u64,
    request_id: i64,
}

impl Drop for StreamRegistration {
    fn drop(&mut self) {
        self.shared.release_stream(self.subscriber, self.request_id);
    }
}

/// One live plugin and its JSON-RPC transport.
pub struct Process {
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<Option<FramedWrite<BoxedWriter, LinesCodec>>>,
    child: tokio::sync::Mutex<Option<Child>>,
    pid: Option<u32>,
    reader: Mutex<Option<JoinHandle<()>>>,
    /// Tells the reader task to quit
    shutdown: CancellationToken,
    /// Aborts writes still waiting on a plugin that stopped reading
    closing: CancellationToken,
    next_id: AtomicI64,
    next_subscriber: AtomicU64,
    stopping: AtomicBool,
    stopped: CancellationToken,
    stop_timeout: Duration,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("name", &self.shared.name)
            .field("pid", &self.pid)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Process {
    /// Start the plugin executable described by `manifest`.
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip(manifest), fields(plugin = %manifest.name))]
    pub fn spawn(manifest: &Manifest) -> Result<Self> {
        let (program, args) = resolve_executable(manifest)?;

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !manifest.dir.as_os_str().is_empty() {
            cmd.current_dir(&manifest.dir);
        }

        let mut child = cmd.spawn().map_err(|source| PluginError::Spawn {
            plugin: manifest.name.clone(),
            source,
        })?;

        let missing_pipe = |pipe: &str| PluginError::Spawn {
            plugin: manifest.name.clone(),
            source: std::io::Error::other(format!("{pipe} was not captured")),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(manifest.name.clone(), stderr));
        }

        debug!(pid = ?child.id(), program = %program.display(), "plugin process started");

        Ok(Self::from_parts(
            manifest.name.clone(),
            Box::new(stdout),
            Box::new(stdin),
            Some(child),
        ))
    }

    /// Run the protocol over an arbitrary byte stream pair instead of a child.
    ///
    /// `reader` carries plugin output and `writer` carries host requests.
    pub fn connect<R, W>(name: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::from_parts(name.into(), Box::new(reader), Box::new(writer), None)
    }

    fn from_parts(
        name: String,
        reader: BoxedReader,
        writer: BoxedWriter,
        child: Option<Child>,
    ) -> Self {
        let shared = Arc::new(Shared::new(name));
        let shutdown = CancellationToken::new();
        let pid = child.as_ref().and_then(Child::id);
        let reader = tokio::spawn(read_loop(Arc::clone(&shared), reader, shutdown.clone()));

        Self {
            shared,
            writer: tokio::sync::Mutex::new(Some(FramedWrite::new(writer, LinesCodec::new()))),
            child: tokio::sync::Mutex::new(child),
            pid,
            reader: Mutex::new(Some(reader)),
            shutdown,
            closing: CancellationToken::new(),
            next_id: AtomicI64::new(1),
            next_subscriber: AtomicU64::new(1),
            stopping: AtomicBool::new(false),
            stopped: CancellationToken::new(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    /// Override the grace period used by [`Process::stop`].
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// OS process id, if this transport wraps a child.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// False once stopping has begun or the plugin closed its output.
    pub fn is_running(&self) -> bool {
        !self.stopping.load(Ordering::SeqCst) && !self.shared.exited.is_cancelled()
    }

    /// Wait until the reader task has finished.
    pub async fn exited(&self) {
        self.shared.exited.cancelled().await;
    }

    /// Call `method` and decode its result.
    pub async fn call<P, R>(&self, cancel: &CancellationToken, method: &str, params: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let value = self.call_raw(cancel, method, params).await?;
        serde_json::from_value(value).map_err(|source| PluginError::InvalidResponse {
            method: method.to_string(),
            source,
        })
    }

    /// Call `method` and return the raw result.
    ///
    /// Waits until the reply arrives, `cancel` fires or the plugin exits. A
    /// `null` params value is omitted from the request.
    #[instrument(skip(self, cancel, params), fields(plugin = %self.name()))]
    pub async fn call_raw<P: Serialize>(
        &self,
        cancel: &CancellationToken,
        method: &str,
        params: P,
    ) -> Result<Value> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(PluginError::Stopping(self.name().to_string()));
        }
        self.request(cancel, method, params).await
    }

    async fn request<P: Serialize>(
        &self,
        cancel: &CancellationToken,
        method: &str,
        params: P,
    ) -> Result<Value> {
        if self.shared.exited.is_cancelled() {
            return Err(PluginError::ProcessExited(self.name().to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(id, Slot::Call(tx));
        let _guard = PendingGuard {
            shared: self.shared.as_ref(),
            id,
        };

        self.send(cancel, id, method, params).await?;
        trace!(id, method, "request sent");

        tokio::select! {
            biased;
            response = rx => match response {
                Ok(response) => response.into_result().map_err(|error| PluginError::Rpc {
                    method: method.to_string(),
                    error,
                }),
                Err(_) => Err(PluginError::ProcessExited(self.name().to_string())),
            },
            _ = cancel.cancelled() => Err(PluginError::Cancelled),
            _ = self.shared.exited.cancelled() => {
                Err(PluginError::ProcessExited(self.name().to_string()))
            }
        }
    }

    /// Send `method` and forward every later notification's params.
    ///
    /// The channel closes after a `complete` or `error` event, when `cancel`
    /// fires, or when the plugin exits. Notifications carry no request id, so
    /// concurrent streams on one process all see the same events.
    #[instrument(skip(self, cancel, params), fields(plugin = %self.name()))]
    pub async fn stream<P: Serialize>(
        &self,
        cancel: CancellationToken,
        method: &str,
        params: P,
    ) -> Result<mpsc::Receiver<Value>> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(PluginError::Stopping(self.name().to_string()));
        }
        if self.shared.exited.is_cancelled() {
            return Err(PluginError::ProcessExited(self.name().to_string()));
        }

        let subscriber = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (events_tx, mut events_rx) = mpsc::channel(STREAM_BUFFER);
        lock(&self.shared.subscribers).insert(subscriber, events_tx);
        lock(&self.shared.pending).insert(request_id, Slot::Stream(subscriber));
        let registration = StreamRegistration {
            shared: Arc::clone(&self.shared),
            subscriber,
            request_id,
        };

        self.send(&cancel, request_id, method, params).await?;
        debug!(method, request_id, "stream opened");

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            let _registration = registration;
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events_rx.recv() => event,
                };
                let Some(event) = event else { break };
                let terminal = StreamEvent::is_terminal_value(&event);

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    sent = tx.send(event) => if sent.is_err() { break },
                }
                if terminal {
                    break;
                }
            }
        });

        Ok(rx)
    }

    /// Write one request line.
    ///
    /// Waiting for the writer and the write itself both give up on `cancel`,
    /// on plugin exit and once [`Process::stop`] closes the pipe. An abandoned
    /// write leaves its line buffered and the next send flushes it first.
    async fn send<P: Serialize>(
        &self,
        cancel: &CancellationToken,
        id: i64,
        method: &str,
        params: P,
    ) -> Result<()> {
        let params = serde_json::to_value(params)?;
        let line = serde_json::to_string(&Request::new(id, method, params))?;

        let write = async {
            let mut writer = self.writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                return Err(PluginError::Stopping(self.name().to_string()));
            };
            writer.send(line).await.map_err(|e| match e {
                LinesCodecError::Io(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    PluginError::ProcessExited(self.name().to_string())
                }
                LinesCodecError::Io(e) => PluginError::Io(e),
                LinesCodecError::MaxLineLengthExceeded => {
                    PluginError::Io(std::io::Error::other("request line too long"))
                }
            })
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PluginError::Cancelled),
            _ = self.closing.cancelled() => Err(PluginError::Stopping(self.name().to_string())),
            _ = self.shared.exited.cancelled() => {
                Err(PluginError::ProcessExited(self.name().to_string()))
            }
            written = write => written,
        }
    }

    /// Shut the plugin down.
    ///
    /// Sends `shutdown`, closes stdin and waits for the child to exit. One grace
    /// period covers all of it; a child still running at its end is killed.
    /// Safe to call more than once.
    #[instrument(skip(self), fields(plugin = %self.name()))]
    pub async fn stop(&self) -> Result<()> {
        if self.stopping.swap(true, Ordering::SeqCst) {
            self.stopped.cancelled().await;
            return Ok(());
        }

        let result = self.shutdown_sequence().await;
        self.stopped.cancel();
        result
    }

    async fn shutdown_sequence(&self) -> Result<()> {
        let deadline = Instant::now() + self.stop_timeout;

        if !self.shared.exited.is_cancelled() {
            let cancel = CancellationToken::new();
            let ack = self.request(&cancel, methods::SHUTDOWN, Value::Null);
            match timeout_at(deadline, ack).await {
                Ok(Ok(_)) => debug!("shutdown acknowledged"),
                Ok(Err(e)) => warn!(error = %e, "shutdown request failed"),
                Err(_) => warn!(timeout = ?self.stop_timeout, "no reply to shutdown"),
            }
        }

        self.closing.cancel();
        match timeout_at(deadline, self.writer.lock()).await {
            Ok(mut slot) => {
                if let Some(mut writer) = slot.take() {
                    if timeout_at(deadline, SinkExt::<String>::close(&mut writer)).await.is_err() {
                        debug!("plugin stdin still full at the deadline");
                    }
                }
            }
            Err(_) => debug!("writer still busy at the deadline"),
        }

        let mut result = Ok(());
        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match timeout_at(deadline, child.wait()).await {
                Ok(Ok(status)) => debug!(%status, "plugin exited"),
                Ok(Err(e)) => result = Err(PluginError::Io(e)),
                Err(_) => {
                    warn!(timeout = ?self.stop_timeout, "plugin did not exit, killing");
                    if let Err(e) = child.kill().await {
                        result = Err(PluginError::Io(e));
                    }
                }
            }
        }

        self.shutdown.cancel();
        let reader = lock(&self.reader).take();
        if let Some(reader) = reader {
            let _ = reader.await;
        }

        result
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    #[cfg(test)]
    pub(crate) fn subscriber_len(&self) -> usize {
        lock(&self.shared.subscribers).len()
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// One frame of plugin output.
#[derive(Debug, PartialEq)]
enum OutputLine {
    Text(String),
    /// A line longer than the limit; its bytes are skipped up to the next newline
    Oversized,
}

/// Newline framing for plugin output.
///
/// `FramedRead` ends the stream after any decoder error, so an oversized line
/// is reported as a frame rather than as [`LinesCodecError::MaxLineLengthExceeded`].
struct OutputCodec(LinesCodec);

impl OutputCodec {
    fn new(max_length: usize) -> Self {
        Self(LinesCodec::new_with_max_length(max_length))
    }

    fn frame(
        decoded: std::result::Result<Option<String>, LinesCodecError>,
    ) -> std::result::Result<Option<OutputLine>, LinesCodecError> {
        match decoded {
            Ok(line) => Ok(line.map(OutputLine::Text)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(OutputLine::Oversized)),
            Err(e) => Err(e),
        }
    }
}

impl Decoder for OutputCodec {
    type Item = OutputLine;
    type Error = LinesCodecError;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> std::result::Result<Option<OutputLine>, LinesCodecError> {
        Self::frame(self.0.decode(buf))
    }

    fn decode_eof(
        &mut self,
        buf: &mut BytesMut,
    ) -> std::result::Result<Option<OutputLine>, LinesCodecError> {
        Self::frame(self.0.decode_eof(buf))
    }
}

async fn read_loop(shared: Arc<Shared>, reader: BoxedReader, shutdown: CancellationToken) {
    let mut lines = FramedRead::new(reader, OutputCodec::new(MAX_LINE_BYTES));

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = lines.next() => next,
        };
        match next {
            Some(Ok(OutputLine::Text(line))) => shared.dispatch(&line),
            Some(Ok(OutputLine::Oversized)) => {
                warn!(plugin = %shared.name, max = MAX_LINE_BYTES, "dropping oversized line");
            }
            Some(Err(e)) => {
                debug!(plugin = %shared.name, error = %e, "plugin output closed with error");
                break;
            }
            None => break,
        }
    }

    debug!(plugin = %shared.name, "reader finished");
    shared.close();
}

async fn log_stderr(name: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(plugin = %name, "stderr: {}", line);
    }
}

/// Program and arguments to start a plugin.
///
/// A bare command name is looked up on `PATH`. Relative paths resolve against
/// the plugin directory and must stay inside it.
pub fn resolve_executable(manifest: &Manifest) -> Result<(PathBuf, Vec<String>)> {
    if let Some((program, args)) = manifest.executable.command.split_first() {
        let path = Path::new(program);
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else if is_bare_name(path) {
            which::which(program).map_err(|_| PluginError::ExecutableNotFound {
                plugin: manifest.name.clone(),
                executable: program.clone(),
            })?
        } else {
            resolve_in_dir(manifest, path)?
        };
        return Ok((resolved, args.to_vec()));
    }

    let raw = manifest.executable.path.as_deref().unwrap_or_default();
    if raw.is_empty() {
        return Err(PluginError::ExecutableNotFound {
            plugin: manifest.name.clone(),
            executable: String::new(),
        });
    }
    let path = Path::new(raw);
    let resolved = if path.is_absolute() {
        path.to_path_buf()
    } else {
        resolve_in_dir(manifest, path)?
    };
    Ok((resolved, Vec::new()))
}

fn is_bare_name(path: &Path) -> bool {
    let mut components = path.components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn resolve_in_dir(manifest: &Manifest, relative: &Path) -> Result<PathBuf> {
    let not_found = || PluginError::ExecutableNotFound {
        plugin: manifest.name.clone(),
        executable: relative.display().to_string(),
    };

    let dir = if manifest.dir.as_os_str().is_empty() {
        Path::new(".")
    } else {
        manifest.dir.as_path()
    };
    let dir = dir.canonicalize().map_err(|_| not_found())?;
    let candidate = dir.join(relative).canonicalize().map_err(|_| not_found())?;

    if !candidate.starts_with(&dir) {
        return Err(PluginError::ExecutableEscapesPluginDir {
            plugin: manifest.name.clone(),
            executable: relative.display().to_string(),
        });
    }
    Ok(candidate)
}
