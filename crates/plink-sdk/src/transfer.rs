//! Concurrent file transfer coordination.
//!
//! At most one transfer runs per storage; the rest wait in an unbounded
//! pending queue. Each running transfer is a tokio task working in bounded
//! chunks so throttling applies smoothly and cancellation is observed within
//! one chunk interval. Completion fsyncs the target, folds it into the
//! filesystem tree and emits `FILE_CHANGED` before `TRANSFER_FINISHED`.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use plink_files::{now_timestamp, EventSink, Filesystem};
use plink_protocol::{
    Event, EventKind, FileChangeKind, Source, TransferKind, TransferState,
};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::SdkError;
use crate::transport::{HttpRequest, HttpTransport};

/// A transfer with no byte movement for this long fails with `read_timeout`.
/// Tunable via `PLINK_INACTIVITY_TIMEOUT_SECS`.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

fn inactivity_timeout() -> Duration {
    std::env::var("PLINK_INACTIVITY_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs.max(1)))
        .unwrap_or(INACTIVITY_TIMEOUT)
}

/// Progress events per transfer are spaced at least this far apart.
pub const TRANSFER_INFO_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on uninterruptible work inside a worker.
pub const CHUNK_INTERVAL: Duration = Duration::from_millis(250);

/// Upload chunk size; one cancellation check per chunk.
const UPLOAD_CHUNK: usize = 64 * 1024;

const VALID_DOWNLOAD_TYPES: &[&str] = &[
    "application/gcode",
    "text/plain",
    "application/binary",
    "application/octet-stream",
];

fn upload_timeout() -> Duration {
    let secs = std::env::var("PLINK_UPLOAD_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(300);
    Duration::from_secs(secs.max(1))
}

/// Connection details provider: current server url plus auth headers.
pub type ConnDetailsFn = Arc<dyn Fn() -> (Option<String>, Vec<(String, String)>) + Send + Sync>;

/// Physical path of the file currently being printed, if any.
pub type PrintedFileFn = Arc<dyn Fn() -> Option<PathBuf> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct TransferRequest {
    pub kind: TransferKind,
    /// Source url for downloads, destination url for uploads.
    pub url: Option<String>,
    /// Virtual path: destination for downloads, source for uploads.
    pub path: String,
    pub to_print: bool,
    pub to_select: bool,
    pub command_id: Option<u32>,
    pub throttle_bytes_per_second: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct TransferSnapshot {
    pub transfer_id: u32,
    pub kind: TransferKind,
    pub state: TransferState,
    pub url: Option<String>,
    pub path: String,
    pub transferred: u64,
    pub total: Option<u64>,
    pub to_print: bool,
    pub to_select: bool,
    pub command_id: Option<u32>,
    pub elapsed: Duration,
}

impl TransferSnapshot {
    pub fn progress(&self) -> f64 {
        match self.total {
            Some(total) if total > 0 => (self.transferred as f64 / total as f64) * 100.0,
            _ => 0.0,
        }
    }

    /// Estimated seconds to completion; `-1` when unknown, `0` once terminal.
    pub fn time_remaining(&self) -> i64 {
        if self.state.is_terminal() {
            return 0;
        }
        let Some(total) = self.total else { return -1 };
        if self.transferred == 0 {
            return -1;
        }
        let elapsed = self.elapsed.as_secs_f64();
        let remaining = total.saturating_sub(self.transferred) as f64;
        (elapsed * remaining / self.transferred as f64) as i64
    }

    pub fn to_payload(&self) -> Map<String, Value> {
        let mut data = Map::new();
        data.insert(
            "type".into(),
            serde_json::to_value(self.kind).unwrap_or(Value::Null),
        );
        data.insert(
            "state".into(),
            serde_json::to_value(self.state).unwrap_or(Value::Null),
        );
        data.insert("transfer_id".into(), self.transfer_id.into());
        if let Some(url) = &self.url {
            data.insert("url".into(), url.clone().into());
        }
        data.insert("path".into(), self.path.clone().into());
        data.insert("transferred".into(), self.transferred.into());
        if let Some(total) = self.total {
            data.insert("size".into(), total.into());
        }
        data.insert(
            "progress".into(),
            json!((self.progress() * 100.0).round() / 100.0),
        );
        data.insert("time_remaining".into(), self.time_remaining().into());
        data.insert("to_print".into(), self.to_print.into());
        data.insert("to_select".into(), self.to_select.into());
        data
    }
}

struct Progress {
    transferred: AtomicU64,
    total: Mutex<Option<u64>>,
    /// Bytes per second; 0 means unlimited. Mutable at runtime.
    throttle: AtomicU64,
    state: Mutex<TransferState>,
    started_at: Instant,
}

impl Progress {
    fn new(throttle: Option<u64>) -> Self {
        Self {
            transferred: AtomicU64::new(0),
            total: Mutex::new(None),
            throttle: AtomicU64::new(throttle.unwrap_or(0)),
            state: Mutex::new(TransferState::Running),
            started_at: Instant::now(),
        }
    }

    fn set_state(&self, state: TransferState) {
        *self.state.lock().expect("transfer state") = state;
    }

    fn state(&self) -> TransferState {
        *self.state.lock().expect("transfer state")
    }
}

struct ActiveTransfer {
    id: u32,
    storage: String,
    request: TransferRequest,
    progress: Arc<Progress>,
    cancel: CancellationToken,
    abort_reason: Mutex<Option<String>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ActiveTransfer {
    fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            transfer_id: self.id,
            kind: self.request.kind,
            state: self.progress.state(),
            url: self.request.url.clone(),
            path: self.request.path.clone(),
            transferred: self.progress.transferred.load(Ordering::Relaxed),
            total: *self.progress.total.lock().expect("transfer total"),
            to_print: self.request.to_print,
            to_select: self.request.to_select,
            command_id: self.request.command_id,
            elapsed: self.progress.started_at.elapsed(),
        }
    }
}

struct PendingTransfer {
    id: u32,
    storage: String,
    request: TransferRequest,
}

struct TransferInner {
    fs: Arc<Filesystem>,
    transport: Arc<dyn HttpTransport>,
    sink: Mutex<Option<EventSink>>,
    conn_details: Mutex<Option<ConnDetailsFn>>,
    printed_file: Mutex<Option<PrintedFileFn>>,
    active: Mutex<HashMap<String, Arc<ActiveTransfer>>>,
    pending: Mutex<VecDeque<PendingTransfer>>,
    notify: tokio::sync::Notify,
    next_id: AtomicU32,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct TransferManager {
    inner: Arc<TransferInner>,
}

impl TransferManager {
    pub fn new(
        fs: Arc<Filesystem>,
        transport: Arc<dyn HttpTransport>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(TransferInner {
                fs,
                transport,
                sink: Mutex::new(None),
                conn_details: Mutex::new(None),
                printed_file: Mutex::new(None),
                active: Mutex::new(HashMap::new()),
                pending: Mutex::new(VecDeque::new()),
                notify: tokio::sync::Notify::new(),
                next_id: AtomicU32::new(0),
                shutdown,
            }),
        }
    }

    pub fn set_event_sink(&self, sink: EventSink) {
        *self.inner.sink.lock().expect("sink lock") = Some(sink);
    }

    pub fn set_connection_details(&self, details: ConnDetailsFn) {
        *self.inner.conn_details.lock().expect("conn lock") = Some(details);
    }

    pub fn set_printed_file_cb(&self, cb: PrintedFileFn) {
        *self.inner.printed_file.lock().expect("printed lock") = Some(cb);
    }

    fn emit(&self, event: Event) {
        self.inner.emit(event);
    }

    /// Enqueue a transfer. Validates the virtual destination up front and
    /// returns the assigned transfer id; the scheduler starts it as soon as
    /// its storage is free.
    pub fn start(&self, request: TransferRequest) -> Result<u32, SdkError> {
        let storage = self.inner.fs.storage_of(&request.path)?;
        self.inner.fs.to_os_path(&request.path)?;
        if request.kind.is_download() && request.url.is_none() {
            return Err(SdkError::TransferAborted("download without source url".into()));
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        metrics::counter!("plink_transfers_started_total").increment(1);
        info!(
            "transfer {id} enqueued: {:?} {} (storage {storage})",
            request.kind, request.path
        );
        self.inner.pending.lock().expect("pending lock").push_back(PendingTransfer {
            id,
            storage,
            request,
        });
        self.inner.notify.notify_one();
        Ok(id)
    }

    /// Snapshot of the running transfers followed by the pending queue.
    pub fn snapshots(&self) -> Vec<TransferSnapshot> {
        let mut out: Vec<TransferSnapshot> = self
            .inner
            .active
            .lock()
            .expect("active lock")
            .values()
            .map(|active| active.snapshot())
            .collect();
        out.sort_by_key(|snapshot| snapshot.transfer_id);
        for pending in self.inner.pending.lock().expect("pending lock").iter() {
            out.push(TransferSnapshot {
                transfer_id: pending.id,
                kind: pending.request.kind,
                state: TransferState::Enqueued,
                url: pending.request.url.clone(),
                path: pending.request.path.clone(),
                transferred: 0,
                total: None,
                to_print: pending.request.to_print,
                to_select: pending.request.to_select,
                command_id: pending.request.command_id,
                elapsed: Duration::ZERO,
            });
        }
        out
    }

    /// The transfer the service most likely asks about: oldest running one.
    pub fn current(&self) -> Option<TransferSnapshot> {
        self.snapshots()
            .into_iter()
            .find(|snapshot| !snapshot.state.is_terminal())
    }

    /// Change the rate limit of a transfer at runtime. `None` lifts it.
    pub fn set_throttle(&self, transfer_id: u32, bytes_per_second: Option<u64>) -> bool {
        let rate = bytes_per_second.unwrap_or(0);
        for active in self.inner.active.lock().expect("active lock").values() {
            if active.id == transfer_id {
                active.progress.throttle.store(rate, Ordering::Relaxed);
                return true;
            }
        }
        for pending in self.inner.pending.lock().expect("pending lock").iter_mut() {
            if pending.id == transfer_id {
                pending.request.throttle_bytes_per_second = bytes_per_second;
                return true;
            }
        }
        false
    }

    /// Abort one transfer (running or pending) with `reason`.
    pub fn stop(&self, transfer_id: u32, reason: &str) -> bool {
        {
            let active = self.inner.active.lock().expect("active lock");
            for transfer in active.values() {
                if transfer.id == transfer_id {
                    *transfer.abort_reason.lock().expect("reason lock") = Some(reason.to_string());
                    transfer.cancel.cancel();
                    return true;
                }
            }
        }
        let removed = {
            let mut pending = self.inner.pending.lock().expect("pending lock");
            let pos = pending.iter().position(|p| p.id == transfer_id);
            pos.and_then(|pos| pending.remove(pos))
        };
        if let Some(removed) = removed {
            self.emit(
                Event::new(EventKind::TransferAborted, Source::Connect)
                    .with_transfer_id(removed.id)
                    .with_reason(reason)
                    .with_data("path", json!(removed.request.path)),
            );
            return true;
        }
        false
    }

    /// Abort every running and pending transfer.
    pub fn stop_all(&self, reason: &str) {
        let ids: Vec<u32> = {
            let active = self.inner.active.lock().expect("active lock");
            let pending = self.inner.pending.lock().expect("pending lock");
            active
                .values()
                .map(|t| t.id)
                .chain(pending.iter().map(|p| p.id))
                .collect()
        };
        for id in ids {
            self.stop(id, reason);
        }
    }

    /// Called when a path disappears under a transfer; the worker aborts
    /// with reason `deleted` within one chunk interval.
    pub fn on_path_deleted(&self, path: &str) {
        let ids: Vec<u32> = self
            .inner
            .active
            .lock()
            .expect("active lock")
            .values()
            .filter(|t| t.request.path == path)
            .map(|t| t.id)
            .collect();
        for id in ids {
            self.stop(id, "deleted");
        }
    }

    /// Wait until every worker task has observed shutdown and exited.
    pub async fn join_all(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let active = self.inner.active.lock().expect("active lock");
            active
                .values()
                .filter_map(|t| t.task.lock().expect("task lock").take())
                .collect()
        };
        for task in tasks {
            if let Err(err) = task.await {
                warn!("transfer worker join error: {err}");
            }
        }
    }

    /// Scheduler: promote pending transfers onto free storages until the
    /// shutdown token fires.
    pub async fn run(&self) {
        loop {
            if self.inner.shutdown.is_cancelled() {
                break;
            }
            self.schedule_ready();
            tokio::select! {
                _ = self.inner.notify.notified() => {}
                _ = self.inner.shutdown.cancelled() => break,
                _ = tokio::time::sleep(CHUNK_INTERVAL) => {}
            }
        }
        self.stop_all("shutdown");
        self.join_all().await;
    }

    fn schedule_ready(&self) {
        loop {
            let next = {
                let active = self.inner.active.lock().expect("active lock");
                let mut pending = self.inner.pending.lock().expect("pending lock");
                let pos = pending
                    .iter()
                    .position(|p| !active.contains_key(&p.storage));
                pos.and_then(|pos| pending.remove(pos))
            };
            let Some(next) = next else { break };
            self.spawn_worker(next);
        }
    }

    fn spawn_worker(&self, pending: PendingTransfer) {
        let cancel = self.inner.shutdown.child_token();
        let active = Arc::new(ActiveTransfer {
            id: pending.id,
            storage: pending.storage.clone(),
            progress: Arc::new(Progress::new(pending.request.throttle_bytes_per_second)),
            request: pending.request,
            cancel,
            abort_reason: Mutex::new(None),
            task: Mutex::new(None),
        });
        self.inner
            .active
            .lock()
            .expect("active lock")
            .insert(pending.storage, active.clone());
        let inner = self.inner.clone();
        let worker = active.clone();
        let task = tokio::spawn(async move {
            let outcome = if worker.request.kind.is_download() {
                run_download(&inner, &worker).await
            } else {
                run_upload(&inner, &worker).await
            };
            finish_worker(&inner, &worker, outcome).await;
        });
        *active.task.lock().expect("task lock") = Some(task);
    }
}

impl TransferInner {
    fn emit(&self, event: Event) {
        if let Some(sink) = self.sink.lock().expect("sink lock").as_ref() {
            sink(event);
        }
    }

    fn auth_headers_for(&self, url: &str) -> Vec<(String, String)> {
        let details = self.conn_details.lock().expect("conn lock").clone();
        let Some(details) = details else {
            return Vec::new();
        };
        let (server, headers) = details();
        match server {
            // Auth headers only travel to our own server.
            Some(server) if url.to_lowercase().starts_with(&server.to_lowercase()) => headers,
            _ => Vec::new(),
        }
    }
}

enum Outcome {
    Finished,
    Aborted { reason: String },
    Failed { reason: String },
}

/// Pacing state for one worker; refills at the configured rate with a bucket
/// one second deep. Runs on the tokio clock so paused-time tests advance it.
struct Throttle {
    allowance: f64,
    refilled_at: tokio::time::Instant,
}

impl Throttle {
    fn new() -> Self {
        Self {
            allowance: 0.0,
            refilled_at: tokio::time::Instant::now(),
        }
    }

    /// Account `bytes` against the current rate, sleeping off any debt in
    /// cancellation-sized slices. Returns `false` when cancelled mid-sleep.
    async fn pace(&mut self, bytes: u64, rate: u64, cancel: &CancellationToken) -> bool {
        if rate == 0 {
            self.allowance = 0.0;
            self.refilled_at = tokio::time::Instant::now();
            return true;
        }
        let rate_f = rate as f64;
        let now = tokio::time::Instant::now();
        self.allowance += now.duration_since(self.refilled_at).as_secs_f64() * rate_f;
        self.allowance = self.allowance.min(rate_f);
        self.refilled_at = now;
        self.allowance -= bytes as f64;
        while self.allowance < 0.0 {
            let debt = Duration::from_secs_f64((-self.allowance / rate_f).min(10.0));
            let slice = debt.min(CHUNK_INTERVAL);
            tokio::select! {
                _ = tokio::time::sleep(slice) => {}
                _ = cancel.cancelled() => return false,
            }
            let now = tokio::time::Instant::now();
            self.allowance += now.duration_since(self.refilled_at).as_secs_f64() * rate_f;
            self.refilled_at = now;
        }
        true
    }
}

fn part_path(os_path: &std::path::Path) -> PathBuf {
    let base = os_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    os_path.with_file_name(format!(".{base}.part"))
}

fn abort_reason(worker: &ActiveTransfer) -> String {
    worker
        .abort_reason
        .lock()
        .expect("reason lock")
        .clone()
        .unwrap_or_else(|| "stopped".to_string())
}

fn maybe_emit_progress(
    inner: &TransferInner,
    worker: &ActiveTransfer,
    last_emit: &mut Instant,
) {
    if last_emit.elapsed() < TRANSFER_INFO_INTERVAL {
        return;
    }
    *last_emit = Instant::now();
    let snapshot = worker.snapshot();
    let mut event = Event::new(EventKind::TransferInfo, Source::Connect)
        .with_transfer_id(worker.id);
    if let Some(command_id) = worker.request.command_id {
        event = event.with_command_id(command_id);
    }
    for (key, value) in snapshot.to_payload() {
        event = event.with_data(key, value);
    }
    inner.emit(event);
}

async fn run_download(inner: &Arc<TransferInner>, worker: &Arc<ActiveTransfer>) -> Outcome {
    let url = match &worker.request.url {
        Some(url) => url.clone(),
        None => {
            return Outcome::Failed {
                reason: "download without source url".into(),
            }
        }
    };
    let os_path = match inner.fs.to_os_path(&worker.request.path) {
        Ok(path) => path,
        Err(err) => return Outcome::Failed { reason: err.to_string() },
    };
    if let Some(parent) = os_path.parent() {
        if let Err(err) = inner.fs.backend().mkdir(parent).await {
            return Outcome::Failed { reason: err.to_string() };
        }
    }
    let headers = inner.auth_headers_for(&url);
    let (head, mut stream) = match inner.transport.get_stream(&url, headers).await {
        Ok(pair) => pair,
        Err(err) => return Outcome::Failed { reason: err.to_string() },
    };
    if head.status != 200 {
        return Outcome::Failed {
            reason: format!("invalid status code: {}", head.status),
        };
    }
    if let Some(mime) = head.header("content-type") {
        let mime = mime.split(';').next().unwrap_or(mime).trim().to_lowercase();
        if !VALID_DOWNLOAD_TYPES.contains(&mime.as_str()) {
            return Outcome::Failed {
                reason: format!("invalid content type: {mime}"),
            };
        }
    }
    if let Some(total) = head
        .header("content-length")
        .and_then(|raw| raw.parse::<u64>().ok())
    {
        *worker.progress.total.lock().expect("transfer total") = Some(total);
    }

    let part = part_path(&os_path);
    let mut writer = match inner.fs.backend().open_write(&part).await {
        Ok(writer) => writer,
        Err(err) => return Outcome::Failed { reason: err.to_string() },
    };

    let mut throttle = Throttle::new();
    let mut last_emit = Instant::now();
    let idle = inactivity_timeout();
    loop {
        let next = tokio::select! {
            chunk = stream.next() => chunk,
            _ = worker.cancel.cancelled() => {
                return Outcome::Aborted { reason: abort_reason(worker) };
            }
            _ = tokio::time::sleep(idle) => {
                warn!("transfer {} idle for {idle:?}", worker.id);
                return Outcome::Failed { reason: "read_timeout".into() };
            }
        };
        let Some(next) = next else { break };
        let chunk = match next {
            Ok(chunk) => chunk,
            Err(err) => return Outcome::Failed { reason: err.to_string() },
        };
        if let Err(err) = writer.write_all(&chunk).await {
            return Outcome::Failed { reason: err.to_string() };
        }
        worker
            .progress
            .transferred
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        let rate = worker.progress.throttle.load(Ordering::Relaxed);
        if !throttle.pace(chunk.len() as u64, rate, &worker.cancel).await {
            return Outcome::Aborted { reason: abort_reason(worker) };
        }
        maybe_emit_progress(inner, worker, &mut last_emit);
    }

    if worker.progress.transferred.load(Ordering::Relaxed) == 0 {
        return Outcome::Failed { reason: "empty response".into() };
    }

    worker.progress.set_state(TransferState::Finishing);
    if let Err(err) = writer.shutdown().await {
        return Outcome::Failed { reason: err.to_string() };
    }
    drop(writer);
    if let Err(err) = inner.fs.backend().sync_path(&part).await {
        return Outcome::Failed { reason: err.to_string() };
    }

    let printed = inner
        .printed_file
        .lock()
        .expect("printed lock")
        .clone()
        .and_then(|cb| cb());
    if printed.as_deref() == Some(os_path.as_path()) {
        return Outcome::Aborted { reason: "file_in_use".into() };
    }

    if let Err(err) = inner.fs.backend().rename(&part, &os_path).await {
        return Outcome::Failed { reason: err.to_string() };
    }

    let transferred = worker.progress.transferred.load(Ordering::Relaxed);
    match inner
        .fs
        .add_file(&worker.request.path, transferred, now_timestamp(), false)
    {
        Ok((_, created)) => {
            let kind = if created {
                FileChangeKind::Created
            } else {
                FileChangeKind::Modified
            };
            inner.fs.emit_file_changed(&worker.request.path, kind);
        }
        Err(err) => debug!("downloaded file not recorded in tree: {err}"),
    }
    Outcome::Finished
}

async fn run_upload(inner: &Arc<TransferInner>, worker: &Arc<ActiveTransfer>) -> Outcome {
    let url = match &worker.request.url {
        Some(url) => url.clone(),
        None => {
            return Outcome::Failed {
                reason: "upload without destination url".into(),
            }
        }
    };
    let os_path = match inner.fs.to_os_path(&worker.request.path) {
        Ok(path) => path,
        Err(err) => return Outcome::Failed { reason: err.to_string() },
    };
    if let Ok(stat) = inner.fs.backend().stat(&os_path).await {
        *worker.progress.total.lock().expect("transfer total") = Some(stat.size);
    }
    let mut reader = match inner.fs.backend().open_read(&os_path).await {
        Ok(reader) => reader,
        Err(err) => return Outcome::Failed { reason: err.to_string() },
    };
    let mut body = Vec::new();
    let mut chunk = vec![0u8; UPLOAD_CHUNK];
    let mut throttle = Throttle::new();
    let mut last_emit = Instant::now();
    loop {
        let read = tokio::select! {
            read = reader.read(&mut chunk) => read,
            _ = worker.cancel.cancelled() => {
                return Outcome::Aborted { reason: abort_reason(worker) };
            }
        };
        let read = match read {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => return Outcome::Failed { reason: err.to_string() },
        };
        body.extend_from_slice(&chunk[..read]);
        worker
            .progress
            .transferred
            .fetch_add(read as u64, Ordering::Relaxed);
        let rate = worker.progress.throttle.load(Ordering::Relaxed);
        if !throttle.pace(read as u64, rate, &worker.cancel).await {
            return Outcome::Aborted { reason: abort_reason(worker) };
        }
        maybe_emit_progress(inner, worker, &mut last_emit);
    }

    worker.progress.set_state(TransferState::Finishing);
    let mut request = HttpRequest::post(&url).header("Content-Type", "application/octet-stream");
    for (name, value) in inner.auth_headers_for(&url) {
        request = request.header(name, value);
    }
    request.body = Some(body);
    request.timeout = upload_timeout();
    match inner.transport.send(request).await {
        Ok(response) if response.is_success() => Outcome::Finished,
        Ok(response) => Outcome::Failed {
            reason: format!("invalid status code: {}", response.status),
        },
        Err(err) => Outcome::Failed { reason: err.to_string() },
    }
}

async fn finish_worker(inner: &Arc<TransferInner>, worker: &Arc<ActiveTransfer>, outcome: Outcome) {
    let (state, event) = match outcome {
        Outcome::Finished => {
            info!("transfer {} finished", worker.id);
            let mut event = Event::new(EventKind::TransferFinished, Source::Connect)
                .with_transfer_id(worker.id)
                .with_data("destination", json!(worker.request.path));
            if let Some(url) = &worker.request.url {
                event = event.with_data("url", json!(url));
            }
            (TransferState::Finished, event)
        }
        Outcome::Aborted { reason } => {
            error!("transfer {} aborted: {reason}", worker.id);
            let event = Event::new(EventKind::TransferAborted, Source::Connect)
                .with_transfer_id(worker.id)
                .with_reason(reason)
                .with_data("path", json!(worker.request.path));
            (TransferState::Aborted, event)
        }
        Outcome::Failed { reason } => {
            error!("transfer {} failed: {reason}", worker.id);
            let event = Event::new(EventKind::TransferAborted, Source::Connect)
                .with_transfer_id(worker.id)
                .with_reason(reason)
                .with_data("path", json!(worker.request.path));
            (TransferState::Failed, event)
        }
    };
    worker.progress.set_state(state);

    if state != TransferState::Finished && worker.request.kind.is_download() {
        if let Ok(os_path) = inner.fs.to_os_path(&worker.request.path) {
            let _ = inner.fs.backend().unlink(&part_path(&os_path)).await;
        }
    }

    let mut event = event;
    if let Some(command_id) = worker.request.command_id {
        event = event.with_command_id(command_id);
    }
    inner.emit(event);

    if state == TransferState::Finished {
        let _ = inner.fs.refresh_space(&worker.storage).await;
    }

    inner.active.lock().expect("active lock").remove(&worker.storage);
    inner.notify.notify_one();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_file_is_hidden_next_to_target() {
        assert_eq!(
            part_path(std::path::Path::new("/mnt/usb/model.gcode")),
            PathBuf::from("/mnt/usb/.model.gcode.part")
        );
    }

    #[test]
    fn snapshot_progress_and_eta() {
        let snapshot = TransferSnapshot {
            transfer_id: 1,
            kind: TransferKind::DownloadFromUrl,
            state: TransferState::Running,
            url: Some("http://x/y".into()),
            path: "/usb/y.gcode".into(),
            transferred: 25,
            total: Some(100),
            to_print: false,
            to_select: false,
            command_id: None,
            elapsed: Duration::from_secs(5),
        };
        assert!((snapshot.progress() - 25.0).abs() < f64::EPSILON);
        assert_eq!(snapshot.time_remaining(), 15);

        let unknown = TransferSnapshot {
            total: None,
            ..snapshot.clone()
        };
        assert_eq!(unknown.time_remaining(), -1);

        let done = TransferSnapshot {
            state: TransferState::Finished,
            ..snapshot
        };
        assert_eq!(done.time_remaining(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_pays_debt_with_sleeps() {
        let cancel = CancellationToken::new();
        let mut throttle = Throttle::new();
        let before = tokio::time::Instant::now();
        // 1000 B at 500 B/s: ~2 s of debt.
        assert!(throttle.pace(1000, 500, &cancel).await);
        let slept = before.elapsed();
        assert!(slept >= Duration::from_secs(1), "slept only {slept:?}");
    }

    #[tokio::test]
    async fn throttle_cancel_cuts_the_sleep() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut throttle = Throttle::new();
        assert!(!throttle.pace(10_000_000, 1, &cancel).await);
    }
}
