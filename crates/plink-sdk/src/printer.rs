//! The printer object and its communication loop.
//!
//! One `Printer` represents one device. Producer contexts feed telemetry and
//! events from any task or thread; a single loop task owns the outbound
//! socket, drains the queue, pulls commands out of telemetry responses and
//! adapts to server backoff. A separate handler context drives accepted
//! commands through user handlers via [`Printer::command`].

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use plink_files::{Filesystem, LocalStorage, StorageBackend};
use plink_protocol::{
    connect_url, Command, CommandKind, Event, EventKind, NetworkInfo, PrinterType,
    RegisterRequest, Source, State, Telemetry, EVENTS_PATH, HDR_CLOCK_ADJUSTED, HDR_CODE,
    HDR_COMMAND_ID, HDR_FINGERPRINT, HDR_FORCE, HDR_PRINTER_TOKEN, HDR_PRINTER_TYPE,
    HDR_RETRY_AFTER, HDR_SDK_VERSION, HDR_TIMESTAMP, HDR_TOKEN, REGISTER_PATH, SDK_VERSION,
    TELEMETRY_PATH,
};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{wall_now, ClockWatcher};
use crate::command::{CommandInstance, CommandRegistry, CommandState, HandlerOutcome};
use crate::conditions::ConditionTree;
use crate::error::SdkError;
use crate::queue::{EventQueue, QueuedEvent};
use crate::transfer::{TransferManager, TransferRequest};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
use plink_protocol::{FileChangeKind, TransferKind, TransferState};

/// Telemetry cadence: at most one snapshot per second.
pub const TELEMETRY_INTERVAL: Duration = Duration::from_secs(1);

/// First retry delay; doubles per failure up to [`MAX_BACKOFF`].
pub const RETRY_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Registration codes are good for this long.
pub const CODE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Best-effort event flush window during shutdown.
pub const STOP_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// `SHA256_HEX` of the serial number, the fingerprint of legacy types.
pub fn fingerprint_hex(serial_number: &str) -> String {
    format!("{:x}", Sha256::digest(serial_number.as_bytes()))
}

/// Everything needed to construct a [`Printer`]. Identity fields come from
/// the embedding application or its ini file; parsing that file is not the
/// SDK's business.
#[derive(Clone, Debug)]
pub struct PrinterConfig {
    pub printer_type: PrinterType,
    pub serial_number: String,
    /// Derived from the serial number for legacy types when absent.
    pub fingerprint: Option<String>,
    pub server_url: Option<String>,
    pub token: Option<String>,
    pub firmware: Option<String>,
}

impl PrinterConfig {
    pub fn new(printer_type: PrinterType, serial_number: impl Into<String>) -> Self {
        Self {
            printer_type,
            serial_number: serial_number.into(),
            fingerprint: None,
            server_url: None,
            token: None,
            firmware: None,
        }
    }

    pub fn with_server(mut self, host: &str, tls: bool, port: u16) -> Self {
        self.server_url = Some(connect_url(host, tls, port));
        self
    }
}

struct StateInfo {
    state: State,
    ready: bool,
}

struct RegistrationCode {
    code: String,
    deadline: Instant,
}

pub(crate) struct Shared {
    printer_type: PrinterType,
    serial_number: String,
    fingerprint: String,
    server_url: Mutex<Option<String>>,
    token: Mutex<Option<String>>,
    code: Mutex<Option<RegistrationCode>>,
    firmware: Mutex<Option<String>>,
    network_info: Mutex<NetworkInfo>,
    state: Mutex<StateInfo>,
    job_id: Mutex<Option<u32>>,
    queue: EventQueue,
    telemetry_slot: Mutex<Telemetry>,
    registry: CommandRegistry,
    current_command: Mutex<Option<CommandInstance>>,
    last_command: Mutex<Option<(u32, CommandState)>>,
    command_notify: Notify,
    clock: Mutex<ClockWatcher>,
    conditions: ConditionTree,
    transport: Arc<dyn HttpTransport>,
    fs: Arc<Filesystem>,
    transfers: TransferManager,
    shutdown: CancellationToken,
}

impl Shared {
    fn token(&self) -> Option<String> {
        self.token.lock().expect("token lock").clone()
    }

    fn server_url(&self) -> Option<String> {
        self.server_url.lock().expect("server lock").clone()
    }

    fn command_id_in_progress(&self) -> Option<u32> {
        self.current_command
            .lock()
            .expect("command lock")
            .as_ref()
            .filter(|instance| !instance.state.is_terminal())
            .map(|instance| instance.id())
    }

    /// Queue an outbound event. Without a token there is nobody to talk to,
    /// so the event is dropped.
    fn push_event(&self, mut event: Event, priority: bool) {
        if self.token().is_none() {
            debug!("skipping event, no token: {:?}", event.kind);
            return;
        }
        if event.job_id.is_none() {
            event.job_id = *self.job_id.lock().expect("job lock");
        }
        self.queue.push(event, priority);
    }

    fn make_headers(&self) -> Vec<(String, String)> {
        let timestamp = (wall_now() * 10.0).round() / 10.0;
        let mut headers = vec![
            (HDR_FINGERPRINT.to_string(), self.fingerprint.clone()),
            (HDR_PRINTER_TYPE.to_string(), self.printer_type.to_string()),
            (HDR_SDK_VERSION.to_string(), SDK_VERSION.to_string()),
            (HDR_TIMESTAMP.to_string(), format!("{timestamp:.1}")),
        ];
        if let Some(token) = self.token() {
            headers.push((HDR_TOKEN.to_string(), token));
        }
        let mut clock = self.clock.lock().expect("clock lock");
        if clock.clock_adjusted() {
            debug!("clock adjustment detected, resetting watcher");
            headers.push((HDR_CLOCK_ADJUSTED.to_string(), "1".to_string()));
            clock.reset();
        }
        headers
    }
}

enum Outbound {
    Telemetry(Value),
    Queued(QueuedEvent),
}

/// The printer. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct Printer {
    shared: Arc<Shared>,
}

impl Printer {
    /// Build with the production transport and local storage backend.
    pub fn new(config: PrinterConfig) -> Result<Self, SdkError> {
        Self::with_parts(config, Arc::new(ReqwestTransport), Arc::new(LocalStorage))
    }

    /// Build with explicit transport and storage backend (tests, exotic
    /// platforms).
    pub fn with_parts(
        config: PrinterConfig,
        transport: Arc<dyn HttpTransport>,
        backend: Arc<dyn StorageBackend>,
    ) -> Result<Self, SdkError> {
        let fingerprint = match config.fingerprint {
            Some(fingerprint) => fingerprint,
            None if config.printer_type.fingerprint_from_serial() => {
                fingerprint_hex(&config.serial_number)
            }
            None => return Err(SdkError::FingerprintRequired(config.printer_type)),
        };
        let shutdown = CancellationToken::new();
        let fs = Arc::new(Filesystem::new(backend));
        let transfers =
            TransferManager::new(fs.clone(), transport.clone(), shutdown.child_token());
        let conditions = ConditionTree::connectivity();
        let has_token = config.token.is_some();
        let shared = Arc::new(Shared {
            printer_type: config.printer_type,
            serial_number: config.serial_number,
            fingerprint,
            server_url: Mutex::new(config.server_url),
            token: Mutex::new(config.token),
            code: Mutex::new(None),
            firmware: Mutex::new(config.firmware),
            network_info: Mutex::new(NetworkInfo::default()),
            state: Mutex::new(StateInfo {
                state: State::Busy,
                ready: false,
            }),
            job_id: Mutex::new(None),
            queue: EventQueue::new(),
            telemetry_slot: Mutex::new(Telemetry::new()),
            registry: CommandRegistry::new(),
            current_command: Mutex::new(None),
            last_command: Mutex::new(None),
            command_notify: Notify::new(),
            clock: Mutex::new(ClockWatcher::new()),
            conditions,
            transport,
            fs,
            transfers,
            shutdown,
        });

        let sink_target = Arc::downgrade(&shared);
        let sink: plink_files::EventSink = Arc::new(move |event: Event| {
            if let Some(shared) = sink_target.upgrade() {
                let priority = event.kind == EventKind::Failed;
                shared.push_event(event, priority);
            }
        });
        shared.fs.set_event_sink(sink.clone());
        shared.transfers.set_event_sink(sink.clone());
        shared.conditions.set_event_sink(sink);

        let conn_target = Arc::downgrade(&shared);
        shared
            .transfers
            .set_connection_details(Arc::new(move || match conn_target.upgrade() {
                Some(shared) => (shared.server_url(), shared.make_headers()),
                None => (None, Vec::new()),
            }));

        if has_token {
            shared.conditions.set("TOKEN", true, None);
        }

        let printer = Self { shared };
        printer.register_builtins();
        Ok(printer)
    }

    // ---- identity & simple accessors ----

    pub fn printer_type(&self) -> PrinterType {
        self.shared.printer_type
    }

    pub fn serial_number(&self) -> &str {
        &self.shared.serial_number
    }

    pub fn fingerprint(&self) -> &str {
        &self.shared.fingerprint
    }

    pub fn server_url(&self) -> Option<String> {
        self.shared.server_url()
    }

    pub fn set_server_url(&self, url: impl Into<String>) {
        *self.shared.server_url.lock().expect("server lock") = Some(url.into());
    }

    pub fn token(&self) -> Option<String> {
        self.shared.token()
    }

    /// Set the token; allowed exactly once.
    pub fn set_token(&self, token: impl Into<String>) -> Result<(), SdkError> {
        let mut slot = self.shared.token.lock().expect("token lock");
        if slot.is_some() {
            return Err(SdkError::TokenAlreadySet);
        }
        *slot = Some(token.into());
        drop(slot);
        self.shared.conditions.set("TOKEN", true, None);
        info!("token set");
        Ok(())
    }

    pub fn set_firmware(&self, firmware: impl Into<String>) {
        *self.shared.firmware.lock().expect("firmware lock") = Some(firmware.into());
    }

    pub fn set_network_info(&self, info: NetworkInfo) {
        *self.shared.network_info.lock().expect("net lock") = info;
    }

    pub fn set_job_id(&self, job_id: Option<u32>) {
        *self.shared.job_id.lock().expect("job lock") = job_id;
    }

    pub fn job_id(&self) -> Option<u32> {
        *self.shared.job_id.lock().expect("job lock")
    }

    pub fn state(&self) -> State {
        self.shared.state.lock().expect("state lock").state
    }

    /// User confirmation companion to `IDLE`/`READY`.
    pub fn ready(&self) -> bool {
        self.shared.state.lock().expect("state lock").ready
    }

    pub fn command_id_in_progress(&self) -> Option<u32> {
        self.shared.command_id_in_progress()
    }

    pub fn fs(&self) -> &Arc<Filesystem> {
        &self.shared.fs
    }

    pub fn transfers(&self) -> &TransferManager {
        &self.shared.transfers
    }

    pub fn conditions(&self) -> &ConditionTree {
        &self.shared.conditions
    }

    // ---- producer API ----

    /// Merge telemetry fields into the pending slot. Never blocks on I/O;
    /// discarded while no token is set.
    pub fn telemetry(&self, fields: Map<String, Value>) {
        if self.shared.token().is_none() {
            debug!("skipping telemetry, no token");
            return;
        }
        self.shared
            .telemetry_slot
            .lock()
            .expect("telemetry lock")
            .merge(fields);
    }

    /// Queue an event for the service.
    pub fn event_cb(&self, kind: EventKind, source: Source, data: Map<String, Value>) {
        let mut event = Event::new(kind, source);
        event.data = data;
        let priority = kind == EventKind::Failed;
        self.shared.push_event(event, priority);
    }

    /// Change the printer state; enqueues `STATE_CHANGED` iff it differs.
    pub fn set_state(&self, state: State, source: Source) -> Result<(), SdkError> {
        self.set_state_full(state, source, None, Map::new())
    }

    /// `ready` updates the user-confirmation flag (ignored and cleared when
    /// entering `PRINTING`); `data` rides along in the event payload.
    pub fn set_state_full(
        &self,
        new: State,
        source: Source,
        ready: Option<bool>,
        data: Map<String, Value>,
    ) -> Result<(), SdkError> {
        let mut info = self.shared.state.lock().expect("state lock");
        let old = info.state;
        if !old.can_transition(new) {
            return Err(SdkError::InvalidTransition { from: old, to: new });
        }
        if new == State::Printing {
            info.ready = false;
        } else if let Some(ready) = ready {
            info.ready = ready;
        }
        if new != old {
            info.state = new;
            let mut event = Event::new(EventKind::StateChanged, source).with_state(new);
            event.data = data;
            // Enqueued under the state lock so no later set_state can be
            // observed by the service before this one.
            self.shared.push_event(event, false);
        }
        Ok(())
    }

    /// Register (or replace) a synchronous handler for `kind`.
    pub fn handler<F>(&self, kind: CommandKind, handler: F)
    where
        F: Fn(&Command) -> anyhow::Result<HandlerOutcome> + Send + Sync + 'static,
    {
        self.shared.registry.register(kind, handler);
    }

    /// Register (or replace) an awaiting handler for `kind`.
    pub fn handler_async<F, Fut>(&self, kind: CommandKind, handler: F)
    where
        F: Fn(Command) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<HandlerOutcome>> + Send + 'static,
    {
        self.shared.registry.register_async(kind, handler);
    }

    // ---- registration ----

    /// Register with the service; returns the temporary code the user types
    /// into Connect. Requires a server url and no token yet.
    pub async fn register(&self) -> Result<String, SdkError> {
        let server = self.server_url().ok_or(SdkError::NoServerUrl)?;
        if self.token().is_some() {
            return Err(SdkError::TokenAlreadySet);
        }
        let body = serde_json::to_value(RegisterRequest {
            sn: self.shared.serial_number.clone(),
            fingerprint: self.shared.fingerprint.clone(),
            printer_type: self.shared.printer_type.to_string(),
            firmware: self.shared.firmware.lock().expect("firmware lock").clone(),
        })
        .unwrap_or(Value::Null);
        let mut request = HttpRequest::post(format!("{server}{REGISTER_PATH}")).json_body(&body);
        for (name, value) in self.shared.make_headers() {
            request = request.header(name, value);
        }
        match self.shared.transport.send(request).await {
            Err(err) => {
                warn!("registration failed: {err}");
                self.shared
                    .conditions
                    .set("INTERNET", false, Some(&err.to_string()));
                Err(SdkError::Unregistered)
            }
            Ok(response) if response.is_success() => {
                let code = response
                    .header(HDR_CODE)
                    .ok_or(SdkError::HttpStatus {
                        status: response.status,
                        body: "missing Code header".to_string(),
                    })?
                    .to_string();
                *self.shared.code.lock().expect("code lock") = Some(RegistrationCode {
                    code: code.clone(),
                    deadline: Instant::now() + CODE_TIMEOUT,
                });
                self.shared.conditions.set("API", true, None);
                info!("registered, code {code}");
                Ok(code)
            }
            Ok(response) => {
                let reason = String::from_utf8_lossy(&response.body).into_owned();
                if response.status >= 500 {
                    self.shared.conditions.set("HTTP", false, Some(&reason));
                } else {
                    self.shared.conditions.set("API", false, Some(&reason));
                }
                Err(SdkError::HttpStatus {
                    status: response.status,
                    body: reason,
                })
            }
        }
    }

    /// Poll the registration endpoint. `Ok(Some(token))` once the user
    /// completed registration, `Ok(None)` while pending.
    pub async fn get_token(&self, tmp_code: &str) -> Result<Option<String>, SdkError> {
        let server = self.server_url().ok_or(SdkError::NoServerUrl)?;
        if self.token().is_some() {
            return Err(SdkError::TokenAlreadySet);
        }
        let expired = {
            let slot = self.shared.code.lock().expect("code lock");
            slot.as_ref()
                .is_some_and(|reg| reg.code == tmp_code && Instant::now() > reg.deadline)
        };
        if expired {
            *self.shared.code.lock().expect("code lock") = None;
            return Err(SdkError::RegistrationExpired);
        }
        let mut request =
            HttpRequest::get(format!("{server}{REGISTER_PATH}")).header(HDR_CODE, tmp_code);
        for (name, value) in self.shared.make_headers() {
            request = request.header(name, value);
        }
        match self.shared.transport.send(request).await {
            Err(err) => {
                self.shared
                    .conditions
                    .set("INTERNET", false, Some(&err.to_string()));
                Err(SdkError::NetworkUnavailable(err.to_string()))
            }
            Ok(response) => match response.status {
                200 => {
                    let token = response
                        .header(HDR_PRINTER_TOKEN)
                        .or_else(|| response.header(HDR_TOKEN))
                        .ok_or(SdkError::HttpStatus {
                            status: 200,
                            body: "missing token header".to_string(),
                        })?
                        .to_string();
                    self.set_token(token.clone())?;
                    *self.shared.code.lock().expect("code lock") = None;
                    Ok(Some(token))
                }
                202 => Ok(None),
                status if (400..500).contains(&status) => {
                    self.shared
                        .conditions
                        .set("API", false, Some("registration rejected"));
                    Err(SdkError::RegistrationRejected)
                }
                status => {
                    let body = String::from_utf8_lossy(&response.body).into_owned();
                    self.shared.conditions.set("HTTP", false, Some(&body));
                    Err(SdkError::HttpStatus { status, body })
                }
            },
        }
    }

    // ---- the communication loop ----

    /// Run until [`Printer::stop_loop`]. Owns the outbound socket; spawn it
    /// once, alongside `transfers().run()`.
    pub async fn run(&self) {
        info!("communication loop started");
        let mut backoff = RETRY_BACKOFF;
        let mut last_telemetry: Option<Instant> = None;
        while !self.shared.shutdown.is_cancelled() {
            let server = match (self.token(), self.server_url()) {
                (Some(_), Some(server)) => server,
                _ => {
                    self.sleep_cancellable(RETRY_BACKOFF).await;
                    continue;
                }
            };
            let outbound = if let Some(item) = self.shared.queue.pop_priority() {
                Outbound::Queued(item)
            } else if last_telemetry.map_or(true, |at| at.elapsed() >= TELEMETRY_INTERVAL) {
                Outbound::Telemetry(self.telemetry_payload())
            } else if let Some(item) = self.shared.queue.pop() {
                Outbound::Queued(item)
            } else {
                self.shared.queue.wait_nonempty().await;
                continue;
            };
            let (request, queued, is_telemetry) = match outbound {
                Outbound::Telemetry(payload) => {
                    let request =
                        HttpRequest::post(format!("{server}{TELEMETRY_PATH}")).json_body(&payload);
                    (request, None, true)
                }
                Outbound::Queued(item) => {
                    let timestamp = wall_now() - item.enqueued_at.elapsed().as_secs_f64();
                    let payload = item.event.to_payload(timestamp);
                    let request =
                        HttpRequest::post(format!("{server}{EVENTS_PATH}")).json_body(&payload);
                    (request, Some(item), false)
                }
            };
            let request = self
                .shared
                .make_headers()
                .into_iter()
                .fold(request, |req, (name, value)| req.header(name, value));

            match self.shared.transport.send(request).await {
                Err(err) => {
                    metrics::counter!("plink_loop_retries_total").increment(1);
                    match &err {
                        crate::transport::TransportError::Timeout => {
                            self.shared.conditions.set("HTTP", false, Some("timeout"));
                        }
                        crate::transport::TransportError::Network(reason) => {
                            self.shared.conditions.set("INTERNET", false, Some(reason));
                        }
                    }
                    error!("loop send failed: {err}");
                    if let Some(item) = queued {
                        self.shared.queue.requeue(item);
                    }
                    self.sleep_cancellable(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Ok(response) => {
                    if is_telemetry {
                        last_telemetry = Some(Instant::now());
                    }
                    self.handle_response(response, queued, is_telemetry, &mut backoff)
                        .await;
                }
            }
        }
        self.flush_events().await;
        info!("communication loop stopped");
    }

    /// Signal shutdown: the loop flushes pending events for up to
    /// [`STOP_FLUSH_TIMEOUT`], transfer workers abort between chunks.
    pub fn stop_loop(&self) {
        self.shared.shutdown.cancel();
        self.shared.command_notify.notify_waiters();
    }

    async fn sleep_cancellable(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shared.shutdown.cancelled() => {}
        }
    }

    async fn handle_response(
        &self,
        response: HttpResponse,
        queued: Option<QueuedEvent>,
        is_telemetry: bool,
        backoff: &mut Duration,
    ) {
        if response.is_success() {
            *backoff = RETRY_BACKOFF;
            self.shared.conditions.set("API", true, None);
            if is_telemetry {
                self.parse_command(&response);
            }
            return;
        }
        let status = response.status;
        let retry_after = response
            .header(HDR_RETRY_AFTER)
            .and_then(|raw| raw.parse::<u64>().ok())
            .map(Duration::from_secs);
        if status == 429 || status >= 500 {
            metrics::counter!("plink_loop_retries_total").increment(1);
            let reason = format!("status {status}");
            self.shared.conditions.set("HTTP", false, Some(&reason));
            if let Some(item) = queued {
                self.shared.queue.requeue(item);
            }
            match retry_after {
                Some(delay) => self.sleep_cancellable(delay).await,
                None => {
                    self.sleep_cancellable(*backoff).await;
                    *backoff = (*backoff * 2).min(MAX_BACKOFF);
                }
            }
            return;
        }
        // 4xx: terminal, never retried.
        let reason = serde_json::from_slice::<Value>(&response.body)
            .ok()
            .and_then(|body| {
                body.get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| format!("status {status}"));
        warn!("service rejected request ({status}): {reason}");
        if status == 401 {
            self.shared.conditions.set("TOKEN", false, Some(&reason));
        } else {
            self.shared.conditions.set("API", false, Some(&reason));
        }
        if let Some(raw_id) = response.header(HDR_COMMAND_ID) {
            if let Ok(command_id) = raw_id.parse::<u32>() {
                self.record_terminal(command_id, CommandState::Failed);
            }
        }
    }

    fn telemetry_payload(&self) -> Value {
        let state = self.state();
        let command_id = self.shared.command_id_in_progress();
        let mut slot = self.shared.telemetry_slot.lock().expect("telemetry lock");
        if let Some(job_id) = self.job_id() {
            slot.set("job_id", json!(job_id));
        }
        if let Some(snapshot) = self.shared.transfers.current() {
            if snapshot.state == TransferState::Running {
                slot.set("transfer_id", json!(snapshot.transfer_id));
                slot.set("transfer_progress", json!(snapshot.progress()));
                slot.set("transfer_transferred", json!(snapshot.transferred));
                slot.set("transfer_time_remaining", json!(snapshot.time_remaining()));
            }
        }
        slot.take_payload(state, command_id)
    }

    async fn flush_events(&self) {
        if self.token().is_none() {
            return;
        }
        let Some(server) = self.server_url() else { return };
        let deadline = Instant::now() + STOP_FLUSH_TIMEOUT;
        while let Some(item) = self.shared.queue.pop() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!("flush window over, {} events dropped", self.shared.queue.len() + 1);
                break;
            }
            let timestamp = wall_now() - item.enqueued_at.elapsed().as_secs_f64();
            let payload = item.event.to_payload(timestamp);
            let mut request =
                HttpRequest::post(format!("{server}{EVENTS_PATH}")).json_body(&payload);
            request.timeout = remaining.min(crate::transport::REQUEST_TIMEOUT);
            let request = self
                .shared
                .make_headers()
                .into_iter()
                .fold(request, |req, (name, value)| req.header(name, value));
            if self.shared.transport.send(request).await.is_err() {
                break;
            }
        }
    }

    // ---- command plumbing ----

    fn parse_command(&self, response: &HttpResponse) {
        if response.status != 200 {
            return;
        }
        let Some(raw_id) = response.header(HDR_COMMAND_ID) else {
            return;
        };
        let command_id = match raw_id.parse::<u32>() {
            Ok(id) => id,
            Err(_) => {
                error!("invalid Command-Id header: {raw_id}");
                self.shared.push_event(
                    Event::new(EventKind::Rejected, Source::Connect)
                        .with_reason("Invalid Command-Id header"),
                    false,
                );
                return;
            }
        };
        let force = response.header(HDR_FORCE) == Some("1");
        let content_type = response.header("content-type").unwrap_or("");
        let parsed = if content_type.starts_with("application/json") {
            Command::from_body(command_id, &response.body, force)
        } else if content_type == "text/x.gcode" {
            let text = String::from_utf8_lossy(&response.body).into_owned();
            let mut kwargs = Map::new();
            kwargs.insert("gcode".into(), json!(text));
            Ok(Command {
                id: command_id,
                kind: CommandKind::Gcode,
                args: vec![json!(text)],
                kwargs,
                force,
            })
        } else {
            Err(plink_protocol::ProtocolError::MalformedBody(
                "invalid command content type".into(),
            ))
        };
        match parsed {
            Ok(command) => self.admit_command(command),
            Err(err) => {
                warn!("rejecting command {command_id}: {err}");
                self.shared.push_event(
                    Event::new(EventKind::Rejected, Source::Connect)
                        .with_command_id(command_id)
                        .with_reason(err.to_string()),
                    false,
                );
            }
        }
    }

    fn admit_command(&self, command: Command) {
        let mut current = self.shared.current_command.lock().expect("command lock");
        if let Some(existing) = current.as_ref() {
            if !existing.state.is_terminal() {
                if existing.id() == command.id {
                    // Service re-asked about the in-flight command.
                    if let Some(kind) = existing.state.event_kind() {
                        self.shared.push_event(
                            Event::new(kind, Source::Connect).with_command_id(command.id),
                            false,
                        );
                    }
                    return;
                }
                if command.kind.is_priority() {
                    let preempted = existing.id();
                    info!(
                        "{} preempts running command {preempted}",
                        command.kind
                    );
                    self.shared.push_event(
                        Event::new(EventKind::Rejected, Source::Connect)
                            .with_command_id(preempted)
                            .with_reason("preempted"),
                        true,
                    );
                    *self.shared.last_command.lock().expect("last lock") =
                        Some((preempted, CommandState::Rejected));
                } else {
                    self.shared.push_event(
                        Event::new(EventKind::Rejected, Source::Connect)
                            .with_command_id(command.id)
                            .with_reason("busy")
                            .with_data("actual_command_id", json!(existing.id())),
                        false,
                    );
                    return;
                }
            }
        }
        if let Some((last_id, last_state)) = *self.shared.last_command.lock().expect("last lock") {
            let duplicate_of_last = command.id == last_id
                && current
                    .as_ref()
                    .map_or(true, |existing| existing.id() != command.id);
            if duplicate_of_last {
                if let Some(kind) = last_state.event_kind() {
                    self.shared.push_event(
                        Event::new(kind, Source::Connect).with_command_id(last_id),
                        false,
                    );
                }
                return;
            }
        }
        let command_id = command.id;
        let mut instance = CommandInstance::new(command);
        instance.state = CommandState::Accepted;
        *current = Some(instance);
        drop(current);
        self.shared.push_event(
            Event::new(EventKind::Accepted, Source::Connect).with_command_id(command_id),
            false,
        );
        self.shared.command_notify.notify_waiters();
    }

    /// Park the handler context until a command is ready (or shutdown).
    pub async fn wait_command(&self) -> bool {
        loop {
            if self.shared.shutdown.is_cancelled() {
                return false;
            }
            {
                let current = self.shared.current_command.lock().expect("command lock");
                if current
                    .as_ref()
                    .is_some_and(|instance| instance.state == CommandState::Accepted)
                {
                    return true;
                }
            }
            tokio::select! {
                _ = self.shared.command_notify.notified() => {}
                _ = self.shared.shutdown.cancelled() => return false,
            }
        }
    }

    /// Drive the accepted command through its handler. Must be called from
    /// the handler context; the loop never invokes handlers.
    pub async fn command(&self) -> Option<CommandState> {
        let command = {
            let mut current = self.shared.current_command.lock().expect("command lock");
            match current.as_mut() {
                Some(instance) if instance.state == CommandState::Accepted => {
                    instance.state = CommandState::Running;
                    instance.command.clone()
                }
                _ => return None,
            }
        };
        let command_id = command.id;
        let kind = command.kind;
        debug!("handling {kind} ({command_id})");
        let Some(handler) = self.shared.registry.get(kind) else {
            warn!("command {kind} not implemented");
            self.shared.push_event(
                Event::new(EventKind::Rejected, Source::Wui)
                    .with_command_id(command_id)
                    .with_reason("Not Implemented"),
                false,
            );
            self.record_terminal(command_id, CommandState::Rejected);
            return Some(CommandState::Rejected);
        };
        match handler(command).await {
            Ok(outcome) => {
                let kind = outcome.event.unwrap_or(EventKind::Finished);
                let mut event = Event::new(kind, outcome.source).with_command_id(command_id);
                event.data = outcome.data;
                if !self.finish_if_current(command_id, event, false, CommandState::Finished) {
                    return Some(CommandState::Rejected);
                }
                Some(CommandState::Finished)
            }
            Err(err) => {
                error!("command {command_id} failed: {err:#}");
                let event = Event::new(EventKind::Failed, Source::Wui)
                    .with_command_id(command_id)
                    .with_reason(format!("{err:#}"));
                if !self.finish_if_current(command_id, event, true, CommandState::Failed) {
                    return Some(CommandState::Rejected);
                }
                Some(CommandState::Failed)
            }
        }
    }

    /// Emit the terminal event for `command_id` unless a priority command
    /// preempted it meanwhile (its REJECTED already went out).
    fn finish_if_current(
        &self,
        command_id: u32,
        event: Event,
        priority: bool,
        state: CommandState,
    ) -> bool {
        {
            let mut current = self.shared.current_command.lock().expect("command lock");
            match current.as_ref() {
                Some(instance) if instance.id() == command_id => {
                    *current = None;
                }
                _ => return false,
            }
            *self.shared.last_command.lock().expect("last lock") = Some((command_id, state));
        }
        self.shared.push_event(event, priority);
        true
    }

    fn record_terminal(&self, command_id: u32, state: CommandState) {
        let mut current = self.shared.current_command.lock().expect("command lock");
        if current.as_ref().is_some_and(|c| c.id() == command_id) {
            *current = None;
            *self.shared.last_command.lock().expect("last lock") = Some((command_id, state));
        }
    }

    // ---- built-in handlers ----

    fn register_builtins(&self) {
        let registry = &self.shared.registry;
        let weak = Arc::downgrade(&self.shared);

        let target = weak.clone();
        registry.register_async(CommandKind::SendInfo, move |_cmd| {
            let target = target.clone();
            async move {
                let shared = upgrade(&target)?;
                let (t, v, s) = shared.printer_type.triple();
                let info = shared.fs.get_info();
                let state = shared.state.lock().expect("state lock").state;
                let network = shared.network_info.lock().expect("net lock").clone();
                let index: Vec<Value> = info
                    .files
                    .values()
                    .map(|entry| serde_json::to_value(entry).unwrap_or(Value::Null))
                    .collect();
                let firmware = shared.firmware.lock().expect("firmware lock").clone();
                Ok(HandlerOutcome::new(Source::Connect)
                    .with_event(EventKind::Info)
                    .with_data("type", json!(t))
                    .with_data("version", json!(v))
                    .with_data("subversion", json!(s))
                    .with_data("state", serde_json::to_value(state)?)
                    .with_data("firmware", json!(firmware))
                    .with_data("sdk", json!(SDK_VERSION))
                    .with_data("network_info", serde_json::to_value(network)?)
                    .with_data("sn", json!(shared.serial_number))
                    .with_data("fingerprint", json!(shared.fingerprint))
                    .with_data("files", info.legacy)
                    .with_data("file_index", Value::Array(index)))
            }
        });

        let target = weak.clone();
        registry.register_async(CommandKind::SendFileInfo, move |cmd| {
            let target = target.clone();
            async move {
                let shared = upgrade(&target)?;
                let path = require_path(&cmd)?;
                let node = shared
                    .fs
                    .get(&path)
                    .with_context(|| format!("file does not exist: {path}"))?;
                anyhow::ensure!(!node.is_dir, "SEND_FILE_INFO does not work for directories");
                let mut outcome = HandlerOutcome::new(Source::Connect)
                    .with_event(EventKind::FileInfo)
                    .with_data("path", json!(path))
                    .with_data("size", json!(node.size))
                    .with_data("m_timestamp", json!(node.m_timestamp))
                    .with_data("ro", json!(node.read_only));
                if let Some(record) = shared.fs.metadata(&path).await? {
                    if let Some(preview) = record.biggest_thumbnail() {
                        outcome = outcome.with_data("preview", json!(preview));
                    }
                    outcome = outcome.with_data("meta", serde_json::to_value(&record)?);
                }
                Ok(outcome)
            }
        });

        let target = weak.clone();
        registry.register_async(CommandKind::CreateDirectory, move |cmd| {
            let target = target.clone();
            async move {
                let shared = upgrade(&target)?;
                let path = require_path(&cmd)?;
                let created = shared.fs.create_folder(&path, true)?;
                let os_path = shared.fs.to_os_path(&path)?;
                shared.fs.backend().mkdir(&os_path).await?;
                if created {
                    shared.fs.emit_file_changed(&path, FileChangeKind::Created);
                }
                Ok(HandlerOutcome::new(Source::Connect))
            }
        });

        let target = weak.clone();
        registry.register_async(CommandKind::DeleteFile, move |cmd| {
            let target = target.clone();
            async move {
                let shared = upgrade(&target)?;
                let path = require_path(&cmd)?;
                shared.transfers.on_path_deleted(&path);
                let os_path = shared.fs.to_os_path(&path)?;
                shared.fs.invalidate_metadata(&path).await;
                shared.fs.backend().unlink(&os_path).await?;
                shared.fs.delete(&path, false)?;
                shared.fs.emit_file_changed(&path, FileChangeKind::Deleted);
                Ok(HandlerOutcome::new(Source::Connect))
            }
        });

        let target = weak.clone();
        registry.register_async(CommandKind::DeleteDirectory, move |cmd| {
            let target = target.clone();
            async move {
                let shared = upgrade(&target)?;
                let path = require_path(&cmd)?;
                let force = cmd.force;
                let os_path = shared.fs.to_os_path(&path)?;
                shared.fs.delete(&path, force)?;
                shared.fs.backend().rmdir(&os_path, force).await?;
                shared.fs.emit_file_changed(&path, FileChangeKind::Deleted);
                Ok(HandlerOutcome::new(Source::Connect))
            }
        });

        let target = weak.clone();
        registry.register_async(CommandKind::StartUrlDownload, move |cmd| {
            let target = target.clone();
            async move {
                let shared = upgrade(&target)?;
                let detail = cmd.detail()?;
                let plink_protocol::CommandDetail::StartUrlDownload {
                    path,
                    url,
                    to_print,
                    to_select,
                } = detail
                else {
                    anyhow::bail!("argument mismatch for {}", cmd.kind);
                };
                shared.transfers.start(TransferRequest {
                    kind: TransferKind::DownloadFromUrl,
                    url: Some(url),
                    path,
                    to_print,
                    to_select,
                    command_id: Some(cmd.id),
                    throttle_bytes_per_second: None,
                })?;
                Ok(HandlerOutcome::new(Source::Connect))
            }
        });

        let target = weak.clone();
        registry.register_async(CommandKind::StartConnectDownload, move |cmd| {
            let target = target.clone();
            async move {
                let shared = upgrade(&target)?;
                let detail = cmd.detail()?;
                let plink_protocol::CommandDetail::StartConnectDownload {
                    path,
                    source,
                    to_print,
                    to_select,
                } = detail
                else {
                    anyhow::bail!("argument mismatch for {}", cmd.kind);
                };
                let server = shared
                    .server_url()
                    .context("server url is not configured")?;
                shared.transfers.start(TransferRequest {
                    kind: TransferKind::DownloadFromConnect,
                    url: Some(format!("{server}{source}")),
                    path,
                    to_print,
                    to_select,
                    command_id: Some(cmd.id),
                    throttle_bytes_per_second: None,
                })?;
                Ok(HandlerOutcome::new(Source::Connect))
            }
        });

        let target = weak.clone();
        registry.register_async(CommandKind::StopTransfer, move |_cmd| {
            let target = target.clone();
            async move {
                let shared = upgrade(&target)?;
                let current = shared
                    .transfers
                    .current()
                    .context("no transfer in progress")?;
                shared.transfers.stop(current.transfer_id, "stopped");
                Ok(HandlerOutcome::new(Source::Connect))
            }
        });

        let target = weak.clone();
        registry.register_async(CommandKind::SendTransferInfo, move |_cmd| {
            let target = target.clone();
            async move {
                let shared = upgrade(&target)?;
                let mut outcome =
                    HandlerOutcome::new(Source::Connect).with_event(EventKind::TransferInfo);
                match shared.transfers.current() {
                    Some(snapshot) => {
                        for (key, value) in snapshot.to_payload() {
                            outcome = outcome.with_data(key, value);
                        }
                    }
                    None => {
                        outcome = outcome.with_data("type", json!("NO_TRANSFER"));
                    }
                }
                Ok(outcome)
            }
        });

        let target = weak.clone();
        registry.register_async(CommandKind::SetPrinterReady, move |_cmd| {
            let target = target.clone();
            async move {
                let printer = Printer {
                    shared: upgrade(&target)?,
                };
                printer.set_state_full(State::Ready, Source::Connect, Some(true), Map::new())?;
                Ok(HandlerOutcome::new(Source::Connect))
            }
        });

        let target = weak.clone();
        registry.register_async(CommandKind::CancelPrinterReady, move |_cmd| {
            let target = target.clone();
            async move {
                let printer = Printer {
                    shared: upgrade(&target)?,
                };
                anyhow::ensure!(printer.ready(), "cannot cancel, printer is not ready");
                printer.set_state_full(State::Idle, Source::Connect, Some(false), Map::new())?;
                Ok(HandlerOutcome::new(Source::Connect))
            }
        });
    }
}

fn upgrade(weak: &Weak<Shared>) -> anyhow::Result<Arc<Shared>> {
    weak.upgrade().context("printer is gone")
}

fn require_path(command: &Command) -> anyhow::Result<String> {
    command
        .kwargs
        .get("path")
        .and_then(Value::as_str)
        .map(str::to_string)
        .with_context(|| format!("{} requires a `path` kwarg", command.kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ByteStream, TransportError};
    use async_trait::async_trait;
    use plink_files::LocalStorage;
    use serde_json::json;

    struct NullTransport;

    #[async_trait]
    impl HttpTransport for NullTransport {
        async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
            Ok(HttpResponse {
                status: 204,
                headers: Vec::new(),
                body: Vec::new(),
            })
        }

        async fn get_stream(
            &self,
            _url: &str,
            _headers: Vec<(String, String)>,
        ) -> Result<(HttpResponse, ByteStream), TransportError> {
            Err(TransportError::Network("not wired".into()))
        }
    }

    fn printer(token: Option<&str>) -> Printer {
        let mut config = PrinterConfig::new(PrinterType::I3Mk3s, "SN123")
            .with_server("connect.example", false, 0);
        config.token = token.map(str::to_string);
        Printer::with_parts(config, Arc::new(NullTransport), Arc::new(LocalStorage)).unwrap()
    }

    fn command(id: u32, kind: &str) -> Command {
        let body = json!({"command": kind, "kwargs": {"path": "/usb/x.gcode"}});
        Command::from_body(id, body.to_string().as_bytes(), false).unwrap()
    }

    #[test]
    fn fingerprint_is_sha256_of_serial() {
        assert_eq!(
            fingerprint_hex("SN123"),
            "eaa51384b8e9f0c15c46c3534ce364dc3bc617c198f09dced21342f175be5e33"
        );
        let p = printer(None);
        assert_eq!(p.fingerprint(), fingerprint_hex("SN123"));
    }

    #[test]
    fn clock_adjusted_header_appears_once() {
        let p = printer(Some("tok"));
        p.shared
            .clock
            .lock()
            .unwrap()
            .shift_for_test(3600.0);
        let headers = p.shared.make_headers();
        assert!(headers
            .iter()
            .any(|(name, value)| name == HDR_CLOCK_ADJUSTED && value == "1"));
        // The watcher re-baselines after reporting.
        let headers = p.shared.make_headers();
        assert!(!headers.iter().any(|(name, _)| name == HDR_CLOCK_ADJUSTED));
    }

    #[test]
    fn second_command_is_rejected_busy() {
        let p = printer(Some("tok"));
        p.admit_command(command(1, "START_PRINT"));
        assert_eq!(p.command_id_in_progress(), Some(1));
        let accepted = p.shared.queue.pop().unwrap();
        assert_eq!(accepted.event.kind, EventKind::Accepted);
        assert_eq!(accepted.event.command_id, Some(1));

        p.admit_command(command(2, "START_PRINT"));
        let rejected = p.shared.queue.pop().unwrap();
        assert_eq!(rejected.event.kind, EventKind::Rejected);
        assert_eq!(rejected.event.command_id, Some(2));
        assert_eq!(rejected.event.reason.as_deref(), Some("busy"));
        assert_eq!(p.command_id_in_progress(), Some(1));
    }

    #[test]
    fn reasking_about_the_same_command_resends_its_state() {
        let p = printer(Some("tok"));
        p.admit_command(command(5, "START_PRINT"));
        let _ = p.shared.queue.pop();
        p.admit_command(command(5, "START_PRINT"));
        let resent = p.shared.queue.pop().unwrap();
        assert_eq!(resent.event.kind, EventKind::Accepted);
        assert_eq!(resent.event.command_id, Some(5));
        // Still exactly one in-flight command.
        assert_eq!(p.command_id_in_progress(), Some(5));
    }

    #[test]
    fn priority_command_preempts() {
        let p = printer(Some("tok"));
        p.admit_command(command(1, "START_PRINT"));
        let _ = p.shared.queue.pop();
        p.admit_command(command(2, "RESET_PRINTER"));

        let rejected = p.shared.queue.pop_priority().unwrap();
        assert_eq!(rejected.event.kind, EventKind::Rejected);
        assert_eq!(rejected.event.command_id, Some(1));
        assert_eq!(rejected.event.reason.as_deref(), Some("preempted"));
        let accepted = p.shared.queue.pop().unwrap();
        assert_eq!(accepted.event.kind, EventKind::Accepted);
        assert_eq!(accepted.event.command_id, Some(2));
        assert_eq!(p.command_id_in_progress(), Some(2));
    }

    #[test]
    fn events_carry_the_job_id() {
        let p = printer(Some("tok"));
        p.set_job_id(Some(42));
        p.event_cb(EventKind::Attention, Source::Marlin, Map::new());
        let queued = p.shared.queue.pop().unwrap();
        assert_eq!(queued.event.job_id, Some(42));
    }

    #[test]
    fn printing_clears_the_ready_flag() {
        let p = printer(Some("tok"));
        p.set_state_full(State::Ready, Source::Connect, Some(true), Map::new())
            .unwrap();
        assert!(p.ready());
        p.set_state(State::Printing, Source::Marlin).unwrap();
        assert!(!p.ready());
    }
}
