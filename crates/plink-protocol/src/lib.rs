//! Wire protocol and data model for the printer ⇄ Connect link.
//!
//! Everything that crosses the HTTPS boundary is defined here: printer
//! identity, states, event and command vocabularies, and the JSON payload
//! shapes for `/p/telemetry` and `/p/events`. The SDK crates build on these
//! types; nothing in this crate performs I/O.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

// Request headers sent by the printer.
pub const HDR_TOKEN: &str = "Token";
pub const HDR_FINGERPRINT: &str = "Fingerprint";
pub const HDR_PRINTER_TYPE: &str = "Printer-Type";
pub const HDR_SDK_VERSION: &str = "SDK-Version";
pub const HDR_TIMESTAMP: &str = "Timestamp";
pub const HDR_CLOCK_ADJUSTED: &str = "Clock-Adjusted";
pub const HDR_CODE: &str = "Code";

// Response headers recognised by the printer.
pub const HDR_COMMAND_ID: &str = "Command-Id";
pub const HDR_FORCE: &str = "Force";
pub const HDR_RETRY_AFTER: &str = "Retry-After";
pub const HDR_PRINTER_TOKEN: &str = "Printer-Token";

// Service endpoints, relative to the configured server url.
pub const TELEMETRY_PATH: &str = "/p/telemetry";
pub const EVENTS_PATH: &str = "/p/events";
pub const REGISTER_PATH: &str = "/p/register";

/// File extensions treated as printable g-code.
pub const GCODE_EXTENSIONS: &[&str] = &[".gcode", ".gc", ".g", ".gco"];

/// Wall-clock payload timestamps are rounded to this resolution (seconds).
pub const TIMESTAMP_PRECISION: f64 = 0.1;

#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("unknown command kind: {0}")]
    UnknownCommand(String),
    #[error("command {kind} requires argument `{name}`")]
    MissingArgument { kind: CommandKind, name: &'static str },
    #[error("invalid {0} header: {1}")]
    InvalidHeader(&'static str, String),
    #[error("malformed command body: {0}")]
    MalformedBody(String),
}

/// Printer models known to the service.
///
/// The triple is `(type, version, subversion)` as reported in INFO payloads;
/// the wire form (e.g. `1.3.1`) joins it with dots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrinterType {
    #[serde(rename = "I3MK3")]
    I3Mk3,
    #[serde(rename = "I3MK3S")]
    I3Mk3s,
    #[serde(rename = "SL1")]
    Sl1,
    #[serde(rename = "MINI")]
    Mini,
}

impl PrinterType {
    pub fn triple(self) -> (u8, u8, u8) {
        match self {
            PrinterType::I3Mk3 => (1, 3, 0),
            PrinterType::I3Mk3s => (1, 3, 1),
            PrinterType::Sl1 => (5, 1, 0),
            PrinterType::Mini => (2, 1, 0),
        }
    }

    /// Legacy types derive their fingerprint from the serial number alone.
    pub fn fingerprint_from_serial(self) -> bool {
        matches!(self, PrinterType::I3Mk3 | PrinterType::I3Mk3s)
    }
}

impl fmt::Display for PrinterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (t, v, s) = self.triple();
        write!(f, "{t}.{v}.{s}")
    }
}

/// Printer state as reported in telemetry.
///
/// `PREPARED` existed historically and is unified with `READY`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Idle,
    Ready,
    Busy,
    Printing,
    Paused,
    Finished,
    Stopped,
    Error,
    Attention,
}

impl State {
    /// Whether a direct transition `self -> to` is legal.
    ///
    /// Any state may fall into `ERROR` or `ATTENTION`. A running print can
    /// only reach `READY`/`IDLE` through `FINISHED` or `STOPPED`. `IDLE` and
    /// `READY` are mutually reachable; embedders wanting a stricter graph
    /// restrict on top of this one.
    pub fn can_transition(self, to: State) -> bool {
        use State::*;
        if self == to {
            return true;
        }
        if matches!(to, Error | Attention) {
            return true;
        }
        match self {
            Printing => matches!(to, Paused | Finished | Stopped | Error | Attention),
            Paused => matches!(to, Printing | Stopped | Error | Attention),
            _ => true,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Idle => "IDLE",
            State::Ready => "READY",
            State::Busy => "BUSY",
            State::Printing => "PRINTING",
            State::Paused => "PAUSED",
            State::Finished => "FINISHED",
            State::Stopped => "STOPPED",
            State::Error => "ERROR",
            State::Attention => "ATTENTION",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Originator of an event or state change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Source {
    Connect,
    Gui,
    Wui,
    Serial,
    Gcode,
    Marlin,
    Firmware,
    Hw,
    User,
}

/// Events known by the service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Accepted,
    Rejected,
    Finished,
    Failed,
    Info,
    StateChanged,
    Attention,
    MediumEjected,
    MediumInserted,
    FileChanged,
    FileInfo,
    JobInfo,
    TransferInfo,
    TransferAborted,
    TransferFinished,
    MeshBedLeveling,
    ConditionChanged,
}

/// Commands the service may embed in a telemetry response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    SendInfo,
    Gcode,
    StartPrint,
    StopPrint,
    PausePrint,
    ResumePrint,
    SendFileInfo,
    SendJobInfo,
    DeleteFile,
    DeleteDirectory,
    CreateDirectory,
    StartUrlDownload,
    StartConnectDownload,
    StopTransfer,
    SendTransferInfo,
    SetPrinterReady,
    CancelPrinterReady,
    ResetPrinter,
}

/// Command kinds that preempt a running command instead of being rejected
/// as busy. Model-specific builds may extend this set.
pub const PRIORITY_COMMANDS: &[CommandKind] = &[CommandKind::ResetPrinter];

impl CommandKind {
    pub fn is_priority(self) -> bool {
        PRIORITY_COMMANDS.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::SendInfo => "SEND_INFO",
            CommandKind::Gcode => "GCODE",
            CommandKind::StartPrint => "START_PRINT",
            CommandKind::StopPrint => "STOP_PRINT",
            CommandKind::PausePrint => "PAUSE_PRINT",
            CommandKind::ResumePrint => "RESUME_PRINT",
            CommandKind::SendFileInfo => "SEND_FILE_INFO",
            CommandKind::SendJobInfo => "SEND_JOB_INFO",
            CommandKind::DeleteFile => "DELETE_FILE",
            CommandKind::DeleteDirectory => "DELETE_DIRECTORY",
            CommandKind::CreateDirectory => "CREATE_DIRECTORY",
            CommandKind::StartUrlDownload => "START_URL_DOWNLOAD",
            CommandKind::StartConnectDownload => "START_CONNECT_DOWNLOAD",
            CommandKind::StopTransfer => "STOP_TRANSFER",
            CommandKind::SendTransferInfo => "SEND_TRANSFER_INFO",
            CommandKind::SetPrinterReady => "SET_PRINTER_READY",
            CommandKind::CancelPrinterReady => "CANCEL_PRINTER_READY",
            CommandKind::ResetPrinter => "RESET_PRINTER",
        }
    }
}

impl FromStr for CommandKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| ProtocolError::UnknownCommand(s.to_string()))
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a file transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferKind {
    DownloadFromConnect,
    DownloadFromUrl,
    UploadToConnect,
}

impl TransferKind {
    pub fn is_download(self) -> bool {
        !matches!(self, TransferKind::UploadToConnect)
    }
}

/// Lifecycle of one transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferState {
    Enqueued,
    Running,
    Finishing,
    Finished,
    Aborted,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Finished | TransferState::Aborted | TransferState::Failed
        )
    }
}

/// Kind of physical medium behind a storage root.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageType {
    Local,
    Sdcard,
    Usb,
}

/// What happened to a file, as reported in `FILE_CHANGED`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileChangeKind {
    Created,
    Modified,
    Deleted,
}

/// Network identity included in INFO payloads and registration.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lan_mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lan_ipv4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lan_ipv6: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi_mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi_ipv4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wifi_ssid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

/// Drop `null` values recursively so sparse payloads stay compact.
pub fn filter_null(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, filter_null(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .filter(|v| !v.is_null())
                .map(filter_null)
                .collect(),
        ),
        other => other,
    }
}

/// One discrete, ordered message for `/p/events`.
///
/// The wall-clock `timestamp` is stamped by the sender at transmission time;
/// producers only record a monotonic enqueue instant.
#[derive(Clone, Debug)]
pub struct Event {
    pub kind: EventKind,
    pub source: Source,
    pub command_id: Option<u32>,
    pub transfer_id: Option<u32>,
    pub job_id: Option<u32>,
    pub reason: Option<String>,
    pub state: Option<State>,
    pub data: Map<String, Value>,
}

impl Event {
    pub fn new(kind: EventKind, source: Source) -> Self {
        Self {
            kind,
            source,
            command_id: None,
            transfer_id: None,
            job_id: None,
            reason: None,
            state: None,
            data: Map::new(),
        }
    }

    pub fn with_command_id(mut self, command_id: u32) -> Self {
        self.command_id = Some(command_id);
        self
    }

    pub fn with_transfer_id(mut self, transfer_id: u32) -> Self {
        self.transfer_id = Some(transfer_id);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_state(mut self, state: State) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Render the `/p/events` body. `timestamp` is wall-clock seconds.
    pub fn to_payload(&self, timestamp: f64) -> Value {
        let mut body = Map::new();
        body.insert("event".into(), serde_json::to_value(self.kind).unwrap_or(Value::Null));
        body.insert(
            "source".into(),
            serde_json::to_value(self.source).unwrap_or(Value::Null),
        );
        body.insert("timestamp".into(), round_timestamp(timestamp).into());
        if let Some(id) = self.command_id {
            body.insert("command_id".into(), id.into());
        }
        if let Some(id) = self.transfer_id {
            body.insert("transfer_id".into(), id.into());
        }
        if let Some(id) = self.job_id {
            body.insert("job_id".into(), id.into());
        }
        if let Some(reason) = &self.reason {
            body.insert("reason".into(), reason.clone().into());
        }
        if let Some(state) = self.state {
            body.insert(
                "state".into(),
                serde_json::to_value(state).unwrap_or(Value::Null),
            );
        }
        body.insert("data".into(), filter_null(Value::Object(self.data.clone())));
        Value::Object(body)
    }
}

fn round_timestamp(ts: f64) -> f64 {
    (ts * 10.0).round() / 10.0
}

/// The telemetry slot: latest-value-wins status snapshot.
///
/// Unlike events, telemetry is overwritten rather than queued; merging two
/// snapshots keeps the most recent value per field.
#[derive(Clone, Debug, Default)]
pub struct Telemetry {
    fields: Map<String, Value>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `fields` over the current snapshot, newest value per key.
    pub fn merge(&mut self, fields: Map<String, Value>) {
        for (key, value) in fields {
            self.fields.insert(key, value);
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Drain the slot into a `/p/telemetry` body for the given state.
    pub fn take_payload(&mut self, state: State, command_id: Option<u32>) -> Value {
        let mut body = std::mem::take(&mut self.fields);
        body.insert(
            "state".into(),
            serde_json::to_value(state).unwrap_or(Value::Null),
        );
        if let Some(id) = command_id {
            body.insert("command_id".into(), id.into());
        }
        filter_null(Value::Object(body))
    }
}

/// A command parsed from a telemetry response.
#[derive(Clone, Debug)]
pub struct Command {
    pub id: u32,
    pub kind: CommandKind,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub force: bool,
}

impl Command {
    /// Parse the JSON body of a command-carrying telemetry response:
    /// `{"command": "...", "args": [...], "kwargs": {...}}`.
    pub fn from_body(id: u32, body: &[u8], force: bool) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| ProtocolError::MalformedBody(e.to_string()))?;
        let name = value
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::MalformedBody("missing `command`".into()))?;
        let kind = name.parse::<CommandKind>()?;
        let args = value
            .get("args")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let kwargs = value
            .get("kwargs")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Ok(Self {
            id,
            kind,
            args,
            kwargs,
            force,
        })
    }

    fn kwarg_str(&self, name: &'static str) -> Result<String, ProtocolError> {
        self.kwargs
            .get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(ProtocolError::MissingArgument {
                kind: self.kind,
                name,
            })
    }

    fn kwarg_flag(&self, name: &str) -> bool {
        self.kwargs.get(name).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Discriminate the raw kwargs into the typed per-kind argument record.
    pub fn detail(&self) -> Result<CommandDetail, ProtocolError> {
        let detail = match self.kind {
            CommandKind::SendInfo => CommandDetail::SendInfo,
            CommandKind::Gcode => CommandDetail::Gcode {
                gcode: self.kwarg_str("gcode")?,
            },
            CommandKind::StartPrint => CommandDetail::StartPrint {
                path: self.kwarg_str("path")?,
            },
            CommandKind::StopPrint => CommandDetail::StopPrint,
            CommandKind::PausePrint => CommandDetail::PausePrint,
            CommandKind::ResumePrint => CommandDetail::ResumePrint,
            CommandKind::SendFileInfo => CommandDetail::SendFileInfo {
                path: self.kwarg_str("path")?,
            },
            CommandKind::SendJobInfo => CommandDetail::SendJobInfo,
            CommandKind::DeleteFile => CommandDetail::DeleteFile {
                path: self.kwarg_str("path")?,
            },
            CommandKind::DeleteDirectory => CommandDetail::DeleteDirectory {
                path: self.kwarg_str("path")?,
            },
            CommandKind::CreateDirectory => CommandDetail::CreateDirectory {
                path: self.kwarg_str("path")?,
            },
            CommandKind::StartUrlDownload => CommandDetail::StartUrlDownload {
                path: self.kwarg_str("path")?,
                url: self.kwarg_str("url")?,
                to_print: self.kwarg_flag("printing"),
                to_select: self.kwarg_flag("selecting"),
            },
            CommandKind::StartConnectDownload => CommandDetail::StartConnectDownload {
                path: self.kwarg_str("path")?,
                source: self.kwarg_str("source")?,
                to_print: self.kwarg_flag("printing"),
                to_select: self.kwarg_flag("selecting"),
            },
            CommandKind::StopTransfer => CommandDetail::StopTransfer,
            CommandKind::SendTransferInfo => CommandDetail::SendTransferInfo,
            CommandKind::SetPrinterReady => CommandDetail::SetPrinterReady,
            CommandKind::CancelPrinterReady => CommandDetail::CancelPrinterReady,
            CommandKind::ResetPrinter => CommandDetail::ResetPrinter,
        };
        Ok(detail)
    }
}

/// Typed argument record per command kind.
#[derive(Clone, Debug, PartialEq)]
pub enum CommandDetail {
    SendInfo,
    Gcode { gcode: String },
    StartPrint { path: String },
    StopPrint,
    PausePrint,
    ResumePrint,
    SendFileInfo { path: String },
    SendJobInfo,
    DeleteFile { path: String },
    DeleteDirectory { path: String },
    CreateDirectory { path: String },
    StartUrlDownload { path: String, url: String, to_print: bool, to_select: bool },
    StartConnectDownload { path: String, source: String, to_print: bool, to_select: bool },
    StopTransfer,
    SendTransferInfo,
    SetPrinterReady,
    CancelPrinterReady,
    ResetPrinter,
}

/// Body of `POST /p/register`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub sn: String,
    pub fingerprint: String,
    pub printer_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
}

/// Format a server url from host settings.
pub fn connect_url(host: &str, tls: bool, port: u16) -> String {
    let protocol = if tls { "https" } else { "http" };
    if port != 0 {
        format!("{protocol}://{host}:{port}")
    } else {
        format!("{protocol}://{host}")
    }
}

/// Flat file index entry produced by `get_info` serialization.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIndexEntry {
    pub path: String,
    pub size: u64,
    pub m_timestamp: i64,
    pub read_only: bool,
}

pub type FileIndex = BTreeMap<String, FileIndexEntry>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_kind_round_trips_wire_names() {
        for (name, kind) in [
            ("SEND_INFO", CommandKind::SendInfo),
            ("START_URL_DOWNLOAD", CommandKind::StartUrlDownload),
            ("RESET_PRINTER", CommandKind::ResetPrinter),
        ] {
            assert_eq!(name.parse::<CommandKind>().unwrap(), kind);
            assert_eq!(kind.as_str(), name);
        }
        assert!("MAKE_COFFEE".parse::<CommandKind>().is_err());
    }

    #[test]
    fn printing_cannot_jump_to_ready() {
        assert!(!State::Printing.can_transition(State::Ready));
        assert!(State::Printing.can_transition(State::Finished));
        assert!(State::Finished.can_transition(State::Ready));
        assert!(State::Printing.can_transition(State::Error));
        assert!(State::Idle.can_transition(State::Ready));
        assert!(State::Ready.can_transition(State::Idle));
    }

    #[test]
    fn event_payload_shape() {
        let event = Event::new(EventKind::Rejected, Source::Connect)
            .with_command_id(42)
            .with_reason("busy")
            .with_state(State::Idle)
            .with_data("detail", json!(null));
        let payload = event.to_payload(1700000000.04);
        assert_eq!(payload["event"], "REJECTED");
        assert_eq!(payload["source"], "CONNECT");
        assert_eq!(payload["command_id"], 42);
        assert_eq!(payload["reason"], "busy");
        assert_eq!(payload["state"], "IDLE");
        assert_eq!(payload["timestamp"], 1700000000.0);
        // null data values are filtered out
        assert!(payload["data"].as_object().unwrap().is_empty());
    }

    #[test]
    fn telemetry_overwrites_per_field() {
        let mut slot = Telemetry::new();
        slot.set("temp_nozzle", json!(214.3));
        slot.set("temp_nozzle", json!(215.0));
        slot.set("temp_bed", json!(60.1));
        let payload = slot.take_payload(State::Printing, Some(7));
        assert_eq!(payload["temp_nozzle"], 215.0);
        assert_eq!(payload["temp_bed"], 60.1);
        assert_eq!(payload["state"], "PRINTING");
        assert_eq!(payload["command_id"], 7);
        assert!(slot.is_empty());
    }

    #[test]
    fn command_body_parses_into_detail() {
        let body = json!({
            "command": "START_URL_DOWNLOAD",
            "kwargs": {
                "path": "/usb/model.gcode",
                "url": "https://example.test/model.gcode",
                "printing": true,
            }
        });
        let cmd = Command::from_body(9, body.to_string().as_bytes(), false).unwrap();
        assert_eq!(cmd.kind, CommandKind::StartUrlDownload);
        assert_eq!(
            cmd.detail().unwrap(),
            CommandDetail::StartUrlDownload {
                path: "/usb/model.gcode".into(),
                url: "https://example.test/model.gcode".into(),
                to_print: true,
                to_select: false,
            }
        );
    }

    #[test]
    fn missing_kwarg_is_reported() {
        let body = json!({"command": "SEND_FILE_INFO", "kwargs": {}});
        let cmd = Command::from_body(1, body.to_string().as_bytes(), false).unwrap();
        let err = cmd.detail().unwrap_err();
        assert!(matches!(err, ProtocolError::MissingArgument { name: "path", .. }));
    }

    #[test]
    fn connect_url_formats() {
        assert_eq!(connect_url("connect", true, 0), "https://connect");
        assert_eq!(connect_url("connect", false, 8000), "http://connect:8000");
    }
}
