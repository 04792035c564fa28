//! Device-side SDK linking a 3D printer to the Connect management service.
//!
//! The embedding application constructs one [`Printer`], mounts storages on
//! its [`plink_files::Filesystem`], spawns the communication loop
//! ([`Printer::run`]) and the transfer scheduler
//! ([`transfer::TransferManager::run`]), and drives command handlers from its
//! own context via [`Printer::wait_command`] / [`Printer::command`]. Telemetry
//! and events are fed from any number of producer threads.
//!
//! ```no_run
//! use plink_protocol::{PrinterType, Source, State};
//! use plink_sdk::{Printer, PrinterConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PrinterConfig::new(PrinterType::I3Mk3s, "SN001")
//!     .with_server("connect.example", true, 0);
//! let printer = Printer::new(config)?;
//!
//! let code = printer.register().await?;
//! println!("pair this printer with code {code}");
//! while printer.get_token(&code).await?.is_none() {
//!     tokio::time::sleep(std::time::Duration::from_secs(1)).await;
//! }
//!
//! let loop_printer = printer.clone();
//! tokio::spawn(async move { loop_printer.run().await });
//! let transfers = printer.transfers().clone();
//! tokio::spawn(async move { transfers.run().await });
//!
//! printer.set_state(State::Idle, Source::Firmware)?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod command;
pub mod conditions;
pub mod error;
pub mod logging;
pub mod printer;
pub mod queue;
pub mod transfer;
pub mod transport;

pub use clock::{ClockWatcher, CLOCK_TOLERANCE};
pub use command::{CommandHandler, CommandInstance, CommandRegistry, CommandState, HandlerOutcome};
pub use conditions::{CondState, ConditionTree, CONDITION_COALESCE};
pub use error::SdkError;
pub use printer::{
    fingerprint_hex, Printer, PrinterConfig, CODE_TIMEOUT, MAX_BACKOFF, RETRY_BACKOFF,
    STOP_FLUSH_TIMEOUT, TELEMETRY_INTERVAL,
};
pub use queue::{EventQueue, QueuedEvent, QUEUE_CAPACITY};
pub use transfer::{
    TransferManager, TransferRequest, TransferSnapshot, CHUNK_INTERVAL, INACTIVITY_TIMEOUT,
    TRANSFER_INFO_INTERVAL,
};
pub use transport::{
    ByteStream, HttpRequest, HttpResponse, HttpTransport, Method, ReqwestTransport,
    TransportError, REQUEST_TIMEOUT,
};
