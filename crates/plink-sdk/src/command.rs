//! Command lifecycle and handler registry.
//!
//! One command may be in flight at a time. The loop parses it out of a
//! telemetry response and emits `ACCEPTED`; the handler context later drives
//! it through `RUNNING` to exactly one terminal event. Handlers never run on
//! the loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use plink_protocol::{Command, CommandKind, EventKind, Source};
use serde_json::{Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandState {
    New,
    Accepted,
    Running,
    Finished,
    Rejected,
    Failed,
}

impl CommandState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandState::Finished | CommandState::Rejected | CommandState::Failed
        )
    }

    /// The event kind reporting this state to the service.
    pub fn event_kind(self) -> Option<EventKind> {
        match self {
            CommandState::Accepted | CommandState::Running => Some(EventKind::Accepted),
            CommandState::Finished => Some(EventKind::Finished),
            CommandState::Rejected => Some(EventKind::Rejected),
            CommandState::Failed => Some(EventKind::Failed),
            CommandState::New => None,
        }
    }
}

/// One in-flight command plus its state machine position.
#[derive(Clone, Debug)]
pub struct CommandInstance {
    pub command: Command,
    pub state: CommandState,
}

impl CommandInstance {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            state: CommandState::New,
        }
    }

    pub fn id(&self) -> u32 {
        self.command.id
    }

    pub fn kind(&self) -> CommandKind {
        self.command.kind
    }
}

/// What a handler hands back: the source to report, an optional event kind
/// overriding `FINISHED` (e.g. `INFO` for `SEND_INFO`), and payload data.
#[derive(Clone, Debug)]
pub struct HandlerOutcome {
    pub source: Source,
    pub event: Option<EventKind>,
    pub data: Map<String, Value>,
}

impl HandlerOutcome {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            event: None,
            data: Map::new(),
        }
    }

    pub fn with_event(mut self, event: EventKind) -> Self {
        self.event = Some(event);
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

pub type CommandHandler =
    Arc<dyn Fn(Command) -> BoxFuture<'static, anyhow::Result<HandlerOutcome>> + Send + Sync>;

/// Kind → handler mapping. Kinds are a closed enum, so anything the service
/// sends that parses but has no handler is `REJECTED` as not implemented.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: Mutex<HashMap<CommandKind, CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a synchronous handler for `kind`.
    pub fn register<F>(&self, kind: CommandKind, handler: F)
    where
        F: Fn(&Command) -> anyhow::Result<HandlerOutcome> + Send + Sync + 'static,
    {
        self.register_async(kind, move |command: Command| {
            let result = handler(&command);
            async move { result }
        });
    }

    /// Register (or replace) a handler that awaits.
    pub fn register_async<F, Fut>(&self, kind: CommandKind, handler: F)
    where
        F: Fn(Command) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<HandlerOutcome>> + Send + 'static,
    {
        let handler: CommandHandler = Arc::new(move |command| handler(command).boxed());
        self.handlers
            .lock()
            .expect("registry lock")
            .insert(kind, handler);
    }

    pub fn get(&self, kind: CommandKind) -> Option<CommandHandler> {
        self.handlers.lock().expect("registry lock").get(&kind).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn command(kind: &str) -> Command {
        let body = json!({"command": kind, "kwargs": {}});
        Command::from_body(1, body.to_string().as_bytes(), false).unwrap()
    }

    #[tokio::test]
    async fn replacing_a_handler_is_allowed() {
        let registry = CommandRegistry::new();
        registry.register(CommandKind::SendInfo, |_| {
            Ok(HandlerOutcome::new(Source::Connect))
        });
        registry.register(CommandKind::SendInfo, |_| {
            Ok(HandlerOutcome::new(Source::Marlin))
        });
        let handler = registry.get(CommandKind::SendInfo).unwrap();
        let outcome = handler(command("SEND_INFO")).await.unwrap();
        assert_eq!(outcome.source, Source::Marlin);
    }

    #[tokio::test]
    async fn async_handlers_run() {
        let registry = CommandRegistry::new();
        registry.register_async(CommandKind::StopPrint, |_| async {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            Ok(HandlerOutcome::new(Source::Connect).with_event(EventKind::Info))
        });
        let handler = registry.get(CommandKind::StopPrint).unwrap();
        let outcome = handler(command("STOP_PRINT")).await.unwrap();
        assert_eq!(outcome.event, Some(EventKind::Info));
    }

    #[test]
    fn missing_handler_is_none() {
        let registry = CommandRegistry::new();
        assert!(registry.get(CommandKind::ResetPrinter).is_none());
    }

    #[test]
    fn terminal_states() {
        assert!(CommandState::Finished.is_terminal());
        assert!(CommandState::Rejected.is_terminal());
        assert!(CommandState::Failed.is_terminal());
        assert!(!CommandState::Running.is_terminal());
        assert!(!CommandState::New.is_terminal());
    }
}
