//! End-to-end loop scenarios against a scripted transport.

mod support;

use std::sync::Arc;
use std::time::Duration;

use plink_protocol::{CommandKind, PrinterType, Source, State};
use plink_sdk::{fingerprint_hex, HandlerOutcome, Printer, PrinterConfig, SdkError};
use serde_json::{json, Map};
use support::{MockTransport, ScriptedResponse};

fn test_printer(transport: Arc<MockTransport>, token: Option<&str>) -> Printer {
    let mut config = PrinterConfig::new(PrinterType::I3Mk3s, "SN123")
        .with_server("connect.example", false, 8000);
    config.token = token.map(str::to_string);
    Printer::with_parts(config, transport, Arc::new(plink_files::LocalStorage)).unwrap()
}

async fn wait_until<F: Fn() -> bool>(what: &str, deadline: Duration, check: F) {
    let until = tokio::time::Instant::now() + deadline;
    while !check() {
        assert!(
            tokio::time::Instant::now() < until,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn registration_happy_path() {
    let transport = MockTransport::new();
    transport.script(
        "POST /p/register",
        ScriptedResponse::empty(200).with_header("code", "ABCD"),
    );
    transport.script("GET /p/register", ScriptedResponse::empty(202));
    transport.script("GET /p/register", ScriptedResponse::empty(202));
    transport.script(
        "GET /p/register",
        ScriptedResponse::empty(200).with_header("token", "secret-token"),
    );

    let printer = test_printer(transport.clone(), None);
    assert_eq!(printer.fingerprint(), fingerprint_hex("SN123"));

    let code = printer.register().await.unwrap();
    assert_eq!(code, "ABCD");

    // Two pending polls, then the token arrives.
    assert!(printer.get_token(&code).await.unwrap().is_none());
    assert!(printer.get_token(&code).await.unwrap().is_none());
    let token = printer.get_token(&code).await.unwrap().unwrap();
    assert_eq!(token, "secret-token");
    assert_eq!(printer.token().as_deref(), Some("secret-token"));

    // Token is set exactly once; another registration attempt fails.
    assert!(matches!(
        printer.register().await,
        Err(SdkError::TokenAlreadySet)
    ));
    assert!(matches!(
        printer.set_token("other"),
        Err(SdkError::TokenAlreadySet)
    ));

    // With the token in place the loop starts pushing telemetry.
    let runner = printer.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    wait_until("first telemetry", Duration::from_secs(5), || {
        !transport.telemetry_sent().is_empty()
    })
    .await;
    let telemetry = &transport.telemetry_sent()[0];
    assert_eq!(telemetry.header("Token"), Some("secret-token"));
    assert_eq!(telemetry.header("Fingerprint"), Some(fingerprint_hex("SN123").as_str()));
    assert_eq!(telemetry.header("Printer-Type"), Some("1.3.1"));
    assert_eq!(telemetry.body.as_ref().unwrap()["state"], "BUSY");

    printer.stop_loop();
    handle.await.unwrap();
}

#[tokio::test]
async fn busy_command_is_rejected() {
    let transport = MockTransport::new();
    let start_print = json!({"command": "START_PRINT", "kwargs": {"path": "/usb/x.gcode"}});
    transport.script("POST /p/telemetry", ScriptedResponse::command(1, start_print.clone()));
    transport.script("POST /p/telemetry", ScriptedResponse::command(2, start_print));

    let printer = test_printer(transport.clone(), Some("tok"));
    printer.handler_async(CommandKind::StartPrint, |_cmd| async {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        Ok(HandlerOutcome::new(Source::Connect))
    });

    let runner = printer.clone();
    let loop_handle = tokio::spawn(async move { runner.run().await });
    let driver = printer.clone();
    let driver_handle = tokio::spawn(async move {
        while driver.wait_command().await {
            driver.command().await;
        }
    });

    wait_until("terminal events", Duration::from_secs(10), || {
        let kinds = transport.event_kinds();
        kinds.contains(&("FINISHED".into(), Some(1)))
            && kinds.contains(&("REJECTED".into(), Some(2)))
    })
    .await;

    let kinds = transport.event_kinds();
    assert!(kinds.contains(&("ACCEPTED".into(), Some(1))));
    let rejected = transport
        .events_sent()
        .into_iter()
        .find(|body| body["event"] == "REJECTED")
        .unwrap();
    assert_eq!(rejected["reason"], "busy");
    assert_eq!(rejected["command_id"], 2);
    // The second command never got ACCEPTED.
    assert!(!kinds.contains(&("ACCEPTED".into(), Some(2))));

    printer.stop_loop();
    loop_handle.await.unwrap();
    driver_handle.await.unwrap();
}

#[tokio::test]
async fn priority_command_preempts_running_one() {
    let transport = MockTransport::new();
    let start_print = json!({"command": "START_PRINT", "kwargs": {"path": "/usb/x.gcode"}});
    let reset = json!({"command": "RESET_PRINTER", "kwargs": {}});
    transport.script("POST /p/telemetry", ScriptedResponse::command(1, start_print));
    transport.script("POST /p/telemetry", ScriptedResponse::command(2, reset));

    let printer = test_printer(transport.clone(), Some("tok"));
    printer.handler_async(CommandKind::StartPrint, |_cmd| async {
        tokio::time::sleep(Duration::from_secs(3)).await;
        Ok(HandlerOutcome::new(Source::Connect))
    });
    printer.handler(CommandKind::ResetPrinter, |_cmd| {
        Ok(HandlerOutcome::new(Source::Connect))
    });

    let runner = printer.clone();
    let loop_handle = tokio::spawn(async move { runner.run().await });
    let driver = printer.clone();
    let driver_handle = tokio::spawn(async move {
        while driver.wait_command().await {
            driver.command().await;
        }
    });

    wait_until("reset finished", Duration::from_secs(15), || {
        transport
            .event_kinds()
            .contains(&("FINISHED".into(), Some(2)))
    })
    .await;

    let kinds = transport.event_kinds();
    assert!(kinds.contains(&("ACCEPTED".into(), Some(1))));
    assert!(kinds.contains(&("REJECTED".into(), Some(1))));
    assert!(kinds.contains(&("ACCEPTED".into(), Some(2))));
    let rejected = transport
        .events_sent()
        .into_iter()
        .find(|body| body["event"] == "REJECTED" && body["command_id"] == 1)
        .unwrap();
    assert_eq!(rejected["reason"], "preempted");
    // The preempted handler's own result is suppressed.
    assert!(!kinds.contains(&("FINISHED".into(), Some(1))));

    printer.stop_loop();
    loop_handle.await.unwrap();
    driver_handle.await.unwrap();
}

#[tokio::test]
async fn state_changes_map_one_to_one_onto_events() {
    let transport = MockTransport::new();
    let printer = test_printer(transport.clone(), Some("tok"));

    printer.set_state(State::Idle, Source::Firmware).unwrap();
    printer.set_state(State::Idle, Source::Firmware).unwrap(); // no-op
    printer.set_state(State::Printing, Source::Marlin).unwrap();
    assert!(matches!(
        printer.set_state(State::Ready, Source::Marlin),
        Err(SdkError::InvalidTransition { .. })
    ));
    printer.set_state(State::Finished, Source::Marlin).unwrap();
    printer.set_state(State::Ready, Source::Marlin).unwrap();

    let runner = printer.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    wait_until("state events", Duration::from_secs(5), || {
        transport
            .events_sent()
            .iter()
            .filter(|body| body["event"] == "STATE_CHANGED")
            .count()
            >= 4
    })
    .await;
    printer.stop_loop();
    handle.await.unwrap();

    let states: Vec<String> = transport
        .events_sent()
        .iter()
        .filter(|body| body["event"] == "STATE_CHANGED")
        .map(|body| body["state"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(states, vec!["IDLE", "PRINTING", "FINISHED", "READY"]);
}

#[tokio::test]
async fn telemetry_discarded_without_token_and_merged_with_one() {
    let transport = MockTransport::new();
    let printer = test_printer(transport.clone(), None);

    let mut fields = Map::new();
    fields.insert("temp_nozzle".into(), json!(215.0));
    printer.telemetry(fields); // discarded, no token

    printer.set_token("tok").unwrap();
    let mut fields = Map::new();
    fields.insert("temp_bed".into(), json!(60.0));
    printer.telemetry(fields);

    let runner = printer.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    wait_until("telemetry", Duration::from_secs(5), || {
        !transport.telemetry_sent().is_empty()
    })
    .await;
    printer.stop_loop();
    handle.await.unwrap();

    let body = transport.telemetry_sent()[0].body.clone().unwrap();
    assert!(body.get("temp_nozzle").is_none());
    assert_eq!(body["temp_bed"], 60.0);
}
