//! Scripted transport shared by the integration suites.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use plink_sdk::{ByteStream, HttpRequest, HttpResponse, HttpTransport, Method, TransportError};
use serde_json::Value;

pub struct ScriptedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ScriptedResponse {
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .push((name.to_ascii_lowercase(), value.to_string()));
        self
    }

    pub fn with_json(mut self, body: Value) -> Self {
        self.body = body.to_string().into_bytes();
        self.headers
            .push(("content-type".into(), "application/json".into()));
        self
    }

    /// A 200 telemetry response carrying a command.
    pub fn command(id: u32, body: Value) -> Self {
        Self::empty(200)
            .with_header("command-id", &id.to_string())
            .with_json(body)
    }
}

#[derive(Clone, Debug)]
pub struct SentRequest {
    pub method: Method,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl SentRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

pub enum StreamStep {
    Chunk(Vec<u8>),
    Delay(Duration),
    /// The stream never yields again.
    Stall,
}

#[derive(Default)]
pub struct MockTransport {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedResponse>>>,
    stream_script: Mutex<Option<(u16, Vec<(String, String)>, Vec<StreamStep>)>>,
    sent: Mutex<Vec<SentRequest>>,
}

fn path_of(url: &str) -> String {
    match url.find("://") {
        Some(scheme_end) => {
            let rest = &url[scheme_end + 3..];
            match rest.find('/') {
                Some(slash) => rest[slash..].to_string(),
                None => "/".to_string(),
            }
        }
        None => url.to_string(),
    }
}

fn method_name(method: Method) -> &'static str {
    match method {
        Method::Get => "GET",
        Method::Post => "POST",
    }
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Script the next response for `"POST /p/telemetry"`-style keys; each
    /// response is consumed once, then the default 204 applies.
    pub fn script(&self, key: &str, response: ScriptedResponse) {
        self.scripts
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn set_stream(
        &self,
        status: u16,
        headers: Vec<(String, String)>,
        steps: Vec<StreamStep>,
    ) {
        *self.stream_script.lock().unwrap() = Some((status, headers, steps));
    }

    pub fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().unwrap().clone()
    }

    /// Bodies of everything POSTed to `/p/events`, oldest first.
    pub fn events_sent(&self) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|req| req.path == "/p/events")
            .filter_map(|req| req.body)
            .collect()
    }

    pub fn event_kinds(&self) -> Vec<(String, Option<u64>)> {
        self.events_sent()
            .iter()
            .map(|body| {
                (
                    body["event"].as_str().unwrap_or_default().to_string(),
                    body["command_id"].as_u64(),
                )
            })
            .collect()
    }

    pub fn telemetry_sent(&self) -> Vec<SentRequest> {
        self.sent()
            .into_iter()
            .filter(|req| req.path == "/p/telemetry")
            .collect()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let path = path_of(&request.url);
        let key = format!("{} {}", method_name(request.method), path);
        self.sent.lock().unwrap().push(SentRequest {
            method: request.method,
            path: path.clone(),
            headers: request.headers.clone(),
            body: request
                .body
                .as_deref()
                .and_then(|raw| serde_json::from_slice(raw).ok()),
        });
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front);
        Ok(match scripted {
            Some(response) => HttpResponse {
                status: response.status,
                headers: response.headers,
                body: response.body,
            },
            None => HttpResponse {
                status: 204,
                headers: Vec::new(),
                body: Vec::new(),
            },
        })
    }

    async fn get_stream(
        &self,
        url: &str,
        headers: Vec<(String, String)>,
    ) -> Result<(HttpResponse, ByteStream), TransportError> {
        self.sent.lock().unwrap().push(SentRequest {
            method: Method::Get,
            path: path_of(url),
            headers,
            body: None,
        });
        let (status, head_headers, steps) = self
            .stream_script
            .lock()
            .unwrap()
            .take()
            .unwrap_or((404, Vec::new(), Vec::new()));
        let head = HttpResponse {
            status,
            headers: head_headers,
            body: Vec::new(),
        };
        let stream = futures_util::stream::iter(steps)
            .filter_map(|step| async move {
                match step {
                    StreamStep::Chunk(data) => Some(Ok(Bytes::from(data))),
                    StreamStep::Delay(duration) => {
                        tokio::time::sleep(duration).await;
                        None
                    }
                    StreamStep::Stall => {
                        futures_util::future::pending::<()>().await;
                        None
                    }
                }
            })
            .boxed();
        Ok((head, stream))
    }
}
