//! In-memory providers and models for tests.

use crate::error::{CapabilityError, SourceError};
use crate::gateway::{SourceParams, SourceProvider};
use crate::llm::{CapabilityModel, PromptTemplate};
use crate::models::Platform;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// A raw profile as a provider would send it.
pub fn profile_json(platform: &str, handle: &str, followers: Option<u64>) -> Value {
    json!({
        "platform": platform,
        "handle": handle,
        "followers": followers,
    })
}

/// Source provider answering from fixed scripts.
#[derive(Default)]
pub struct ScriptedProvider {
    discover: BTreeMap<Platform, Vec<Value>>,
    lookups: BTreeMap<(Platform, String), Value>,
    always_fail: Option<SourceError>,
    failures: Mutex<VecDeque<SourceError>>,
    latency: Duration,
    calls: AtomicU32,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Profiles returned by discovery on `platform`.
    pub fn with_discover(mut self, platform: Platform, profiles: Vec<Value>) -> Self {
        self.discover.insert(platform, profiles);
        self
    }

    /// Profile returned by a lookup of `handle` on `platform`.
    pub fn with_lookup(mut self, platform: Platform, handle: &str, profile: Value) -> Self {
        self.lookups.insert((platform, handle.to_string()), profile);
        self
    }

    /// Fail every call with `error`.
    pub fn always_fail(mut self, error: SourceError) -> Self {
        self.always_fail = Some(error);
        self
    }

    /// Fail the next calls with `errors`, in order, then behave normally.
    pub fn fail_first(self, errors: Vec<SourceError>) -> Self {
        if let Ok(mut queue) = self.failures.lock() {
            queue.extend(errors);
        }
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceProvider for ScriptedProvider {
    async fn fetch(&self, params: &SourceParams) -> Result<Value, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self.failures.lock().unwrap().pop_front();
        if let Some(error) = scripted {
            return Err(error);
        }
        if let Some(ref error) = self.always_fail {
            return Err(error.clone());
        }

        match params {
            SourceParams::Discover { platform, .. } => Ok(json!({
                "results": self.discover.get(platform).cloned().unwrap_or_default()
            })),
            SourceParams::Lookup { platform, handle } => {
                let found: Vec<Value> = self
                    .lookups
                    .get(&(*platform, handle.clone()))
                    .cloned()
                    .into_iter()
                    .collect();
                Ok(json!({ "results": found }))
            }
        }
    }
}

/// Capability model answering from a script, then from a fallback.
pub struct ScriptedModel {
    script: Mutex<VecDeque<Result<Value, CapabilityError>>>,
    fallback: Option<Result<Value, CapabilityError>>,
    strict_prompts: AtomicU32,
    calls: AtomicU32,
}

impl ScriptedModel {
    pub fn new(script: Vec<Result<Value, CapabilityError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: None,
            strict_prompts: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        }
    }

    /// Answer every call with `answer` once the script runs out.
    pub fn always(answer: Result<Value, CapabilityError>) -> Self {
        let mut model = Self::new(Vec::new());
        model.fallback = Some(answer);
        model
    }

    pub fn saw_strict_prompt(&self) -> bool {
        self.strict_prompts.load(Ordering::SeqCst) > 0
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CapabilityModel for ScriptedModel {
    async fn infer(
        &self,
        template: &PromptTemplate,
        _context: &BTreeMap<String, String>,
    ) -> Result<Value, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if template.strict {
            self.strict_prompts.fetch_add(1, Ordering::SeqCst);
        }

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(answer) => answer,
            None => self.fallback.clone().unwrap_or_else(|| {
                Err(CapabilityError::Unavailable("script exhausted".to_string()))
            }),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Serve one canned HTTP response on a local port.
///
/// Returns the base URL and a handle resolving to the raw request text.
pub async fn serve_once(
    status: u16,
    headers: &[(&str, &str)],
    body: &str,
) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut response = format!("HTTP/1.1 {} Canned\r\n", status);
    response.push_str("content-type: application/json\r\nconnection: close\r\n");
    response.push_str(&format!("content-length: {}\r\n", body.len()));
    for (name, value) in headers {
        response.push_str(&format!("{}: {}\r\n", name, value));
    }
    response.push_str("\r\n");
    response.push_str(body);

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_request(&mut socket).await;
        socket.write_all(response.as_bytes()).await.unwrap();
        let _ = socket.shutdown().await;
        request
    });

    (format!("http://{}", addr), handle)
}

/// Read one request: headers plus a `content-length` body.
async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let length = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}
