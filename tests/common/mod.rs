//! Shared test utilities for integration tests.
//!
//! Downstream service doubles bound to ephemeral localhost ports:
//! - `HttpDouble`: records POST bodies and answers a scripted status/body
//! - `RpcDouble`: line-delimited JSON-RPC logger
//! - `GrpcDouble`: tonic `LogService` with an optional response delay

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Request, Response, Status};

use switchboard::proto::log_service_server::{LogService, LogServiceServer};
use switchboard::proto::{Log, LogRequest, LogResponse};
use switchboard::transport::rpc::{RpcLogArgs, RpcRequest, RpcResponse};
use switchboard::transport::HttpEndpoints;

// ============================================================================
// HTTP
// ============================================================================

#[derive(Default)]
struct HttpScript {
    status: Option<StatusCode>,
    body: Option<Value>,
    delay: Duration,
    received: Vec<(String, Value)>,
}

/// HTTP service double. Answers `202 {"error":false,"message":"ok"}` until
/// scripted otherwise.
#[derive(Clone)]
pub struct HttpDouble {
    pub addr: SocketAddr,
    script: Arc<Mutex<HttpScript>>,
}

impl HttpDouble {
    pub async fn start() -> Self {
        let script = Arc::new(Mutex::new(HttpScript::default()));
        let app = Router::new().fallback(record).with_state(Arc::clone(&script));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, script }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Endpoints pointing every action at this double.
    pub fn endpoints(&self) -> HttpEndpoints {
        HttpEndpoints {
            auth: self.url("/authenticate"),
            log: self.url("/log"),
            mail: self.url("/send"),
        }
    }

    pub fn respond_with(&self, status: StatusCode, body: Value) {
        let mut script = self.script.lock().unwrap();
        script.status = Some(status);
        script.body = Some(body);
    }

    pub fn delay_by(&self, delay: Duration) {
        self.script.lock().unwrap().delay = delay;
    }

    /// `(path, body)` of every request received so far.
    pub fn received(&self) -> Vec<(String, Value)> {
        self.script.lock().unwrap().received.clone()
    }
}

async fn record(
    State(script): State<Arc<Mutex<HttpScript>>>,
    uri: Uri,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let (status, reply, delay) = {
        let mut script = script.lock().unwrap();
        let body = serde_json::from_slice(&body).unwrap_or(Value::Null);
        script.received.push((uri.path().to_string(), body));
        (
            script.status.unwrap_or(StatusCode::ACCEPTED),
            script
                .body
                .clone()
                .unwrap_or_else(|| json!({"error": false, "message": "ok"})),
            script.delay,
        )
    };
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    (status, Json(reply))
}

// ============================================================================
// JSON-RPC
// ============================================================================

/// How the JSON-RPC double answers each call.
#[derive(Debug, Clone)]
pub enum RpcReply {
    /// `"Processed payload via RPC:<name>"`
    Processed,
    /// `{"result":null,"error":<message>}`
    Error(String),
    /// A well-formed result under a different id.
    WrongId,
}

/// JSON-RPC logger double.
pub struct RpcDouble {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<RpcRequest<RpcLogArgs>>>>,
}

impl RpcDouble {
    pub async fn start() -> Self {
        Self::start_with(RpcReply::Processed).await
    }

    pub async fn start_with(reply: RpcReply) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&received);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let sink = Arc::clone(&sink);
                let mode = reply.clone();
                tokio::spawn(async move {
                    let (read, mut write) = stream.into_split();
                    let mut lines = BufReader::new(read).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let request: RpcRequest<RpcLogArgs> = serde_json::from_str(&line).unwrap();
                        let processed = Value::String(format!(
                            "Processed payload via RPC:{}",
                            request.params[0].name
                        ));
                        let response = match &mode {
                            RpcReply::Processed => RpcResponse {
                                id: request.id,
                                result: Some(processed),
                                error: None,
                            },
                            RpcReply::Error(message) => RpcResponse {
                                id: request.id,
                                result: None,
                                error: Some(Value::String(message.clone())),
                            },
                            RpcReply::WrongId => RpcResponse {
                                id: request.id + 100,
                                result: Some(processed),
                                error: None,
                            },
                        };
                        sink.lock().unwrap().push(request);

                        let mut reply = serde_json::to_vec(&response).unwrap();
                        reply.push(b'\n');
                        if write.write_all(&reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        Self { addr, received }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// `(method, args)` of every call received so far.
    pub fn received(&self) -> Vec<(String, RpcLogArgs)> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|r| (r.method.clone(), r.params[0].clone()))
            .collect()
    }
}

// ============================================================================
// gRPC
// ============================================================================

struct LogServiceDouble {
    delay: Duration,
    failure: Option<String>,
    written: Arc<Mutex<Vec<Log>>>,
    calls: Arc<AtomicUsize>,
}

#[tonic::async_trait]
impl LogService for LogServiceDouble {
    async fn write_log(
        &self,
        request: Request<LogRequest>,
    ) -> Result<Response<LogResponse>, Status> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(message) = &self.failure {
            return Err(Status::internal(message.clone()));
        }
        let entry = request
            .into_inner()
            .log_entry
            .ok_or_else(|| Status::invalid_argument("missing log entry"))?;
        self.written.lock().unwrap().push(entry);
        Ok(Response::new(LogResponse {
            result: "logged!".to_string(),
        }))
    }
}

/// gRPC logger double.
pub struct GrpcDouble {
    pub addr: SocketAddr,
    written: Arc<Mutex<Vec<Log>>>,
    calls: Arc<AtomicUsize>,
}

impl GrpcDouble {
    pub async fn start() -> Self {
        Self::start_with_delay(Duration::ZERO).await
    }

    /// Every `WriteLog` waits `delay` before answering.
    pub async fn start_with_delay(delay: Duration) -> Self {
        Self::spawn(delay, None).await
    }

    /// Every `WriteLog` answers `INTERNAL` with `message`.
    pub async fn start_failing(message: &str) -> Self {
        Self::spawn(Duration::ZERO, Some(message.to_string())).await
    }

    async fn spawn(delay: Duration, failure: Option<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let written = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicUsize::new(0));

        let service = LogServiceDouble {
            delay,
            failure,
            written: Arc::clone(&written),
            calls: Arc::clone(&calls),
        };
        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(LogServiceServer::new(service))
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .unwrap();
        });

        Self {
            addr,
            written,
            calls,
        }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn written(&self) -> Vec<Log> {
        self.written.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}
