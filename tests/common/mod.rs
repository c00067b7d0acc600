//! Shared harness for the streaming integration tests: a full service on a
//! loopback listener with the memory backend and datastore stub.
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use bytes::Bytes;
use tokio::sync::watch;
use tokio_stream::{Stream, StreamExt};

use icc_service::applause::{Applause, ApplauseConfig};
use icc_service::auth::Authenticater;
use icc_service::backend::MemoryBackend;
use icc_service::datastore::MemoryDatastore;
use icc_service::errors::Result as IccResult;
use icc_service::http::{build_router, AppState};
use icc_service::notify::Notify;

/// Resolves the user id from the `x-test-user` header so one service can
/// act for several users; no header means anonymous.
pub struct HeaderAuth;

#[async_trait]
impl Authenticater for HeaderAuth {
    async fn authenticate(&self, headers: &HeaderMap) -> IccResult<i32> {
        Ok(headers
            .get("x-test-user")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
            .unwrap_or(0))
    }
}

pub struct TestService {
    pub addr: SocketAddr,
    pub backend: Arc<MemoryBackend>,
    pub datastore: Arc<MemoryDatastore>,
    shutdown: watch::Sender<bool>,
}

impl TestService {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

impl Drop for TestService {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

pub async fn spawn_service(applause_config: ApplauseConfig) -> TestService {
    let backend = Arc::new(MemoryBackend::new());
    let datastore = Arc::new(MemoryDatastore::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let notify = Arc::new(Notify::new(backend.clone()));
    Arc::clone(&notify).start_background(shutdown_rx.clone());

    let applause = Arc::new(Applause::with_config(
        backend.clone(),
        datastore.clone(),
        applause_config,
    ));
    Arc::clone(&applause).start_background(shutdown_rx.clone());

    let app = build_router(AppState {
        notify,
        applause,
        auth: Arc::new(HeaderAuth),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("local addr");

    let mut serve_shutdown = shutdown_rx;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = serve_shutdown.changed().await;
            })
            .await;
    });

    TestService {
        addr,
        backend,
        datastore,
        shutdown: shutdown_tx,
    }
}

/// Fast applause cadence. The counting window stays at a full second
/// because the backend scores have second resolution; ticks are what the
/// scenarios wait on.
pub fn fast_applause_config() -> ApplauseConfig {
    ApplauseConfig {
        interval: Duration::from_millis(100),
        count_window: Duration::from_secs(1),
        ..ApplauseConfig::default()
    }
}

/// Client without a global timeout; streaming reads are bounded per line
/// with [`next_line_within`] instead.
pub fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("build client")
}

/// Splits a streaming response body into newline-delimited messages.
pub struct LineReader {
    stream: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    buffer: Vec<u8>,
}

impl LineReader {
    pub fn new(response: reqwest::Response) -> Self {
        Self {
            stream: Box::pin(response.bytes_stream()),
            buffer: Vec::new(),
        }
    }

    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                return Some(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
            }
            match self.stream.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(_)) | None => return None,
            }
        }
    }
}

pub async fn next_line_within(reader: &mut LineReader, limit: Duration) -> Option<String> {
    tokio::time::timeout(limit, reader.next_line())
        .await
        .ok()
        .flatten()
}

pub async fn next_json_within(
    reader: &mut LineReader,
    limit: Duration,
) -> Option<serde_json::Value> {
    let line = next_line_within(reader, limit).await?;
    Some(serde_json::from_str(&line).expect("json line"))
}
