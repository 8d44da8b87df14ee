use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use geofetcher::HttpFetcher;
use geostore::{
    errors::StorageError,
    fetch::{FetchOutcome, FetchRequest, SourceFetcher},
    models::ChangeToken,
};
use tokio::{net::TcpListener, sync::oneshot};

const LAST_MODIFIED: &str = "Wed, 01 Jan 2020 00:00:00 GMT";
const USER_AGENT: &str = "geosync-test/0.1";

#[derive(Clone, Default)]
struct Seen {
    requests: Arc<Mutex<Vec<HeaderMap>>>,
}

impl Seen {
    fn record(&self, headers: &HeaderMap) {
        self.requests.lock().unwrap().push(headers.clone());
    }

    fn last_header(&self, name: header::HeaderName) -> Option<String> {
        self.requests
            .lock()
            .unwrap()
            .last()
            .and_then(|headers| headers.get(&name))
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }
}

/// Behaves like a static file server holding one file last changed on
/// 2020-01-01.
async fn dated_file(State(seen): State<Seen>, headers: HeaderMap) -> Response {
    seen.record(&headers);
    let unchanged = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|value| value.to_str().ok())
        == Some(LAST_MODIFIED);
    if unchanged {
        return StatusCode::NOT_MODIFIED.into_response();
    }
    ([(header::LAST_MODIFIED, LAST_MODIFIED)], b"PK-payload".to_vec()).into_response()
}

async fn undated_file(State(seen): State<Seen>, headers: HeaderMap) -> Response {
    seen.record(&headers);
    b"raw-geojson".to_vec().into_response()
}

async fn broken(State(seen): State<Seen>, headers: HeaderMap) -> Response {
    seen.record(&headers);
    (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response()
}

async fn always_304(State(seen): State<Seen>, headers: HeaderMap) -> Response {
    seen.record(&headers);
    StatusCode::NOT_MODIFIED.into_response()
}

struct TestServer {
    addr: SocketAddr,
    seen: Seen,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestServer {
    async fn spawn() -> Result<Self> {
        let seen = Seen::default();
        let app = Router::new()
            .route("/dated.zip", get(dated_file))
            .route("/undated.geojson", get(undated_file))
            .route("/broken.zip", get(broken))
            .route("/stuck.zip", get(always_304))
            .with_state(seen.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind test listener")?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Ok(Self {
            addr,
            seen,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn fetcher() -> Result<HttpFetcher> {
    Ok(HttpFetcher::new(USER_AGENT, Duration::from_secs(10))?)
}

#[tokio::test]
async fn unconditional_fetch_returns_payload_and_token() -> Result<()> {
    let server = TestServer::spawn().await?;
    let url = server.url("/dated.zip");

    let outcome = fetcher()?
        .fetch(FetchRequest {
            url: &url,
            validator: None,
        })
        .await?;

    assert_eq!(
        outcome,
        FetchOutcome::Modified {
            payload: b"PK-payload".to_vec(),
            token: Some(ChangeToken::new(LAST_MODIFIED)),
        }
    );
    assert_eq!(server.seen.last_header(header::IF_MODIFIED_SINCE), None);
    assert_eq!(
        server.seen.last_header(header::USER_AGENT).as_deref(),
        Some(USER_AGENT)
    );
    Ok(())
}

#[tokio::test]
async fn validator_is_sent_and_304_means_not_modified() -> Result<()> {
    let server = TestServer::spawn().await?;
    let url = server.url("/dated.zip");
    let token = ChangeToken::new(LAST_MODIFIED);

    let outcome = fetcher()?
        .fetch(FetchRequest {
            url: &url,
            validator: Some(&token),
        })
        .await?;

    assert_eq!(outcome, FetchOutcome::NotModified);
    assert_eq!(
        server.seen.last_header(header::IF_MODIFIED_SINCE).as_deref(),
        Some(LAST_MODIFIED)
    );
    Ok(())
}

#[tokio::test]
async fn stale_validator_gets_full_body() -> Result<()> {
    let server = TestServer::spawn().await?;
    let url = server.url("/dated.zip");
    let stale = ChangeToken::new("Mon, 01 Jan 2018 00:00:00 GMT");

    let outcome = fetcher()?
        .fetch(FetchRequest {
            url: &url,
            validator: Some(&stale),
        })
        .await?;

    assert!(matches!(
        outcome,
        FetchOutcome::Modified { token: Some(ref t), .. } if t.as_str() == LAST_MODIFIED
    ));
    Ok(())
}

#[tokio::test]
async fn missing_last_modified_leaves_token_empty() -> Result<()> {
    let server = TestServer::spawn().await?;
    let url = server.url("/undated.geojson");

    let outcome = fetcher()?
        .fetch(FetchRequest {
            url: &url,
            validator: None,
        })
        .await?;

    assert_eq!(
        outcome,
        FetchOutcome::Modified {
            payload: b"raw-geojson".to_vec(),
            token: None,
        }
    );
    Ok(())
}

#[tokio::test]
async fn error_status_is_reported() -> Result<()> {
    let server = TestServer::spawn().await?;
    let url = server.url("/broken.zip");

    let err = fetcher()?
        .fetch(FetchRequest {
            url: &url,
            validator: None,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, StorageError::Status(500)));
    Ok(())
}

#[tokio::test]
async fn not_modified_without_validator_is_an_error() -> Result<()> {
    let server = TestServer::spawn().await?;
    let url = server.url("/stuck.zip");

    let err = fetcher()?
        .fetch(FetchRequest {
            url: &url,
            validator: None,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, StorageError::Status(304)));
    Ok(())
}

#[tokio::test]
async fn unreachable_host_is_a_fetch_error() -> Result<()> {
    // Bind and immediately drop to get a port nothing listens on.
    let addr = TcpListener::bind("127.0.0.1:0").await?.local_addr()?;
    let url = format!("http://{addr}/gone.zip");

    let err = fetcher()?
        .fetch(FetchRequest {
            url: &url,
            validator: None,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, StorageError::Fetch(_)));
    Ok(())
}
