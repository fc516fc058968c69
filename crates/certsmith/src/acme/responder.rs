//! HTTP-01 challenge responder
//!
//! A transient HTTP server that answers
//! `GET /.well-known/acme-challenge/<token>` from a [`ChallengeStore`].
//! It only lives for the duration of one ACME exchange.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::challenge::ChallengeStore;
use super::error::ResponderError;

/// How long `stop()` waits for in-flight requests before aborting
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct RunningServer {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

/// HTTP-01 challenge responder
///
/// `start()` binds the listener and returns once it accepts connections.
/// `stop()` shuts it down and is a no-op when the responder never started.
/// Dropping a running responder aborts the server task.
pub struct ChallengeResponder {
    addr: SocketAddr,
    store: ChallengeStore,
    stop_timeout: Duration,
    running: Option<RunningServer>,
}

impl ChallengeResponder {
    pub fn new(addr: SocketAddr, store: ChallengeStore) -> Self {
        Self {
            addr,
            store,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            running: None,
        }
    }

    /// Bound the graceful shutdown wait in `stop()`
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Build the router serving challenge responses from `store`
    pub fn router(store: ChallengeStore) -> Router {
        Router::new().fallback(serve_challenge).with_state(store)
    }

    /// Bind the listener and start serving
    ///
    /// Returns the bound address, which differs from the configured one when
    /// port 0 was requested.
    pub async fn start(&mut self) -> Result<SocketAddr, ResponderError> {
        if let Some(running) = &self.running {
            return Ok(running.local_addr);
        }

        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| ResponderError::from_bind(self.addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ResponderError::from_bind(self.addr, e))?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = Self::router(self.store.clone());

        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        info!(address = %local_addr, "HTTP-01 challenge responder listening");

        self.running = Some(RunningServer {
            local_addr,
            shutdown: shutdown_tx,
            task,
        });

        Ok(local_addr)
    }

    /// Address the responder is bound to, if running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Stop the responder and release the port
    ///
    /// Returns once the server task has finished, aborting it if graceful
    /// shutdown outlasts the stop timeout. Failures are logged; stopping
    /// never fails the run.
    pub async fn stop(&mut self) {
        let Some(mut running) = self.running.take() else {
            trace!("Challenge responder not running, nothing to stop");
            return;
        };

        let _ = running.shutdown.send(());

        let outcome = tokio::time::timeout(self.stop_timeout, &mut running.task).await;
        match outcome {
            Ok(Ok(Ok(()))) => {
                info!(address = %running.local_addr, "HTTP-01 challenge responder stopped");
            }
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "Challenge responder exited with an error");
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Challenge responder task failed");
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.stop_timeout.as_millis() as u64,
                    "Challenge responder did not shut down in time, aborting"
                );
                running.task.abort();
                // The listener is only closed once the cancelled task resolves
                let _ = running.task.await;
            }
        }
    }
}

impl Drop for ChallengeResponder {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            debug!(address = %running.local_addr, "Aborting challenge responder on drop");
            let _ = running.shutdown.send(());
            running.task.abort();
        }
    }
}

impl std::fmt::Debug for ChallengeResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeResponder")
            .field("addr", &self.addr)
            .field("local_addr", &self.local_addr())
            .field("pending_challenges", &self.store.len())
            .finish()
    }
}

async fn serve_challenge(State(store): State<ChallengeStore>, method: Method, uri: Uri) -> Response {
    let Some(token) = ChallengeStore::extract_token(uri.path()) else {
        trace!(path = %uri.path(), "Not an ACME challenge path");
        return StatusCode::NOT_FOUND.into_response();
    };

    if method != Method::GET {
        trace!(method = %method, token = %token, "Non-GET challenge request");
        return StatusCode::NOT_FOUND.into_response();
    }

    match store.get(token) {
        Some(key_authorization) => {
            debug!(token = %token, "Serving ACME challenge response");
            ([(header::CONTENT_TYPE, "text/plain")], key_authorization).into_response()
        }
        None => {
            debug!(token = %token, "Unknown ACME challenge token");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn started(store: ChallengeStore) -> (ChallengeResponder, SocketAddr) {
        let mut responder = ChallengeResponder::new("127.0.0.1:0".parse().unwrap(), store);
        let addr = responder.start().await.unwrap();
        (responder, addr)
    }

    #[tokio::test]
    async fn test_serves_registered_token() {
        let store = ChallengeStore::new();
        store.put("abc123", "abc123.thumbprint");
        let (mut responder, addr) = started(store).await;

        let resp = reqwest::get(format!("http://{}/.well-known/acme-challenge/abc123", addr))
            .await
            .unwrap();

        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        assert_eq!(
            resp.headers().get(reqwest::header::CONTENT_TYPE).unwrap(),
            "text/plain"
        );
        assert_eq!(resp.text().await.unwrap(), "abc123.thumbprint");

        responder.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_token_is_404() {
        let (mut responder, addr) = started(ChallengeStore::new()).await;

        let resp = reqwest::get(format!("http://{}/.well-known/acme-challenge/missing", addr))
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

        responder.stop().await;
    }

    #[tokio::test]
    async fn test_paths_outside_prefix_are_404() {
        let store = ChallengeStore::new();
        store.put("abc123", "abc123.thumbprint");
        let (mut responder, addr) = started(store).await;

        for path in [
            "/",
            "/abc123",
            "/.well-known/abc123",
            "/.well-known/acme-challenge/",
            "/.well-known/acme-challenge/abc123/extra",
            "/prefix/.well-known/acme-challenge/abc123",
        ] {
            let resp = reqwest::get(format!("http://{}{}", addr, path)).await.unwrap();
            assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND, "path {}", path);
        }

        responder.stop().await;
    }

    #[tokio::test]
    async fn test_removed_token_is_404() {
        let store = ChallengeStore::new();
        store.put("gone", "gone.thumbprint");
        let (mut responder, addr) = started(store.clone()).await;
        let url = format!("http://{}/.well-known/acme-challenge/gone", addr);

        assert_eq!(reqwest::get(&url).await.unwrap().status(), reqwest::StatusCode::OK);

        store.remove("gone");
        assert_eq!(
            reqwest::get(&url).await.unwrap().status(),
            reqwest::StatusCode::NOT_FOUND
        );

        responder.stop().await;
    }

    #[tokio::test]
    async fn test_non_get_requests_are_404() {
        let store = ChallengeStore::new();
        store.put("abc123", "abc123.thumbprint");
        let (mut responder, addr) = started(store).await;
        let client = reqwest::Client::new();

        for url in [
            format!("http://{}/.well-known/acme-challenge/abc123", addr),
            format!("http://{}/.well-known/acme-challenge/missing", addr),
        ] {
            let resp = client.post(&url).body("x").send().await.unwrap();
            assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND, "POST {}", url);

            let resp = client.head(&url).send().await.unwrap();
            assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND, "HEAD {}", url);
        }

        responder.stop().await;
    }

    #[tokio::test]
    async fn test_stop_after_timeout_releases_port() {
        use std::io::Write;

        let mut responder =
            ChallengeResponder::new("127.0.0.1:0".parse().unwrap(), ChallengeStore::new())
                .with_stop_timeout(Duration::from_millis(50));
        let addr = responder.start().await.unwrap();

        // A request that never completes keeps graceful shutdown waiting
        let mut stalled = std::net::TcpStream::connect(addr).unwrap();
        stalled
            .write_all(b"GET /.well-known/acme-challenge/abc HTTP/1.1\r\nHost: x\r\n")
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        responder.stop().await;
        assert!(!responder.is_running());

        let rebound = TcpListener::bind(addr).await;
        assert!(rebound.is_ok(), "port still held after stop: {:?}", rebound.err());
        drop(stalled);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let mut responder = ChallengeResponder::new("127.0.0.1:0".parse().unwrap(), ChallengeStore::new());
        assert!(!responder.is_running());
        responder.stop().await;
        responder.stop().await;
        assert!(responder.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_stop_releases_port() {
        let (mut responder, addr) = started(ChallengeStore::new()).await;
        assert!(responder.is_running());

        responder.stop().await;
        assert!(!responder.is_running());

        // The port can be bound again once stopped
        let mut again = ChallengeResponder::new(addr, ChallengeStore::new());
        assert_eq!(again.start().await.unwrap(), addr);
        again.stop().await;
    }

    #[tokio::test]
    async fn test_bind_conflict_is_addr_in_use() {
        let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = holder.local_addr().unwrap();

        let mut responder = ChallengeResponder::new(addr, ChallengeStore::new());
        let err = responder.start().await.unwrap_err();

        assert!(matches!(err, ResponderError::AddrInUse { .. }));
        assert!(!responder.is_running());
    }
}
