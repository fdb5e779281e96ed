//! Callback listener: receives the user's reply from the extension.
//!
//! Runs as an axum server on its own task, bound to the first free port at or
//! above the configured base port. The bound address is known before the
//! accept loop starts, so dispatch can embed it in every outgoing query. The
//! listener shares nothing with the dispatch loop except the correlation
//! table; replies are handed over through it.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{Method, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::constants::MAX_PORT_PROBES;
use crate::correlation::CorrelationTable;
use crate::types::{ReplyOutcome, ReplyPayload};

/// Errors that can occur while starting the callback listener
#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("no free port in range {base}..{} ({probes} probed)", .base + .probes)]
    NoFreePort { base: u16, probes: u16 },

    #[error("failed to bind callback listener on port {port}: {source}")]
    Bind {
        port: u16,
        source: std::io::Error,
    },

    #[error("failed to read bound address: {0}")]
    Addr(#[from] std::io::Error),
}

/// Handle to the running listener task.
pub struct CallbackListener {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CallbackListener {
    /// Bind and start serving.
    ///
    /// Port probing starts at `base_port` and walks upward a bounded number
    /// of times so several server instances can coexist. A `base_port` of 0
    /// binds an ephemeral port directly.
    pub async fn spawn(table: CorrelationTable, base_port: u16) -> Result<Self, ListenerError> {
        let listener = Self::bind_first_free(base_port).await?;
        let addr = listener.local_addr().map_err(ListenerError::Addr)?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let app = Self::router(table);

        let task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.changed().await;
            };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!("callback listener terminated: {e}");
            }
        });

        info!("callback listener bound on {addr}");
        Ok(Self {
            addr,
            shutdown_tx,
            task,
        })
    }

    /// Address the extension should POST replies to (without the `/response` path).
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting replies and wait for the serve task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }

    async fn bind_first_free(base_port: u16) -> Result<TcpListener, ListenerError> {
        for offset in 0..MAX_PORT_PROBES {
            let port = base_port.saturating_add(offset);
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    if offset > 0 {
                        debug!("port {base_port} was taken; bound {port} instead");
                    }
                    return Ok(listener);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    debug!("port {port} in use, trying {}", port + 1);
                }
                Err(source) => return Err(ListenerError::Bind { port, source }),
            }
        }
        Err(ListenerError::NoFreePort {
            base: base_port,
            probes: MAX_PORT_PROBES,
        })
    }

    fn router(table: CorrelationTable) -> Router {
        // The extension's webview posts cross-origin, so preflights must be
        // answered permissively.
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::POST, Method::OPTIONS])
            .allow_headers(Any);

        Router::new()
            .route("/response", post(handle_reply))
            .layer(cors)
            .with_state(table)
    }
}

/// `POST /response` with `{requestId, userInput, cancelled}`.
///
/// 200 on a matched id, 404 when the id is unknown or already resolved
/// (a stale or duplicate reply, not an error), 400 on a malformed body.
async fn handle_reply(
    State(table): State<CorrelationTable>,
    payload: Result<Json<ReplyPayload>, JsonRejection>,
) -> (StatusCode, Json<serde_json::Value>) {
    let Json(reply) = match payload {
        Ok(payload) => payload,
        Err(e) => {
            debug!("rejecting malformed reply body: {e}");
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })));
        }
    };

    let outcome = if reply.cancelled {
        ReplyOutcome::Cancelled
    } else {
        ReplyOutcome::Input(reply.user_input)
    };

    if table.resolve(&reply.request_id, outcome) {
        info!("delivered user reply for request {}", reply.request_id);
        (StatusCode::OK, Json(json!({ "success": true })))
    } else {
        debug!("no pending request matches id {}", reply.request_id);
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Request not found" })),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binds_ephemeral_port_and_shuts_down() {
        let table = CorrelationTable::new();
        let listener = CallbackListener::spawn(table, 0).await.unwrap();
        assert_ne!(listener.addr().port(), 0);
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn probes_past_an_occupied_port() {
        // Occupy a port, then ask the listener to start at that exact port.
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = blocker.local_addr().unwrap().port();

        let table = CorrelationTable::new();
        let listener = CallbackListener::spawn(table, taken).await.unwrap();
        assert_ne!(listener.addr().port(), taken);
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn reply_resolves_pending_request() {
        let table = CorrelationTable::new();
        let (id, rx) = table.register();
        let listener = CallbackListener::spawn(table, 0).await.unwrap();

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{}/response", listener.addr()))
            .json(&json!({ "requestId": id, "userInput": "carry on", "cancelled": false }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        assert_eq!(rx.await.unwrap(), ReplyOutcome::Input("carry on".into()));
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_id_gets_not_found() {
        let table = CorrelationTable::new();
        let listener = CallbackListener::spawn(table, 0).await.unwrap();

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{}/response", listener.addr()))
            .json(&json!({ "requestId": "req_missing", "userInput": "", "cancelled": false }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

        listener.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_body_gets_bad_request() {
        let table = CorrelationTable::new();
        let listener = CallbackListener::spawn(table, 0).await.unwrap();

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{}/response", listener.addr()))
            .header("content-type", "application/json")
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

        listener.shutdown().await;
    }
}
