//! Dispatch loop: sends a query to the editor extension and suspends until
//! the human's reply comes back through the callback listener.
//!
//! One invocation of [`Dispatcher::ask`] owns exactly one pending request.
//! Candidates are probed sequentially in ranked order; a busy window never
//! causes the pending request to be dropped, because a *different* window may
//! accept the same request id on a later round and the reply it eventually
//! posts must still match.

use std::net::SocketAddr;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::{BUSY_RETRY_DELAY, DEFAULT_EXTENSION_PORT, PROBE_TIMEOUT, RECOVERY_DELAY};
use crate::correlation::CorrelationTable;
use crate::directory::CandidateDirectory;
use crate::types::{AskAccepted, AskRequest, CandidateEndpoint, CandidateError, DispatchOutcome, ReplyOutcome};

/// Errors surfaced by [`Dispatcher::ask`]
#[derive(Error, Debug)]
pub enum AskError {
    /// The user explicitly declined through the extension UI
    #[error("user cancelled the conversation")]
    Cancelled,

    /// No candidate accepted the query, even after the recovery retry
    #[error("could not reach any extension window (tried {addresses}): {last_error}")]
    Connectivity {
        addresses: String,
        last_error: String,
    },

    /// The surrounding process is shutting down
    #[error("wait for user reply was cancelled by shutdown")]
    Shutdown,

    /// The pending entry vanished without a reply
    #[error("result channel closed before a reply arrived")]
    ChannelClosed,
}

enum ProbeResult {
    Accepted,
    Failed {
        tried: Vec<SocketAddr>,
        last_error: String,
    },
}

/// Sends queries to candidate extension windows and awaits replies.
#[derive(Clone)]
pub struct Dispatcher {
    table: CorrelationTable,
    directory: CandidateDirectory,
    client: reqwest::Client,
    callback_address: String,
    shutdown: CancellationToken,
    busy_retry_delay: Duration,
    recovery_delay: Duration,
}

impl Dispatcher {
    pub fn new(
        table: CorrelationTable,
        directory: CandidateDirectory,
        callback_address: String,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            table,
            directory,
            client: reqwest::Client::new(),
            callback_address,
            shutdown,
            busy_retry_delay: BUSY_RETRY_DELAY,
            recovery_delay: RECOVERY_DELAY,
        }
    }

    /// Override the all-busy backoff interval. Tests use this to avoid
    /// multi-second sleeps.
    pub fn with_busy_retry_delay(mut self, delay: Duration) -> Self {
        self.busy_retry_delay = delay;
        self
    }

    /// Override the pause before the one-shot recovery retry.
    pub fn with_recovery_delay(mut self, delay: Duration) -> Self {
        self.recovery_delay = delay;
        self
    }

    /// Ask the user whether and how to continue.
    ///
    /// Suspends until a reply or cancellation arrives through the callback
    /// listener; there is deliberately no timeout on that wait. The only
    /// other way out is the shutdown token.
    pub async fn ask(&self, reason: &str) -> Result<String, AskError> {
        let mut recovery_attempted = false;

        loop {
            let (request_id, reply_rx) = self.table.register();
            debug!("registered pending request {request_id}");

            match self.probe_until_accepted(&request_id, reason).await {
                ProbeResult::Accepted => {
                    return self.await_reply(&request_id, reply_rx).await;
                }
                ProbeResult::Failed { tried, last_error } => {
                    self.table.remove(&request_id);

                    // Narrow recovery trigger: only when nothing was
                    // registered and the well-known fallback port did not
                    // answer on the very first attempt. A stale record may be
                    // shadowing a window that has not re-registered yet.
                    let only_fallback =
                        tried.len() == 1 && tried[0].port() == DEFAULT_EXTENSION_PORT;
                    if !recovery_attempted && only_fallback {
                        info!("default port did not answer; clearing registrations and retrying once");
                        self.directory.clear_registrations();
                        tokio::time::sleep(self.recovery_delay).await;
                        recovery_attempted = true;
                        continue;
                    }

                    let addresses = tried
                        .iter()
                        .map(|a| a.to_string())
                        .collect::<Vec<_>>()
                        .join(", ");
                    warn!("no extension window reachable (tried {addresses}): {last_error}");
                    return Err(AskError::Connectivity {
                        addresses,
                        last_error,
                    });
                }
            }
        }
    }

    /// Probe ranked candidates until one accepts, retrying indefinitely while
    /// every window reports busy. The pending request id survives the busy
    /// rounds untouched.
    async fn probe_until_accepted(&self, request_id: &str, reason: &str) -> ProbeResult {
        loop {
            let candidates = self.directory.discover();
            let tried: Vec<SocketAddr> = candidates.iter().map(|c| c.address).collect();
            debug!("probing {} candidate(s): {tried:?}", candidates.len());

            let mut all_busy = true;
            let mut last_error = String::from("no candidate responded");

            for candidate in &candidates {
                let outcome = self.probe(candidate, request_id, reason).await;
                match &outcome {
                    DispatchOutcome::Accepted => {
                        info!("window {} accepted request {request_id}", candidate.address);
                        return ProbeResult::Accepted;
                    }
                    DispatchOutcome::Busy(msg) => {
                        debug!("window busy: {msg}");
                        last_error = msg.clone();
                    }
                    DispatchOutcome::Rejected(msg) => {
                        warn!("window rejected the query: {msg}");
                        last_error = msg.clone();
                    }
                    DispatchOutcome::Unreachable(msg) => {
                        debug!("window unreachable: {msg}");
                        last_error = msg.clone();
                    }
                }
                all_busy &= outcome.is_busy();
            }

            if all_busy && !candidates.is_empty() {
                // Every window is present but none has focus right now. Keep
                // waiting; this loop is unbounded by contract.
                info!(
                    "all {} window(s) busy; retrying in {:?}",
                    candidates.len(),
                    self.busy_retry_delay
                );
                tokio::time::sleep(self.busy_retry_delay).await;
                continue;
            }

            return ProbeResult::Failed { tried, last_error };
        }
    }

    /// Send one `/ask` query and classify the outcome.
    async fn probe(
        &self,
        candidate: &CandidateEndpoint,
        request_id: &str,
        reason: &str,
    ) -> DispatchOutcome {
        let url = format!("http://{}/ask", candidate.address);
        let body = AskRequest {
            message_type: "ask_continue".to_string(),
            request_id: request_id.to_string(),
            reason: reason.to_string(),
            callback_address: self.callback_address.clone(),
        };

        let response = match self
            .client
            .post(&url)
            .timeout(PROBE_TIMEOUT)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return DispatchOutcome::Unreachable(format!(
                    "{}: request timed out",
                    candidate.address
                ));
            }
            Err(e) => {
                return DispatchOutcome::Unreachable(format!("{}: {e}", candidate.address));
            }
        };

        match response.status() {
            StatusCode::OK => match response.json::<AskAccepted>().await {
                Ok(ack) if ack.success => DispatchOutcome::Accepted,
                Ok(_) => DispatchOutcome::Rejected(format!(
                    "{}: window did not acknowledge the query",
                    candidate.address
                )),
                Err(e) => DispatchOutcome::Unreachable(format!(
                    "{}: malformed acknowledgement: {e}",
                    candidate.address
                )),
            },
            StatusCode::CONFLICT => DispatchOutcome::Busy(
                read_candidate_error(candidate, response, "window not focused").await,
            ),
            StatusCode::INTERNAL_SERVER_ERROR => DispatchOutcome::Rejected(
                read_candidate_error(candidate, response, "extension reported an error").await,
            ),
            status => DispatchOutcome::Unreachable(format!(
                "{}: unexpected status {status}",
                candidate.address
            )),
        }
    }

    /// Suspend on the result slot. Resolution arrives from the callback
    /// listener's task, or the shutdown token breaks the wait.
    async fn await_reply(
        &self,
        request_id: &str,
        reply_rx: oneshot::Receiver<ReplyOutcome>,
    ) -> Result<String, AskError> {
        info!("request {request_id} accepted; waiting for the user's reply");

        tokio::select! {
            outcome = reply_rx => match outcome {
                Ok(ReplyOutcome::Input(input)) => Ok(input),
                Ok(ReplyOutcome::Cancelled) => Err(AskError::Cancelled),
                Err(_) => Err(AskError::ChannelClosed),
            },
            _ = self.shutdown.cancelled() => {
                self.table.remove(request_id);
                Err(AskError::Shutdown)
            }
        }
    }
}

/// Lenient error-body read: a missing or malformed JSON body degrades to a
/// generic message instead of failing classification.
async fn read_candidate_error(
    candidate: &CandidateEndpoint,
    response: reqwest::Response,
    fallback: &str,
) -> String {
    match response.json::<CandidateError>().await {
        Ok(body) if !body.error.is_empty() => match body.details {
            Some(details) => format!("{}: {} - {details}", candidate.address, body.error),
            None => format!("{}: {}", candidate.address, body.error),
        },
        _ => format!("{}: {fallback}", candidate.address),
    }
}
