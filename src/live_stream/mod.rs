//! Live-Stream Client (spec.md §4.7): a long-lived, authenticated WebSocket connection to the
//! source provider, delivering event envelopes to the Webhook Router's dispatch logic.
//!
//! Structurally grounded on `leader_election.rs`'s background-task shape (an infinite loop built
//! around `tokio::select!`/`interval.tick()`, `tracing` at each state transition) — tokio-tungstenite
//! usage itself has no precedent elsewhere in this codebase's ancestry, so the socket-handling
//! code below is original.

use crate::errors::Result;
use crate::source_api::SourceApi;
use crate::webhooks::Router;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const PING_PERIOD: Duration = Duration::from_secs(9);
const PONG_WAIT: Duration = Duration::from_secs(10);
const CONNECT_ATTEMPT_WAIT: Duration = Duration::from_secs(10);
const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundMessage {
    Webhook {
        webhook_id: String,
        webhook_conversation_id: String,
        event_payload: String,
        #[serde(default)]
        http_headers: serde_json::Value,
        #[serde(default)]
        endpoint: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutboundMessage<'a> {
    EventAck { webhook_conversation_id: &'a str, event_id: &'a str },
    WebhookResponse { webhook_conversation_id: &'a str, status: u16, body: String },
}

pub struct LiveStreamClient {
    source_api: Arc<dyn SourceApi>,
    router: Arc<Router>,
    endpoint_uuid: Uuid,
    account_id: String,
}

impl LiveStreamClient {
    pub fn new(source_api: Arc<dyn SourceApi>, router: Arc<Router>, endpoint_uuid: Uuid, account_id: String) -> Self {
        Self { source_api, router, endpoint_uuid, account_id }
    }

    /// Runs until `shutdown` resolves. Reconnects on unexpected close, staleness, or connect
    /// failure, per the reconnection policy in spec.md §4.7; returns once the caller requests
    /// shutdown (the spec's "after the caller's close(), do not reconnect").
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.connect_and_serve(&mut shutdown).await {
                Ok(RunOutcome::ShutdownRequested) => return Ok(()),
                Ok(RunOutcome::Reconnect) => continue,
                Err(e) => {
                    warn!(error = %e, "live-stream connection failed, waiting before retry");
                    tokio::select! {
                        _ = tokio::time::sleep(CONNECT_ATTEMPT_WAIT) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }

    async fn connect_and_serve(&self, shutdown: &mut tokio::sync::watch::Receiver<bool>) -> Result<RunOutcome> {
        let session = self.source_api.create_live_stream_session().await?;
        info!(websocket_id = %session.websocket_id, "live-stream session established");

        // The session secret supersedes whatever secret the endpoint was registered with; install
        // it before reading a single message so every delivery verifies against the right value.
        self.router.set_endpoint_secret(self.endpoint_uuid, &session.secret).await?;

        let reconnect_interval = session
            .reconnect_delay_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_RECONNECT_INTERVAL);

        let connect_result = tokio::time::timeout(CONNECT_ATTEMPT_WAIT, tokio_tungstenite::connect_async(&session.websocket_url)).await;
        let (ws_stream, _) = match connect_result {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => return Err(crate::errors::Error::SourceApiError { message: e.to_string() }),
            Err(_) => return Err(crate::errors::Error::SourceApiError { message: "timed out connecting to websocket".to_string() }),
        };

        let (mut write, mut read) = ws_stream.split();
        let deadline = Instant::now() + reconnect_interval;
        let mut ping_interval = tokio::time::interval(PING_PERIOD);
        let mut last_pong = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(RunOutcome::ShutdownRequested);
                    }
                }

                _ = ping_interval.tick() => {
                    if last_pong.elapsed() > PONG_WAIT {
                        warn!("live-stream connection stale (no pong within {PONG_WAIT:?}), reconnecting");
                        return Ok(RunOutcome::Reconnect);
                    }
                    if write.send(Message::Ping(Vec::new().into())).await.is_err() {
                        return Ok(RunOutcome::Reconnect);
                    }
                }

                _ = tokio::time::sleep_until(deadline) => {
                    debug!("proactive reconnect after {reconnect_interval:?} of continuous operation");
                    return Ok(RunOutcome::Reconnect);
                }

                message = read.next() => {
                    match message {
                        Some(Ok(Message::Pong(_))) => {
                            last_pong = Instant::now();
                        }
                        Some(Ok(Message::Text(text))) => {
                            self.handle_inbound(&text, &mut write).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.as_ref().map(|f| u16::from(f.code)).unwrap_or(1000);
                            if code != 1000 {
                                warn!(code, "unexpected websocket close, reconnecting");
                            }
                            return Ok(RunOutcome::Reconnect);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!(error = %e, "websocket read error, reconnecting");
                            return Ok(RunOutcome::Reconnect);
                        }
                        None => {
                            return Ok(RunOutcome::Reconnect);
                        }
                    }
                }
            }
        }
    }

    /// Acknowledges immediately, then processes the event through the router (spec.md §4.7,
    /// "Delivery contract"). A processing failure still yields a `webhook_response` with status
    /// 500 rather than dropping the message.
    async fn handle_inbound(&self, text: &str, write: &mut (impl SinkExt<Message> + Unpin)) {
        let Ok(InboundMessage::Webhook { webhook_id, webhook_conversation_id, event_payload, http_headers, .. }) = serde_json::from_str(text)
        else {
            return;
        };

        let ack = OutboundMessage::EventAck { webhook_conversation_id: &webhook_conversation_id, event_id: &webhook_id };
        if let Ok(ack_text) = serde_json::to_string(&ack) {
            let _ = write.send(Message::Text(ack_text.into())).await;
        }

        let signature = signature_header(&http_headers);
        let (status, body) = match self.router.process(event_payload.as_bytes(), signature, self.endpoint_uuid).await {
            Ok(()) => (200u16, serde_json::json!({ "received": true })),
            Err(e) => (500u16, serde_json::json!({ "received": false, "error": e.to_string() })),
        };

        let response = OutboundMessage::WebhookResponse {
            webhook_conversation_id: &webhook_conversation_id,
            status,
            body: body.to_string(),
        };
        if let Ok(response_text) = serde_json::to_string(&response) {
            let _ = write.send(Message::Text(response_text.into())).await;
        }

        let _ = &self.account_id;
    }
}

enum RunOutcome {
    ShutdownRequested,
    Reconnect,
}

/// Pulls the `Stripe-Signature` value out of a WebSocket message's `http_headers` object,
/// case-insensitively (the source provider's own casing isn't contractually fixed).
fn signature_header(http_headers: &serde_json::Value) -> &str {
    http_headers
        .as_object()
        .and_then(|headers| headers.iter().find(|(k, _)| k.eq_ignore_ascii_case("stripe-signature")))
        .and_then(|(_, v)| v.as_str())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_signature_header_case_insensitively() {
        let headers = serde_json::json!({"Stripe-Signature": "t=1,v1=abc"});
        assert_eq!(signature_header(&headers), "t=1,v1=abc");
    }

    #[test]
    fn missing_signature_header_yields_empty_string() {
        let headers = serde_json::json!({"content-type": "application/json"});
        assert_eq!(signature_header(&headers), "");
    }
}
