//! Call-control facade.
//!
//! Wraps the provider's REST API: answering an incoming call with a media
//! streaming directive, placing outbound calls, and hanging up. Every call
//! runs under a 5 second wall clock with two retries on transient failures;
//! anything else surfaces as an upstream error.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::{BridgeError, BridgeResult};

/// Provider webhook event type announcing an incoming call.
pub const INCOMING_CALL_EVENT: &str = "IncomingCall";

/// Wall clock per provider request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Retries after the first attempt, on transient failures only.
const TRANSIENT_RETRIES: usize = 2;

#[derive(Debug, Clone)]
pub struct CallControlConfig {
    pub base_url: String,
    pub api_key: String,
    /// E.164 caller id used for outbound calls.
    pub source_number: Option<String>,
    /// Where the provider posts call events.
    pub callback_url: String,
    /// Public `wss://…/call/stream` URL handed to the provider.
    pub media_stream_url: String,
}

/// One webhook event from the provider.
#[derive(Debug, Clone, Deserialize)]
pub struct CallEventEnvelope {
    #[serde(rename = "eventType")]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl CallEventEnvelope {
    pub fn call_id(&self) -> Option<&str> {
        self.data
            .get("callConnectionId")
            .or_else(|| self.data.get("incomingCallContext"))
            .and_then(serde_json::Value::as_str)
    }

    pub fn caller(&self) -> Option<&str> {
        self.data
            .pointer("/from/phoneNumber")
            .or_else(|| self.data.get("from"))
            .and_then(serde_json::Value::as_str)
    }
}

/// What we answer an incoming call with: where to stream media and in what
/// format.
#[derive(Debug, Clone, Serialize)]
pub struct AnswerDirective {
    pub session_id: String,
    pub media_streaming_url: String,
    pub audio_format: &'static str,
}

/// Facade over the provider's call-control REST API.
pub struct CallControl {
    http: reqwest::Client,
    config: CallControlConfig,
}

impl CallControl {
    pub fn new(config: CallControlConfig) -> BridgeResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BridgeError::config(format!("call control http client: {e}")))?;
        Ok(Self { http, config })
    }

    /// Answer an incoming call, directing its media to our stream endpoint.
    pub async fn answer(&self, event: &CallEventEnvelope) -> BridgeResult<AnswerDirective> {
        let context = event
            .call_id()
            .ok_or_else(|| BridgeError::protocol("incoming call event without call context"))?;

        let session_id = Uuid::new_v4().to_string();
        let media_url = self.media_url_for(&session_id);

        let body = json!({
            "incomingCallContext": context,
            "callbackUri": self.config.callback_url,
            "mediaStreaming": {
                "transportUrl": media_url,
                "transportType": "websocket",
                "contentType": "audio",
                "audioFormat": "Pcm16KMono",
                "enableBidirectional": true,
            }
        });

        let url = format!("{}/calls:answer", self.config.base_url);
        self.send_with_retry(|| self.http.post(&url).bearer_auth(&self.config.api_key).json(&body))
            .await?;

        info!(session_id = %session_id, "incoming call answered");
        Ok(AnswerDirective {
            session_id,
            media_streaming_url: media_url,
            audio_format: "Pcm16KMono",
        })
    }

    /// Place an outbound call; returns the session id the media stream will
    /// arrive under.
    pub async fn place_outbound_call(
        &self,
        target_e164: &str,
        session_hint: Option<&str>,
    ) -> BridgeResult<String> {
        let source = self.config.source_number.as_deref().ok_or_else(|| {
            BridgeError::config("outbound calling requires a configured source number")
        })?;

        let session_id = session_hint
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let media_url = self.media_url_for(&session_id);

        let body = json!({
            "targets": [{ "phoneNumber": target_e164 }],
            "sourceCallerIdNumber": { "phoneNumber": source },
            "callbackUri": self.config.callback_url,
            "mediaStreaming": {
                "transportUrl": media_url,
                "transportType": "websocket",
                "contentType": "audio",
                "audioFormat": "Pcm16KMono",
                "enableBidirectional": true,
            }
        });

        let url = format!("{}/calls", self.config.base_url);
        self.send_with_retry(|| self.http.post(&url).bearer_auth(&self.config.api_key).json(&body))
            .await?;

        info!(session_id = %session_id, target = target_e164, "outbound call placed");
        Ok(session_id)
    }

    /// Hang up the provider leg of a call.
    pub async fn hangup(&self, call_id: &str) -> BridgeResult<()> {
        let url = format!("{}/calls/{call_id}:hangup", self.config.base_url);
        self.send_with_retry(|| self.http.post(&url).bearer_auth(&self.config.api_key))
            .await?;
        info!(call_id, "provider leg hung up");
        Ok(())
    }

    fn media_url_for(&self, session_id: &str) -> String {
        format!(
            "{}?session_id={}",
            self.config.media_stream_url, session_id
        )
    }

    /// Issue one request with retries on transient failures (connect
    /// errors, timeouts, 5xx). Non-retryable provider errors surface as
    /// upstream immediately.
    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> BridgeResult<reqwest::Response> {
        let mut attempt = 0;
        loop {
            match build().send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) if response.status().is_server_error() => {
                    let status = response.status();
                    if attempt >= TRANSIENT_RETRIES {
                        return Err(BridgeError::upstream(format!(
                            "provider returned {status} after {attempt} retries"
                        )));
                    }
                    warn!(%status, attempt, "transient provider error, retrying");
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    return Err(BridgeError::upstream(format!(
                        "provider returned {status}: {body}"
                    )));
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    if attempt >= TRANSIENT_RETRIES {
                        return Err(BridgeError::upstream(format!(
                            "provider unreachable after {attempt} retries: {e}"
                        )));
                    }
                    warn!(error = %e, attempt, "provider request failed, retrying");
                }
                Err(e) => {
                    return Err(BridgeError::upstream(format!("provider request failed: {e}")));
                }
            }
            attempt += 1;
            tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_extracts_incoming_context() {
        let envelope: CallEventEnvelope = serde_json::from_str(
            r#"{"eventType":"IncomingCall","data":{"incomingCallContext":"ctx-123","from":{"phoneNumber":"+15551234567"}}}"#,
        )
        .unwrap();

        assert_eq!(envelope.event_type, INCOMING_CALL_EVENT);
        assert_eq!(envelope.call_id(), Some("ctx-123"));
        assert_eq!(envelope.caller(), Some("+15551234567"));
    }

    #[test]
    fn test_envelope_prefers_call_connection_id() {
        let envelope: CallEventEnvelope = serde_json::from_str(
            r#"{"eventType":"CallConnected","data":{"callConnectionId":"conn-9"}}"#,
        )
        .unwrap();
        assert_eq!(envelope.call_id(), Some("conn-9"));
    }

    #[test]
    fn test_media_url_carries_session_id() {
        let control = CallControl::new(CallControlConfig {
            base_url: "https://provider.example.com/v1".into(),
            api_key: "key".into(),
            source_number: Some("+15550000000".into()),
            callback_url: "https://gw.example.com/call/incoming".into(),
            media_stream_url: "wss://gw.example.com/call/stream".into(),
        })
        .unwrap();

        let url = control.media_url_for("abc");
        assert_eq!(url, "wss://gw.example.com/call/stream?session_id=abc");
    }

    #[tokio::test]
    async fn test_outbound_requires_source_number() {
        let control = CallControl::new(CallControlConfig {
            base_url: "https://provider.example.com/v1".into(),
            api_key: "key".into(),
            source_number: None,
            callback_url: "https://gw.example.com/call/incoming".into(),
            media_stream_url: "wss://gw.example.com/call/stream".into(),
        })
        .unwrap();

        let err = control
            .place_outbound_call("+15551234567", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::Config);
    }
}
