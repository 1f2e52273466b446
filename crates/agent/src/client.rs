// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP client for one agent server.
//!
//! The server contract is small: `GET /health` returns
//! `{"version": …}`, `GET /doc` serves an API description, and
//! `POST /turn` streams newline-delimited JSON part events until a
//! final `turn_completed` event.

use crate::error::AgentError;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

/// Parameters for one agent turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnRequest {
    pub workspace_root: PathBuf,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort: Option<String>,
}

/// Receives streamed part events during a turn.
pub trait TurnEventSink: Send + Sync {
    fn on_part(&self, part: &Value);
}

/// A sink that drops every part. Useful for fire-and-forget turns.
pub struct NullSink;

impl TurnEventSink for NullSink {
    fn on_part(&self, _part: &Value) {}
}

/// Result of a completed turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnOutcome {
    pub turn_id: Option<String>,
    pub output: Option<String>,
    pub parts: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthInfo {
    pub version: String,
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug)]
pub struct AgentClient {
    http: reqwest::Client,
    base_url: String,
    auth: Option<(String, String)>,
    password_env: String,
    turn_timeout: Duration,
}

impl AgentClient {
    pub fn new(
        base_url: &str,
        auth: Option<(String, String)>,
        password_env: String,
        turn_timeout: Duration,
    ) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| AgentError::Supervisor(format!("http client build failed: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            password_env,
            turn_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.with_auth(self.http.get(format!("{}{path}", self.base_url)))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.with_auth(self.http.post(format!("{}{path}", self.base_url)))
    }

    fn with_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            Some((user, password)) => builder.basic_auth(user, Some(password)),
            None => builder,
        }
    }

    /// Health probe, classifying failures for the attach path.
    pub async fn health(&self) -> Result<HealthInfo, AgentError> {
        let resp = self
            .get("/health")
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| AgentError::AttachConnect(e.to_string()))?;
        let status = resp.status().as_u16();
        match status {
            200..=299 => {}
            401 | 403 => {
                return Err(AgentError::AttachAuth {
                    status,
                    password_env: self.password_env.clone(),
                })
            }
            404 | 405 => return Err(AgentError::AttachEndpointMismatch { status }),
            _ => return Err(AgentError::Protocol(format!("health returned HTTP {status}"))),
        }
        let mut body: serde_json::Map<String, Value> = resp
            .json()
            .await
            .map_err(|e| AgentError::Protocol(format!("health body unparseable: {e}")))?;
        let version = match body.remove("version") {
            Some(Value::String(v)) => v,
            _ => "unknown".to_string(),
        };
        Ok(HealthInfo { version, extra: body })
    }

    /// Best-effort API doc fetch used only for schema discovery.
    pub async fn fetch_api_doc(&self) -> Result<Value, AgentError> {
        let resp = self
            .get("/doc")
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| AgentError::AttachConnect(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(AgentError::Protocol(format!("doc returned HTTP {}", resp.status())));
        }
        resp.json().await.map_err(|e| AgentError::Protocol(format!("doc unparseable: {e}")))
    }

    /// Best-effort cleanup hook for global-scope servers.
    pub async fn dispose_instances(&self) -> Result<(), AgentError> {
        let resp = self
            .post("/instances/dispose")
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| AgentError::AttachConnect(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(AgentError::Protocol(format!("dispose returned HTTP {}", resp.status())));
        }
        Ok(())
    }

    /// Run one turn, forwarding streamed part events to `sink`.
    ///
    /// `should_stop` is polled between stream chunks; a true result
    /// aborts the HTTP call with `TurnAborted`. The whole call is
    /// bounded by the per-turn timeout.
    pub async fn run_turn(
        &self,
        request: &TurnRequest,
        sink: &dyn TurnEventSink,
        should_stop: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<TurnOutcome, AgentError> {
        let seconds = self.turn_timeout.as_secs();
        tokio::time::timeout(self.turn_timeout, self.run_turn_inner(request, sink, should_stop))
            .await
            .map_err(|_| AgentError::TurnTimeout { seconds })?
    }

    async fn run_turn_inner(
        &self,
        request: &TurnRequest,
        sink: &dyn TurnEventSink,
        should_stop: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<TurnOutcome, AgentError> {
        let resp = self
            .post("/turn")
            .json(request)
            .send()
            .await
            .map_err(|e| AgentError::Disconnected(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AgentError::Protocol(format!(
                "turn returned HTTP {status}: {}",
                body.trim()
            )));
        }

        let mut stream = resp.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut outcome = TurnOutcome::default();
        while let Some(chunk) = stream.next().await {
            if should_stop() {
                return Err(AgentError::TurnAborted);
            }
            let chunk = chunk.map_err(|e| AgentError::Disconnected(e.to_string()))?;
            buffer.extend_from_slice(&chunk);
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                self.handle_line(&line, sink, &mut outcome)?;
            }
        }
        if !buffer.is_empty() {
            let line = std::mem::take(&mut buffer);
            self.handle_line(&line, sink, &mut outcome)?;
        }
        Ok(outcome)
    }

    fn handle_line(
        &self,
        line: &[u8],
        sink: &dyn TurnEventSink,
        outcome: &mut TurnOutcome,
    ) -> Result<(), AgentError> {
        let text = std::str::from_utf8(line).unwrap_or("").trim();
        if text.is_empty() {
            return Ok(());
        }
        let part: Value = serde_json::from_str(text)
            .map_err(|e| AgentError::Protocol(format!("unparseable part event: {e}")))?;
        if let Some(turn_id) = part.get("turn_id").and_then(Value::as_str) {
            outcome.turn_id = Some(turn_id.to_string());
        }
        if part.get("type").and_then(Value::as_str) == Some("turn_completed") {
            if let Some(output) = part.get("output").and_then(Value::as_str) {
                outcome.output = Some(output.to_string());
            }
            return Ok(());
        }
        outcome.parts += 1;
        sink.on_part(&part);
        Ok(())
    }
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
