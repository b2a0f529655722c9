// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Authenticated HTTP request pipeline.
//!
//! Every call goes through [`RequestPipeline::send`]: refresh ahead of expiry,
//! attach the bearer token, recover from one 401 by refreshing and re-issuing
//! the same request, then strip the response envelope.

use std::sync::Arc;

use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::config::ClientConfig;
use crate::credential::refresh::RefreshCoordinator;
use crate::credential::CredentialStore;
use crate::error::ClientError;
use crate::events::AuthEvent;
use crate::transport::envelope;

/// A request description. Kept around so a retry re-issues it verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Attach the bearer token and take part in 401 recovery.
    pub authenticated: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self { method, path: path.into(), query: Vec::new(), body: None, authenticated: true }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Serialize `body` as the JSON request body.
    pub fn json(self, body: &impl Serialize) -> Result<Self, ClientError> {
        Ok(self.body(serde_json::to_value(body)?))
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Send without credentials (login, registration).
    pub fn unauthenticated(mut self) -> Self {
        self.authenticated = false;
        self
    }
}

pub struct RequestPipeline {
    client: Client,
    config: Arc<ClientConfig>,
    store: Arc<CredentialStore>,
    coordinator: Arc<RefreshCoordinator>,
    auth_events: broadcast::Sender<AuthEvent>,
}

impl RequestPipeline {
    pub fn new(
        client: Client,
        config: Arc<ClientConfig>,
        store: Arc<CredentialStore>,
        coordinator: Arc<RefreshCoordinator>,
        auth_events: broadcast::Sender<AuthEvent>,
    ) -> Self {
        Self { client, config, store, coordinator, auth_events }
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_owned()
        } else {
            self.config.url(path)
        }
    }

    /// Send a request and return the unwrapped JSON payload.
    ///
    /// At most one retry: a 401 triggers a refresh (or joins the one in
    /// flight) and the request is re-issued once. A second 401 clears the
    /// credential and returns [`ClientError::AuthExpired`].
    pub async fn send(&self, req: &ApiRequest) -> Result<Value, ClientError> {
        let token = if req.authenticated { self.prepare().await? } else { None };

        let resp = self.dispatch(req, token.as_deref()).await?;
        if !req.authenticated || resp.status() != StatusCode::UNAUTHORIZED {
            return finish(resp).await;
        }

        tracing::debug!(path = %req.path, "access token rejected, refreshing");
        let fresh = self.coordinator.refresh_rejected(token.as_deref()).await?;

        let retry = self.dispatch(req, Some(&fresh)).await?;
        if retry.status() == StatusCode::UNAUTHORIZED {
            tracing::warn!(path = %req.path, "access token rejected after refresh, forcing logout");
            self.store.clear();
            let _ = self.auth_events.send(AuthEvent::ForcedLogout {
                reason: "access token rejected after refresh".to_owned(),
            });
            return Err(ClientError::AuthExpired);
        }
        finish(retry).await
    }

    /// Token to attach, refreshing first when it is about to expire.
    async fn prepare(&self) -> Result<Option<String>, ClientError> {
        if self.store.has_refresh_token()
            && self.store.is_expiring_soon(self.config.refresh_threshold())
        {
            match self.coordinator.ensure_fresh().await {
                Ok(token) => return Ok(Some(token)),
                Err(e) if e.is_terminal() => return Err(e.into()),
                Err(e) => {
                    // The server stays authoritative; a 401 will retry the refresh.
                    tracing::warn!(err = %e, "proactive refresh failed, sending current token");
                }
            }
        }
        Ok(self.store.access_token())
    }

    async fn dispatch(
        &self,
        req: &ApiRequest,
        token: Option<&str>,
    ) -> Result<reqwest::Response, ClientError> {
        let mut builder = self.client.request(req.method.clone(), self.url(&req.path));
        if !req.query.is_empty() {
            builder = builder.query(&req.query);
        }
        if let Some(ref body) = req.body {
            builder = builder.json(body);
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        let resp = builder.send().await?;
        tracing::debug!(method = %req.method, path = %req.path, status = resp.status().as_u16(), "response");
        Ok(resp)
    }

    /// Send and deserialize the unwrapped payload.
    pub async fn send_json<T: DeserializeOwned>(&self, req: &ApiRequest) -> Result<T, ClientError> {
        let value = self.send(req).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        self.send_json(&ApiRequest::get(path)).await
    }

    pub async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, ClientError> {
        self.send_json(&ApiRequest::post(path).json(body)?).await
    }

    pub async fn put_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, ClientError> {
        self.send_json(&ApiRequest::put(path).json(body)?).await
    }

    pub async fn patch_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, ClientError> {
        self.send_json(&ApiRequest::patch(path).json(body)?).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value, ClientError> {
        self.send(&ApiRequest::delete(path)).await
    }
}

/// Map the final response: non-success to [`ClientError::Status`], empty body
/// to `null`, otherwise the envelope-stripped JSON.
async fn finish(resp: reqwest::Response) -> Result<Value, ClientError> {
    let status = resp.status();
    let bytes = resp.bytes().await?;

    if !status.is_success() {
        let text = String::from_utf8_lossy(&bytes);
        let message = envelope::error_message(&text).unwrap_or_else(|| {
            if text.trim().is_empty() {
                status.canonical_reason().unwrap_or("request failed").to_owned()
            } else {
                text.into_owned()
            }
        });
        return Err(ClientError::Status { status: status.as_u16(), message });
    }

    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    let value: Value = serde_json::from_slice(&bytes)?;
    envelope::unwrap(value).map_err(|message| ClientError::Api { message })
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
