// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session: owns the credential store, refresh coordinator and request
//! pipeline for one signed-in user, and hands out realtime sessions that share
//! the same store.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::config::ClientConfig;
use crate::credential::persist::{FileStore, KeyValueStore, MemoryStore};
use crate::credential::refresh::{HttpTokenExchange, RefreshCoordinator, TokenExchange};
use crate::credential::CredentialStore;
use crate::error::ClientError;
use crate::events::AuthEvent;
use crate::tls;
use crate::transport::envelope;
use crate::transport::http::{ApiRequest, RequestPipeline};
use crate::transport::ws::{WsSession, WsSettings};

pub struct Session {
    config: Arc<ClientConfig>,
    store: Arc<CredentialStore>,
    coordinator: Arc<RefreshCoordinator>,
    pipeline: RequestPipeline,
    auth_tx: broadcast::Sender<AuthEvent>,
}

impl Session {
    /// Build a session whose credential is restored from `backend`.
    pub fn new(config: ClientConfig, backend: Arc<dyn KeyValueStore>) -> Result<Self, ClientError> {
        config.validate()?;
        let http = build_http(&config)?;
        let exchange = Arc::new(HttpTokenExchange::new(
            http.clone(),
            config.url(&config.refresh_path),
            config.refresh_timeout(),
        ));
        Ok(Self::assemble(config, backend, http, exchange))
    }

    /// Like [`Session::new`] with a custom refresh exchange.
    pub fn with_exchange(
        config: ClientConfig,
        backend: Arc<dyn KeyValueStore>,
        exchange: Arc<dyn TokenExchange>,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let http = build_http(&config)?;
        Ok(Self::assemble(config, backend, http, exchange))
    }

    /// Persist to `state_file` when configured, otherwise keep the credential
    /// in memory only.
    pub fn from_config(config: ClientConfig) -> Result<Self, ClientError> {
        let backend: Arc<dyn KeyValueStore> = match config.state_file {
            Some(ref path) => Arc::new(FileStore::new(path)),
            None => Arc::new(MemoryStore::new()),
        };
        Self::new(config, backend)
    }

    fn assemble(
        config: ClientConfig,
        backend: Arc<dyn KeyValueStore>,
        http: reqwest::Client,
        exchange: Arc<dyn TokenExchange>,
    ) -> Self {
        let config = Arc::new(config);
        let (auth_tx, _) = broadcast::channel(64);
        let store = Arc::new(CredentialStore::load(backend));
        let coordinator = Arc::new(RefreshCoordinator::new(
            Arc::clone(&store),
            exchange,
            auth_tx.clone(),
            config.refresh_threshold(),
            config.max_refresh_waiters,
        ));
        let pipeline = RequestPipeline::new(
            http,
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::clone(&coordinator),
            auth_tx.clone(),
        );
        Self { config, store, coordinator, pipeline, auth_tx }
    }

    /// Sign in and store the returned credential. Returns the full payload.
    pub async fn login(&self, body: &impl Serialize) -> Result<Value, ClientError> {
        self.authenticate(&self.config.login_path, body).await
    }

    /// Create an account and store the returned credential.
    pub async fn register(&self, body: &impl Serialize) -> Result<Value, ClientError> {
        self.authenticate(&self.config.register_path, body).await
    }

    async fn authenticate(&self, path: &str, body: &impl Serialize) -> Result<Value, ClientError> {
        let req = ApiRequest::post(path).json(body)?.unauthenticated();
        let payload = self.pipeline.send(&req).await?;
        let credential = envelope::token_pair(&payload)
            .ok_or_else(|| ClientError::Decode("auth response missing token pair".to_owned()))?;
        self.store.set_credential(credential.access_token, credential.refresh_token);
        tracing::info!(path, "signed in");
        let _ = self.auth_tx.send(AuthEvent::LoggedIn);
        Ok(payload)
    }

    /// Tell the server (best effort), then forget the credential.
    pub async fn logout(&self) {
        if let Some(refresh_token) = self.store.refresh_token() {
            let req = ApiRequest::post(self.config.logout_path.as_str())
                .body(serde_json::json!({ "refresh_token": refresh_token }));
            if let Err(e) = self.pipeline.send(&req).await {
                tracing::warn!(err = %e, "remote logout failed, clearing locally");
            }
        }
        self.store.clear();
        let _ = self.auth_tx.send(AuthEvent::LoggedOut);
    }

    /// A new realtime session sharing this session's credential store.
    pub fn websocket(&self) -> WsSession {
        WsSession::new(WsSettings::from_config(&self.config), Arc::clone(&self.store))
    }

    pub fn auth_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.auth_tx.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.store.has_refresh_token()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    pub fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }
}

fn build_http(config: &ClientConfig) -> Result<reqwest::Client, ClientError> {
    tls::ensure_crypto();
    Ok(reqwest::Client::builder().timeout(config.request_timeout()).build()?)
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
