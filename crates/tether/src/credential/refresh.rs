// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Single-flight credential refresh.
//!
//! Any number of callers may ask for a fresh access token at once; only one
//! remote exchange runs; everyone else waits on its outcome.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};

use crate::credential::{Credential, CredentialStore};
use crate::error::ErrorCode;
use crate::events::AuthEvent;
use crate::transport::envelope;

/// Why a refresh did not produce a new access token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    /// Nothing to refresh with.
    #[error("no refresh token available")]
    NoRefreshToken,

    /// The server says the refresh token is invalid or expired.
    #[error("refresh token rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("network error during refresh: {0}")]
    Network(String),

    #[error("refresh timed out")]
    Timeout,

    /// Too many callers already waiting on the in-flight refresh.
    #[error("refresh queue full ({0} waiters)")]
    Overloaded(usize),

    /// The refreshing task was cancelled before it settled.
    #[error("refresh abandoned before completion")]
    Abandoned,
}

impl RefreshError {
    /// Terminal failures clear the credential and force re-authentication.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::NoRefreshToken | Self::Rejected { .. })
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NoRefreshToken | Self::Rejected { .. } => ErrorCode::RefreshFailed,
            Self::Timeout => ErrorCode::Timeout,
            Self::Network(_) | Self::Overloaded(_) | Self::Abandoned => ErrorCode::NetworkError,
        }
    }
}

/// Remote half of a refresh: trade a refresh token for a new pair.
///
/// Object-safe for use as `Arc<dyn TokenExchange>`.
pub trait TokenExchange: Send + Sync + 'static {
    fn exchange<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Credential, RefreshError>> + Send + 'a>>;
}

/// [`TokenExchange`] against the service's refresh endpoint.
pub struct HttpTokenExchange {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpTokenExchange {
    pub fn new(http: reqwest::Client, url: String, timeout: Duration) -> Self {
        Self { http, url, timeout }
    }
}

impl TokenExchange for HttpTokenExchange {
    fn exchange<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Credential, RefreshError>> + Send + 'a>> {
        Box::pin(async move {
            match tokio::time::timeout(self.timeout, do_refresh(&self.http, &self.url, refresh_token))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(RefreshError::Timeout),
            }
        })
    }
}

/// Perform a single refresh request.
///
/// Refresh tokens rotate: the response must carry both halves of the new pair.
pub async fn do_refresh(
    client: &reqwest::Client,
    url: &str,
    refresh_token: &str,
) -> Result<Credential, RefreshError> {
    let resp = client
        .post(url)
        .json(&serde_json::json!({ "refresh_token": refresh_token }))
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                RefreshError::Timeout
            } else {
                RefreshError::Network(e.to_string())
            }
        })?;

    let status = resp.status();
    if matches!(status.as_u16(), 400 | 401 | 403) {
        let text = resp.text().await.unwrap_or_default();
        return Err(RefreshError::Rejected {
            status: status.as_u16(),
            message: envelope::error_message(&text).unwrap_or(text),
        });
    }
    if !status.is_success() {
        return Err(RefreshError::Network(format!("refresh endpoint returned {status}")));
    }

    let body: serde_json::Value =
        resp.json().await.map_err(|e| RefreshError::Network(e.to_string()))?;
    let payload = envelope::unwrap(body).map_err(|message| RefreshError::Rejected {
        status: status.as_u16(),
        message,
    })?;
    envelope::token_pair(&payload).ok_or_else(|| RefreshError::Rejected {
        status: status.as_u16(),
        message: "refresh response missing token pair".to_owned(),
    })
}

type Waiter = oneshot::Sender<Result<String, RefreshError>>;

/// Refresh state machine. Waiters only exist while a refresh is in flight.
enum Flight {
    Idle,
    Refreshing { waiters: Vec<Waiter> },
}

/// How a caller participates in a refresh.
enum Entry {
    /// The stored token is usable as is.
    Current(String),
    /// Another caller is refreshing; wait for its outcome.
    Join(oneshot::Receiver<Result<String, RefreshError>>),
    /// This caller performs the exchange.
    Lead,
}

/// Serializes refresh attempts so N concurrent callers cause one exchange.
pub struct RefreshCoordinator {
    store: Arc<CredentialStore>,
    exchange: Arc<dyn TokenExchange>,
    events: broadcast::Sender<AuthEvent>,
    threshold: Duration,
    max_waiters: usize,
    flight: Mutex<Flight>,
    exchanges: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<CredentialStore>,
        exchange: Arc<dyn TokenExchange>,
        events: broadcast::Sender<AuthEvent>,
        threshold: Duration,
        max_waiters: usize,
    ) -> Self {
        Self {
            store,
            exchange,
            events,
            threshold,
            max_waiters,
            flight: Mutex::new(Flight::Idle),
            exchanges: AtomicU64::new(0),
        }
    }

    /// Return a usable access token, refreshing first when the stored one
    /// expires within the proactive threshold. Joins an in-flight refresh.
    pub async fn ensure_fresh(&self) -> Result<String, RefreshError> {
        let threshold = self.threshold;
        self.run(move |store| {
            if store.is_expiring_soon(threshold) {
                None
            } else {
                store.access_token()
            }
        })
        .await
    }

    /// Recover from the server rejecting `rejected`.
    ///
    /// If the store already holds a different token, someone refreshed in the
    /// meantime and that token is returned without another exchange.
    pub async fn refresh_rejected(&self, rejected: Option<&str>) -> Result<String, RefreshError> {
        let rejected = rejected.map(str::to_owned);
        self.run(move |store| match store.access_token() {
            Some(current) if Some(&current) != rejected.as_ref() => Some(current),
            _ => None,
        })
        .await
    }

    /// Whether a refresh is currently in flight.
    pub fn is_refreshing(&self) -> bool {
        matches!(*self.flight.lock(), Flight::Refreshing { .. })
    }

    /// Number of remote exchanges performed so far.
    pub fn exchange_count(&self) -> u64 {
        self.exchanges.load(Ordering::Relaxed)
    }

    async fn run(
        &self,
        usable: impl FnOnce(&CredentialStore) -> Option<String>,
    ) -> Result<String, RefreshError> {
        // Check-and-set in one critical section; never held across an await.
        let entry = {
            let mut flight = self.flight.lock();
            match &mut *flight {
                Flight::Refreshing { waiters } => {
                    if waiters.len() >= self.max_waiters {
                        return Err(RefreshError::Overloaded(waiters.len()));
                    }
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Entry::Join(rx)
                }
                Flight::Idle => match usable(&self.store) {
                    Some(token) => Entry::Current(token),
                    None => {
                        *flight = Flight::Refreshing { waiters: Vec::new() };
                        Entry::Lead
                    }
                },
            }
        };

        match entry {
            Entry::Current(token) => Ok(token),
            Entry::Join(rx) => {
                tracing::debug!("joining in-flight refresh");
                rx.await.unwrap_or(Err(RefreshError::Abandoned))
            }
            Entry::Lead => {
                let guard = FlightGuard { coordinator: self, settled: false };
                let result = self.perform().await;
                guard.settle(&result);
                result
            }
        }
    }

    async fn perform(&self) -> Result<String, RefreshError> {
        let Some(refresh_token) = self.store.refresh_token() else {
            return Err(self.fail(RefreshError::NoRefreshToken));
        };

        let n = self.exchanges.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(exchange = n, "refreshing access token");

        match self.exchange.exchange(&refresh_token).await {
            Ok(credential) => {
                let access = credential.access_token.clone();
                self.store.set_credential(credential.access_token, credential.refresh_token);
                let _ = self.events.send(AuthEvent::Refreshed);
                tracing::debug!(exchange = n, "access token refreshed");
                Ok(access)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn fail(&self, err: RefreshError) -> RefreshError {
        if err.is_terminal() {
            tracing::warn!(err = %err, "refresh failed, clearing credential");
            self.store.clear();
            let _ = self.events.send(AuthEvent::ForcedLogout { reason: err.to_string() });
        } else {
            tracing::warn!(err = %err, "refresh failed transiently, keeping credential");
        }
        err
    }

    /// Return to `Idle` and hand `result` to every waiter in enqueue order.
    fn finish(&self, result: &Result<String, RefreshError>) {
        let waiters = match std::mem::replace(&mut *self.flight.lock(), Flight::Idle) {
            Flight::Refreshing { waiters } => waiters,
            Flight::Idle => Vec::new(),
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

/// Resets the flight to `Idle` exactly once, even if the leading future is
/// dropped mid-exchange.
struct FlightGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    settled: bool,
}

impl FlightGuard<'_> {
    fn settle(mut self, result: &Result<String, RefreshError>) {
        self.settled = true;
        self.coordinator.finish(result);
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!("refresh cancelled in flight, releasing waiters");
            self.coordinator.finish(&Err(RefreshError::Abandoned));
        }
    }
}

#[cfg(test)]
#[path = "refresh_tests.rs"]
mod tests;
