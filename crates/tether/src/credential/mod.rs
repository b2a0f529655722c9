// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Credential store: the current access/refresh pair, persisted durably.
//!
//! The pair is held behind one `Arc` and replaced wholesale, so readers on
//! other tasks never observe an access token from one pair and a refresh
//! token from another.

pub mod claims;
pub mod persist;
pub mod refresh;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::credential::persist::{KeyValueStore, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};

/// An access/refresh token pair. Both halves always travel together.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self { access_token: access_token.into(), refresh_token: refresh_token.into() }
    }
}

// Tokens stay out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// A refresh token that is empty or blank cannot be exchanged.
fn is_malformed(token: &str) -> bool {
    token.trim().is_empty()
}

/// Single source of truth for the session's credential pair.
pub struct CredentialStore {
    current: RwLock<Option<Arc<Credential>>>,
    backend: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    /// Create an empty store without reading the backend.
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { current: RwLock::new(None), backend }
    }

    /// Create a store seeded from whatever the backend persisted.
    ///
    /// A half-present or malformed pair is treated as logged out and wiped
    /// from the backend.
    pub fn load(backend: Arc<dyn KeyValueStore>) -> Self {
        let store = Self::new(backend);
        let access = store.read_backend(ACCESS_TOKEN_KEY);
        let refresh = store.read_backend(REFRESH_TOKEN_KEY);
        match (access, refresh) {
            (Some(access), Some(refresh)) if !is_malformed(&refresh) => {
                tracing::debug!("restored persisted credential");
                *store.current.write() = Some(Arc::new(Credential::new(access, refresh)));
            }
            (None, None) => {}
            _ => {
                tracing::warn!("persisted credential incomplete or malformed, clearing");
                store.clear();
            }
        }
        store
    }

    fn read_backend(&self, key: &str) -> Option<String> {
        match self.backend.get(key) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(key, err = %e, "failed to read persisted credential");
                None
            }
        }
    }

    /// Replace the pair in memory and in durable storage.
    ///
    /// A malformed refresh token clears the store instead.
    pub fn set_credential(&self, access_token: impl Into<String>, refresh_token: impl Into<String>) {
        let credential = Credential::new(access_token, refresh_token);
        if is_malformed(&credential.refresh_token) {
            tracing::warn!("refusing credential with malformed refresh token, clearing");
            self.clear();
            return;
        }

        let persisted = self.backend.set_many(&[
            (ACCESS_TOKEN_KEY, credential.access_token.as_str()),
            (REFRESH_TOKEN_KEY, credential.refresh_token.as_str()),
        ]);
        *self.current.write() = Some(Arc::new(credential));
        if let Err(e) = persisted {
            tracing::warn!(err = %e, "failed to persist credential, keeping it in memory only");
        }
    }

    /// Remove the pair from memory and durable storage.
    pub fn clear(&self) {
        *self.current.write() = None;
        if let Err(e) = self.backend.remove_many(&[ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY]) {
            tracing::warn!(err = %e, "failed to remove persisted credential");
        }
    }

    /// Snapshot of the current pair.
    pub fn credential(&self) -> Option<Arc<Credential>> {
        self.current.read().clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.current.read().as_ref().map(|c| c.access_token.clone())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.current.read().as_ref().map(|c| c.refresh_token.clone())
    }

    pub fn has_refresh_token(&self) -> bool {
        self.current.read().is_some()
    }

    /// Whether the access token is missing, undecodable, or expires within
    /// `threshold`.
    pub fn is_expiring_soon(&self, threshold: Duration) -> bool {
        self.is_expiring_soon_at(threshold, SystemTime::now())
    }

    pub fn is_expiring_soon_at(&self, threshold: Duration, now: SystemTime) -> bool {
        match self.current.read().as_ref() {
            Some(c) => claims::expires_within(&c.access_token, threshold, now),
            None => true,
        }
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
