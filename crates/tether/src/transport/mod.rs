// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP request pipeline and realtime WebSocket session.

pub mod backoff;
pub mod envelope;
pub mod frame;
pub mod http;
pub mod outbox;
pub mod ws;
