// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared provider state: every long-lived component threaded through the
//! transport layer, assembled once at startup (§9 "module-level singletons"
//! become fields of a value instead).

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::adapter::Adapter;
use crate::config::ClawlineConfig;
use crate::dispatcher::Dispatcher;
use crate::media::MediaService;
use crate::pairing::PairingManager;
use crate::ratelimit::RateLimiter;
use crate::session::SessionRegistry;
use crate::store::sql::SqlStore;
use crate::writer::WriteQueue;

/// Everything a connection handler or HTTP handler needs, held behind one
/// `Arc` and cloned cheaply per request/connection.
pub struct ProviderState {
    pub config: ClawlineConfig,
    pub store: Arc<SqlStore>,
    pub writer: WriteQueue,
    pub pairing: Arc<PairingManager>,
    pub sessions: Arc<SessionRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub dispatcher: Arc<Dispatcher>,
    pub media: Arc<MediaService>,
    pub adapter: Arc<dyn Adapter>,
    pub shutdown: CancellationToken,
}
