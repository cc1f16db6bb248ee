// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared black-box test harness: assembles a full `ProviderState` the way
//! `Lifecycle::start` does, minus the TCP bind, so HTTP tests can hand the
//! router to `axum_test::TestServer` and WS tests can drive a real listener
//! through `Lifecycle::start` directly.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use clawline_provider::adapter::{Adapter, EchoAdapter};
use clawline_provider::config::{
    AuthConfig, ClawlineConfig, MediaConfig, NetworkConfig, PairingConfig, SessionsConfig, StreamsConfig,
};
use clawline_provider::dispatcher::Dispatcher;
use clawline_provider::media::MediaService;
use clawline_provider::pairing::PairingManager;
use clawline_provider::ratelimit::RateLimiter;
use clawline_provider::session::SessionRegistry;
use clawline_provider::state::ProviderState;
use clawline_provider::store::allowlist::AllowlistStore;
use clawline_provider::store::denylist::DenylistStore;
use clawline_provider::store::keyfile::SigningKey;
use clawline_provider::store::sql::SqlStore;
use clawline_provider::writer::WriteQueue;

use clawline_provider::ids::{DeviceId, UserId};
use clawline_provider::store::allowlist::AllowlistEntry;

/// Keeps the temp directory alive for as long as the harness is in scope;
/// the state it backs is deleted on drop.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub state: Arc<ProviderState>,
}

pub fn test_config(dir: &tempfile::TempDir) -> ClawlineConfig {
    ClawlineConfig {
        config: None,
        state_path: dir.path().join("state"),
        network: NetworkConfig { host: "127.0.0.1".to_owned(), port: 0, allow_insecure_public: false },
        auth: AuthConfig::default(),
        pairing: PairingConfig::default(),
        media: MediaConfig { media_path: dir.path().join("media"), ..MediaConfig::default() },
        sessions: SessionsConfig::default(),
        streams: StreamsConfig::default(),
        adapter: None,
    }
}

/// Build a fully wired `ProviderState` without binding a listener, for
/// feeding directly into `build_router` + `axum_test::TestServer`.
pub async fn build_state(config: ClawlineConfig) -> Harness {
    build_state_with_dir(tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}")), config).await
}

async fn build_state_with_dir(dir: tempfile::TempDir, config: ClawlineConfig) -> Harness {
    std::fs::create_dir_all(&config.state_path).unwrap_or_else(|e| panic!("create state dir: {e}"));

    let store = Arc::new(
        SqlStore::open(&config.state_path.join("clawline.sqlite")).await.unwrap_or_else(|e| panic!("open store: {e}")),
    );
    let allowlist = Arc::new(
        AllowlistStore::load(&config.state_path.join("allowlist.json"), &config.state_path.join("allowlist.lock"))
            .unwrap_or_else(|e| panic!("load allowlist: {e}")),
    );
    let denylist = Arc::new(
        DenylistStore::load(&config.state_path.join("denylist.json")).unwrap_or_else(|e| panic!("load denylist: {e}")),
    );
    let signing_key =
        SigningKey::load_or_generate(&config.state_path.join("jwt.key")).unwrap_or_else(|e| panic!("load key: {e}"));

    let shutdown = CancellationToken::new();
    let writer = WriteQueue::spawn(Arc::clone(&store), config.sessions.max_write_queue_depth, shutdown.clone());

    let media = Arc::new(MediaService::new(config.media.clone(), Arc::clone(&store), writer.clone()));
    media.ensure_dirs().unwrap_or_else(|e| panic!("ensure media dirs: {e}"));

    let pairing = Arc::new(PairingManager::new(
        Arc::clone(&allowlist),
        Arc::clone(&denylist),
        signing_key,
        config.pairing.clone(),
        config.auth.clone(),
    ));
    let sessions = Arc::new(SessionRegistry::new());
    let rate_limiter = Arc::new(RateLimiter::new());
    let adapter: Arc<dyn Adapter> = Arc::new(EchoAdapter);

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        writer.clone(),
        Arc::clone(&sessions),
        Arc::clone(&adapter),
        config.auth.clone(),
        config.sessions.clone(),
        config.streams.clone(),
    ));

    let state = Arc::new(ProviderState {
        config,
        store,
        writer,
        pairing,
        sessions,
        rate_limiter,
        dispatcher,
        media,
        adapter,
        shutdown,
    });

    Harness { dir, state }
}

impl Harness {
    /// Directly allowlist a device and mint its token, skipping the
    /// pair_request/pair_decision round trip for tests that only care about
    /// what happens once a device is already paired.
    pub async fn enroll(&self, is_admin: bool) -> (DeviceId, UserId, String) {
        let device_id = DeviceId::generate();
        let user_id = UserId::generate();
        let now_ms = clawline_provider::now_ms() as u64;
        let entry = AllowlistEntry {
            device_id: device_id.clone(),
            user_id: user_id.clone(),
            is_admin,
            token_delivered: false,
            claimed_name: None,
            device_info: Default::default(),
            created_at_ms: now_ms,
            last_seen_at_ms: None,
        };
        self.state.pairing.allowlist().insert(entry.clone()).await.unwrap_or_else(|e| panic!("insert: {e}"));
        let token = self.state.pairing.issue_token(&entry, now_ms).await.unwrap_or_else(|e| panic!("issue_token: {e}"));
        (device_id, user_id, token)
    }
}
