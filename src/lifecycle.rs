// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Startup and shutdown sequencing (§4.1): lock acquisition, store open,
//! allowlist/denylist/key load, crash recovery, media sweep, bind-policy
//! enforcement, and the background watchers that run for the life of the
//! process.
//!
//! Grounded on the upstream bridge's own `run()`: bind, build the router,
//! `axum::serve` with graceful shutdown. Generalized into a `start`/`wait`
//! split so callers (tests, `main`) can hold a handle to the listening
//! address and trigger shutdown themselves instead of blocking forever.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapter::{Adapter, EchoAdapter};
use crate::config::ClawlineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::ProviderError;
use crate::media::MediaService;
use crate::pairing::PairingManager;
use crate::ratelimit::RateLimiter;
use crate::session::SessionRegistry;
use crate::state::ProviderState;
use crate::store::allowlist::AllowlistStore;
use crate::store::denylist::DenylistStore;
use crate::store::keyfile::SigningKey;
use crate::store::lock::FileLock;
use crate::store::sql::SqlStore;
use crate::wire::ServerFrame;
use crate::writer::WriteQueue;

/// How often the pending-pair-request expiry sweep runs.
const PENDING_EXPIRY_INTERVAL: Duration = Duration::from_secs(5);

/// A running provider instance: the bound address and the means to stop it.
pub struct ProviderHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    server_task: JoinHandle<anyhow::Result<()>>,
}

impl ProviderHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signal graceful shutdown; in-flight requests and writer jobs still drain.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for the server to stop, either from `shutdown()` or a fatal error.
    pub async fn wait(self) -> anyhow::Result<()> {
        self.server_task.await.map_err(|e| anyhow::anyhow!("server task panicked: {e}"))?
    }
}

pub struct Lifecycle;

impl Lifecycle {
    /// Run the full startup sequence and begin serving. `adapter_override`
    /// lets an embedding host supply its own assistant adapter; `None` falls
    /// back to the built-in echo adapter (§6).
    pub async fn start(config: ClawlineConfig, adapter_override: Option<Arc<dyn Adapter>>) -> anyhow::Result<ProviderHandle> {
        enforce_bind_policy(&config)?;
        std::fs::create_dir_all(&config.state_path)?;

        let shutdown = CancellationToken::new();
        acquire_instance_lock(config.state_path.join("clawline.lock"), shutdown.clone()).await?;

        let store = Arc::new(SqlStore::open(&config.state_path.join("clawline.sqlite")).await?);

        let allowlist = Arc::new(AllowlistStore::load(
            &config.state_path.join("allowlist.json"),
            &config.state_path.join("allowlist.lock"),
        )?);
        let denylist = Arc::new(DenylistStore::load(&config.state_path.join("denylist.json"))?);
        let signing_key = SigningKey::load_or_generate(&config.state_path.join("jwt.key"))?;

        let writer = WriteQueue::spawn(Arc::clone(&store), config.sessions.max_write_queue_depth, shutdown.clone());

        recover_startup(&writer, &config).await?;

        let media = Arc::new(MediaService::new(config.media.clone(), Arc::clone(&store), writer.clone()));
        media.ensure_dirs()?;
        let removed_tmp = media.startup_sweep().await?;
        if removed_tmp > 0 {
            tracing::info!(removed_tmp, "cleared stale upload temp files at startup");
        }

        let pairing = Arc::new(PairingManager::new(
            Arc::clone(&allowlist),
            Arc::clone(&denylist),
            signing_key,
            config.pairing.clone(),
            config.auth.clone(),
        ));
        let sessions = Arc::new(SessionRegistry::new());
        let rate_limiter = Arc::new(RateLimiter::new());
        let adapter: Arc<dyn Adapter> = adapter_override.unwrap_or_else(|| Arc::new(EchoAdapter));

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
            config: config.clone(),
            store: Arc::clone(&store),
            writer: writer.clone(),
            pairing: Arc::clone(&pairing),
            sessions: Arc::clone(&sessions),
            rate_limiter: Arc::clone(&rate_limiter),
            dispatcher,
            media: Arc::clone(&media),
            adapter,
            shutdown: shutdown.clone(),
        });

        let sessions_for_watch = Arc::clone(&sessions);
        Arc::clone(&denylist).spawn_watch(shutdown.clone(), move |device_id| {
            sessions_for_watch.send_to_device(
                &device_id,
                ServerFrame::Error {
                    code: "token_revoked",
                    message: "device was removed from the allowlist".into(),
                    message_id: None,
                },
            );
            sessions_for_watch.request_close(&device_id);
        });
        Arc::clone(&media).spawn_periodic_sweep(shutdown.clone());
        spawn_pending_expiry(Arc::clone(&pairing), Arc::clone(&sessions), shutdown.clone());

        let addr = format!("{}:{}", config.network.host, config.network.port);
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;

        let router = crate::transport::build_router(state);
        tracing::info!(%local_addr, "clawline provider listening");

        let shutdown_for_serve = shutdown.clone();
        let server_task = tokio::spawn(async move {
            axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(shutdown_for_serve.cancelled_owned())
                .await
                .map_err(anyhow::Error::from)
        });

        Ok(ProviderHandle { local_addr, shutdown, server_task })
    }
}

/// Refuse to bind to anything but loopback unless explicitly overridden (§4.1 step 7).
fn enforce_bind_policy(config: &ClawlineConfig) -> anyhow::Result<()> {
    if config.network.allow_insecure_public {
        return Ok(());
    }
    let host = config.network.host.as_str();
    let is_loopback = host == "localhost"
        || host.parse::<std::net::IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false);
    if is_loopback {
        Ok(())
    } else {
        Err(ProviderError::BindNotAllowed.into())
    }
}

/// Acquire the single-instance advisory lock for the life of the process
/// (§4.1 step 1): a dedicated task holds the guard until `shutdown` fires,
/// since `FileLock`'s guard borrows from a value that otherwise has nowhere
/// long-lived to live.
async fn acquire_instance_lock(path: std::path::PathBuf, shutdown: CancellationToken) -> anyhow::Result<()> {
    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let mut lock = match FileLock::open(&path) {
            Ok(lock) => lock,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };
        match lock.try_acquire() {
            Ok(_guard) => {
                let _ = ready_tx.send(Ok(()));
                shutdown.cancelled().await;
                // `_guard` drops here, releasing the lock.
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e.into()));
            }
        }
    });
    ready_rx.await.map_err(|_| anyhow::anyhow!("lock task exited before reporting status"))?
}

/// Periodically evict pending pair requests past their TTL, notifying the
/// still-connected pre-auth socket with `pair_result{success:false,
/// reason:"pair_timeout"}` before dropping them (§4.4).
fn spawn_pending_expiry(pairing: Arc<PairingManager>, sessions: Arc<SessionRegistry>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(PENDING_EXPIRY_INTERVAL) => {
                    let expired = pairing.expire_pending(crate::now_ms() as u64).await;
                    for device_id in expired {
                        sessions.send_pending(
                            &device_id,
                            ServerFrame::PairResult {
                                success: false,
                                token: None,
                                user_id: None,
                                reason: Some("pair_timeout"),
                            },
                        );
                        sessions.remove_pending(&device_id);
                    }
                }
            }
        }
    });
}

/// Finalize any in-flight stream left by an unclean shutdown and drop
/// message rows that never got far enough to pair with an event (§4.1 step 5).
async fn recover_startup(writer: &WriteQueue, config: &ClawlineConfig) -> anyhow::Result<()> {
    let cutoff = crate::now_ms() - config.streams.stream_inactivity().as_millis() as i64;
    let (messages, events) = writer
        .recover_startup(cutoff)
        .await
        .ok_or_else(|| anyhow::anyhow!("write queue unavailable during startup recovery"))??;
    if messages > 0 || events > 0 {
        tracing::info!(messages, events, "recovered stale in-flight state at startup");
    }
    Ok(())
}

#[cfg(test)]
mod lifecycle_tests {
    use super::*;
    use std::path::PathBuf;

    use crate::config::{AuthConfig, MediaConfig, NetworkConfig, PairingConfig, SessionsConfig, StreamsConfig};

    fn test_config(state_path: PathBuf, port: u16) -> ClawlineConfig {
        ClawlineConfig {
            config: None,
            state_path,
            network: NetworkConfig { host: "127.0.0.1".to_owned(), port, allow_insecure_public: false },
            auth: AuthConfig::default(),
            pairing: PairingConfig::default(),
            media: MediaConfig::default(),
            sessions: SessionsConfig::default(),
            streams: StreamsConfig::default(),
            adapter: None,
        }
    }

    #[test]
    fn bind_policy_rejects_non_loopback_without_override() {
        let mut config = test_config(PathBuf::from("./state"), 0);
        config.network.host = "0.0.0.0".to_owned();
        assert!(enforce_bind_policy(&config).is_err());
        config.network.allow_insecure_public = true;
        assert!(enforce_bind_policy(&config).is_ok());
    }

    #[test]
    fn bind_policy_allows_loopback_by_default() {
        let config = test_config(PathBuf::from("./state"), 0);
        assert!(enforce_bind_policy(&config).is_ok());
    }

    #[tokio::test]
    async fn start_binds_and_shuts_down_cleanly() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let config = test_config(dir.path().join("state"), 0);
        let media_path = dir.path().join("media");
        let mut config = config;
        config.media.media_path = media_path;

        let handle = Lifecycle::start(config, None).await.unwrap_or_else(|e| panic!("start: {e}"));
        assert_ne!(handle.local_addr().port(), 0);
        handle.shutdown();
        handle.wait().await.unwrap_or_else(|e| panic!("wait: {e}"));
    }
}
