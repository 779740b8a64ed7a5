//! Server lifecycle: wire the services together, run the accept loop and
//! the background ticker, shut down gracefully on signal.

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use roomcast_api::dispatch::{Dispatcher, LEGACY_ROOM_CODE};
use roomcast_api::http::{create_router, AppState};
use roomcast_api::hub::SessionHub;
use roomcast_core::clock::TICK_INTERVAL_SECS;
use roomcast_core::media::{FsMediaLibrary, JobQueue, ManifestStore, MediaLibrary};
use roomcast_core::models::RoomCode;
use roomcast_core::service::{
    AdminAuthority, BslService, ChatService, PlaybackService, RateLimiter, RoomRegistry,
};
use roomcast_core::store::{load_or_create_key, EventLog, MemoryStore, RoomAdminTable};
use roomcast_core::Config;

/// Time allowed for in-flight writes after the shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct RoomcastServer {
    config: Arc<Config>,
    state: AppState,
    registry: Arc<RoomRegistry>,
}

impl RoomcastServer {
    /// Build every service from configuration. Fatal errors here (bad key
    /// file, corrupt memory file) abort startup.
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);

        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .context("creating data directory")?;
        tokio::fs::create_dir_all(&config.media_dir)
            .await
            .context("creating media directory")?;

        let key = load_or_create_key(&config.data_dir.join("memory.key"))
            .context("sourcing memory encryption key")?;
        let memory = Arc::new(
            MemoryStore::open(config.data_dir.join("memory.json"), &key)
                .context("opening memory file")?,
        );
        let admin_table = Arc::new(
            RoomAdminTable::open(config.data_dir.join("room_admins.json"))
                .context("opening room admin table")?,
        );
        let registry = Arc::new(RoomRegistry::new(admin_table));

        let manifests = ManifestStore::new(config.data_dir.join("manifests"));
        let removed = manifests.sweep(&config.media_dir).await;
        if removed > 0 {
            info!(removed, "Startup sweep removed stale track manifests");
        }

        let media: Arc<dyn MediaLibrary> = Arc::new(FsMediaLibrary::new(
            config.media_dir.clone(),
            manifests.clone(),
        ));
        let jobs = Arc::new(JobQueue::new(
            config.media_dir.clone(),
            config.data_dir.join("tracks"),
            manifests.clone(),
        ));

        let dispatcher = Arc::new(Dispatcher {
            config: config.clone(),
            registry: registry.clone(),
            playback: PlaybackService::new(config.video_autoplay, config.skip_intro_seconds),
            bsl: BslService::new(
                config.bsl_advanced_match,
                config.bsl_match_threshold,
                config.bsl_mode,
                memory.clone(),
            ),
            chat: ChatService::new(memory.clone()),
            admin: Arc::new(AdminAuthority::new(
                config.admin_fingerprint_lock,
                memory.clone(),
            )),
            rate_limiter: Arc::new(RateLimiter::new()),
            media: media.clone(),
            event_log: Arc::new(EventLog::new(config.data_dir.join("logs"))),
            hub: Arc::new(SessionHub::new()),
        });

        if !config.server_mode {
            registry.ensure_room(RoomCode::normalize(LEGACY_ROOM_CODE), "Shared session");
        }

        let state = AppState::new(config.clone(), dispatcher, media, manifests, jobs);
        Ok(Self {
            config,
            state,
            registry,
        })
    }

    /// Run until SIGINT/SIGTERM, then drain for up to five seconds.
    pub async fn run(self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Background ticker: consolidate playing rooms so stored positions
        // track real time. Never broadcasts.
        let ticker_registry = self.registry.clone();
        let mut ticker_shutdown = shutdown_rx.clone();
        let ticker = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(TICK_INTERVAL_SECS));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        ticker_registry.consolidate_all(chrono::Utc::now());
                    }
                    _ = ticker_shutdown.changed() => break,
                }
            }
        });

        let addr: SocketAddr = self
            .config
            .bind_address()
            .parse()
            .context("parsing bind address")?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding {addr}"))?;

        info!(address = %addr, server_mode = self.config.server_mode, "roomcast listening");
        self.state
            .dispatcher
            .event_log
            .append_general(
                "server-started",
                serde_json::json!({
                    "port": self.config.port,
                    "serverMode": self.config.server_mode,
                }),
            )
            .await;
        if self.config.use_https {
            // TLS termination is the launcher's concern; the core serves
            // plain HTTP behind it.
            warn!("USE_HTTPS is set; expecting the launcher to terminate TLS in front");
        }

        let router = create_router(self.state.clone())
            .into_make_service_with_connect_info::<SocketAddr>();

        let mut serve_shutdown = shutdown_rx.clone();
        let mut server_task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = serve_shutdown.changed().await;
                })
                .await
        });

        tokio::select! {
            result = &mut server_task => {
                let _ = shutdown_tx.send(true);
                result.context("server task")?.context("serving HTTP")?;
                let _ = tokio::time::timeout(SHUTDOWN_GRACE, ticker).await;
                return Ok(());
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received");
            }
        }

        // Stop accepting and stop the ticker, then close every connection
        // so their read loops unwind instead of keeping the server alive.
        let _ = shutdown_tx.send(true);
        self.state.dispatcher.hub.disconnect_all();

        // Bounded drain for in-flight writes; past the window, force-exit.
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut server_task).await {
            Ok(result) => {
                result.context("server task")?.context("serving HTTP")?;
            }
            Err(_) => {
                warn!(
                    grace_seconds = SHUTDOWN_GRACE.as_secs(),
                    "Connections did not drain in time, forcing exit"
                );
                std::process::exit(0);
            }
        }

        let _ = tokio::time::timeout(SHUTDOWN_GRACE, ticker).await;
        info!("roomcast stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
