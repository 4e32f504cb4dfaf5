//! Upgrade orchestration: search -> download -> check, plus serving our own installers.
//!
//! Every discovery or storage notification recomputes the candidate list and,
//! when idle, starts one transfer of the newest candidate. Failures settle the
//! stage to `Failed`; the next notification drives the next attempt.

use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use peer_upgrade_core::{
    choose_candidate, upgrade_candidates, AvailableInstaller, InstallerDescriptor, ManagerState,
};
use semver::Version;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::discovery::{DiscoveryOptions, PeerDiscovery};
use crate::error::Result;
use crate::events::Notifier;
use crate::server::HttpServer;
use crate::storage::{InstallerStore, InstallerWriter, StoreOptions, WriteRequest};
use crate::transport::AnnounceLookup;

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// HTTP port for the installer surface; 0 picks a free one.
    pub port: u16,
    pub discovery: DiscoveryOptions,
    pub store: StoreOptions,
}

impl ManagerOptions {
    pub fn new(discovery_key: impl Into<String>, storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            port: 0,
            discovery: DiscoveryOptions::new(discovery_key),
            store: StoreOptions::new(storage_dir),
        }
    }
}

struct Services {
    server: HttpServer,
    watcher: JoinHandle<()>,
}

struct ManagerInner {
    port: u16,
    store: InstallerStore,
    discovery: PeerDiscovery,
    state: Mutex<ManagerState>,
    state_changed: Notifier<ManagerState>,
    services: tokio::sync::Mutex<Option<Services>>,
}

pub struct UpgradeManager {
    inner: Arc<ManagerInner>,
}

impl UpgradeManager {
    pub fn new(options: ManagerOptions, transport: Arc<dyn AnnounceLookup>) -> Result<Self> {
        let discovery = PeerDiscovery::new(options.discovery, transport)?;
        Ok(Self {
            inner: Arc::new(ManagerInner {
                port: options.port,
                store: InstallerStore::new(options.store),
                discovery,
                state: Mutex::new(ManagerState::default()),
                state_changed: Notifier::new(),
                services: tokio::sync::Mutex::new(None),
            }),
        })
    }

    /// Register the installer this device runs.
    pub async fn set_apk_info(
        &self,
        path: impl Into<PathBuf>,
        version: Version,
    ) -> Result<InstallerDescriptor> {
        let installer = self.inner.store.set_apk_info(path, version).await?;
        if self.inner.state.lock().search.is_searching() {
            self.inner.refresh_candidates();
        }
        Ok(installer)
    }

    /// Recover the store, serve it over HTTP, announce, and start searching.
    /// A no-op while running.
    pub async fn start_services(&self) -> Result<()> {
        let inner = &self.inner;
        let mut services = inner.services.lock().await;
        if services.is_some() {
            debug!("upgrade services already running");
            return Ok(());
        }
        inner.store.start().await?;
        let server = HttpServer::bind(inner.port, inner.store.clone()).await?;
        let installers = inner.discovery.subscribe_installers();
        let stored = inner.store.subscribe();
        if let Err(e) = inner.discovery.start(server.port()) {
            server.shutdown().await;
            return Err(e);
        }
        let port = server.port();
        let watcher = tokio::spawn(watch(inner.clone(), installers, stored));
        *services = Some(Services { server, watcher });
        inner.update(ManagerState::start_search);
        info!(port, "upgrade services started");
        inner.refresh_candidates();
        Ok(())
    }

    /// Stop discovery and the HTTP surface. A transfer already under way is
    /// left to complete or fail on its own.
    pub async fn stop_services(&self) -> Result<()> {
        let inner = &self.inner;
        let Some(services) = inner.services.lock().await.take() else {
            return Ok(());
        };
        let result = inner.discovery.stop();
        services.watcher.abort();
        services.server.shutdown().await;
        inner.update(ManagerState::stop_search);
        info!("upgrade services stopped");
        result
    }

    pub fn state(&self) -> ManagerState {
        self.inner.state.lock().clone()
    }

    /// A snapshot after every transition, in order.
    pub fn subscribe_state(&self) -> mpsc::UnboundedReceiver<ManagerState> {
        self.inner.state_changed.subscribe()
    }

    pub fn store(&self) -> &InstallerStore {
        &self.inner.store
    }

    pub fn discovery(&self) -> &PeerDiscovery {
        &self.inner.discovery
    }

    /// Port the installer surface listens on while running.
    pub async fn local_port(&self) -> Option<u16> {
        self.inner
            .services
            .lock()
            .await
            .as_ref()
            .map(|s| s.server.port())
    }
}

impl Drop for UpgradeManager {
    fn drop(&mut self) {
        if let Ok(mut services) = self.inner.services.try_lock() {
            if let Some(services) = services.take() {
                services.watcher.abort();
            }
        }
    }
}

impl ManagerInner {
    /// Apply a transition and publish the snapshot if it changed anything.
    fn update(&self, transition: impl FnOnce(&mut ManagerState) -> bool) -> bool {
        let mut state = self.state.lock();
        let changed = transition(&mut state);
        if changed {
            self.state_changed.emit(state.clone());
        }
        changed
    }

    fn refresh_candidates(self: &Arc<Self>) {
        let available = self.discovery.installers();
        let candidates = upgrade_candidates(
            &available,
            &self.store.hashes(),
            self.store.platform(),
            self.store.arch(),
            &self.store.current_version(),
        );
        self.update(|s| s.set_upgrades(candidates));
        self.maybe_download();
    }

    fn maybe_download(self: &Arc<Self>) {
        let candidate = {
            let mut state = self.state.lock();
            if !state.search.is_searching() || state.is_busy() {
                return;
            }
            let Some(candidate) = choose_candidate(state.search.upgrades()).cloned() else {
                return;
            };
            if !state.begin_download(candidate.hash(), candidate.installer.size) {
                return;
            }
            self.state_changed.emit(state.clone());
            candidate
        };
        tokio::spawn(self.clone().download(candidate));
    }

    async fn download(self: Arc<Self>, candidate: AvailableInstaller) {
        info!(installer = %candidate.installer, peer = %candidate.peer(), "downloading upgrade");
        let writer = match self.transfer(&candidate).await {
            Ok(writer) => writer,
            Err(e) => {
                warn!(installer = %candidate.installer, error = %e, "download failed");
                self.update(|s| s.fail_download(e.to_string()));
                return;
            }
        };
        self.update(ManagerState::finish_download);
        match writer.finish().await {
            Ok(installer) => {
                info!(installer = %installer, "upgrade available");
                self.update(|s| s.check_passed(installer));
            }
            Err(e) => {
                warn!(installer = %candidate.installer, error = %e, "downloaded installer rejected");
                self.update(|s| s.check_failed(e.to_string()));
            }
        }
    }

    /// Pipe the peer's bytes into a store writer, publishing progress per chunk.
    async fn transfer(&self, candidate: &AvailableInstaller) -> Result<InstallerWriter> {
        let mut writer = self
            .store
            .create_write_stream(WriteRequest::from(&candidate.installer))
            .await?;
        let mut body = self.discovery.create_read_stream(candidate.hash());
        while let Some(chunk) = body.next().await {
            writer.write(&chunk?).await?;
            let sofar = writer.written();
            self.update(|s| s.record_progress(sofar));
        }
        Ok(writer)
    }
}

async fn watch(
    inner: Arc<ManagerInner>,
    mut installers: mpsc::UnboundedReceiver<Vec<AvailableInstaller>>,
    mut stored: mpsc::UnboundedReceiver<Vec<InstallerDescriptor>>,
) {
    loop {
        tokio::select! {
            Some(_) = installers.recv() => {}
            Some(_) = stored.recv() => {}
            else => return,
        }
        inner.refresh_candidates();
    }
}
