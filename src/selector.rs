use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::adapter::{connect, BackendKind, StorageAdapter};
use crate::config::{AdapterSettings, BackendConfig};
use crate::error::{PersistenceError, PersistenceResult};

/// Holds the active storage adapter. Callers keep the adapter they obtained
/// until their call finishes; a switch never waits on them to connect.
#[derive(Debug)]
pub struct AdapterSelector {
    settings: AdapterSettings,
    active: RwLock<Option<Arc<dyn StorageAdapter>>>,
    lifecycle: Mutex<()>,
}

impl AdapterSelector {
    pub fn new(settings: AdapterSettings) -> Self {
        Self {
            settings,
            active: RwLock::new(None),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &AdapterSettings {
        &self.settings
    }

    fn current(&self) -> Option<Arc<dyn StorageAdapter>> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace(&self, adapter: Option<Arc<dyn StorageAdapter>>) -> Option<Arc<dyn StorageAdapter>> {
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *active, adapter)
    }

    /// Connects the configured backend. Fails fast with `Connection` when it
    /// is unreachable and with `Conflict` if an adapter is already active.
    pub async fn initialize(&self, config: &BackendConfig) -> PersistenceResult<BackendKind> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.current().is_some() {
            return Err(PersistenceError::conflict(
                "Storage adapter is already initialized; use switch to change backends",
            ));
        }

        let adapter = connect(config, &self.settings).await?;
        let kind = adapter.kind();
        self.replace(Some(adapter));
        info!("Initialized {} storage backend at {}", kind, config.describe());
        Ok(kind)
    }

    pub async fn initialize_with(&self, adapter: Arc<dyn StorageAdapter>) -> PersistenceResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.current().is_some() {
            return Err(PersistenceError::conflict(
                "Storage adapter is already initialized; use switch to change backends",
            ));
        }
        info!("Initialized {} storage backend", adapter.kind());
        self.replace(Some(adapter));
        Ok(())
    }

    pub fn get_active(&self) -> PersistenceResult<Arc<dyn StorageAdapter>> {
        self.current().ok_or(PersistenceError::NotInitialized)
    }

    pub fn active_backend(&self) -> Option<BackendKind> {
        self.current().map(|adapter| adapter.kind())
    }

    /// Connects the new backend and swaps it in. No data is copied.
    pub async fn switch(&self, config: &BackendConfig) -> PersistenceResult<BackendKind> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.current().is_none() {
            return Err(PersistenceError::NotInitialized);
        }

        let adapter = connect(config, &self.settings).await?;
        let kind = adapter.kind();
        self.swap_in(adapter).await;
        info!("Switched storage backend to {} at {}", kind, config.describe());
        Ok(kind)
    }

    /// Swaps in an already connected adapter after checking it is reachable.
    pub async fn switch_to(&self, adapter: Arc<dyn StorageAdapter>) -> PersistenceResult<BackendKind> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.current().is_none() {
            return Err(PersistenceError::NotInitialized);
        }

        adapter.health_check().await?;
        let kind = adapter.kind();
        self.swap_in(adapter).await;
        info!("Switched storage backend to {}", kind);
        Ok(kind)
    }

    async fn swap_in(&self, adapter: Arc<dyn StorageAdapter>) {
        if let Some(previous) = self.replace(Some(adapter)) {
            info!("Closing previous {} storage backend", previous.kind());
            previous.close().await;
        }
    }

    /// Closes the active adapter; later calls fail with `NotInitialized`.
    pub async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        match self.replace(None) {
            Some(previous) => {
                info!("Shutting down {} storage backend", previous.kind());
                previous.close().await;
            }
            None => warn!("Shutdown requested but no storage backend is active"),
        }
    }
}
