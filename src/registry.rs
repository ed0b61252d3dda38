//! Connection registry: owns every configured device connection.
//!
//! The registry is an explicit value held by the host. All mutations go
//! through [`RegistryAction`] so the list can be replayed and persisted
//! from one place.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::connection::{DeviceConnection, TransportSet};
use mpyb_core::{ConnectionDescriptor, ReplError, ReplResult};

/// Shared registry handle.
pub type RegistryState = Arc<ConnectionRegistry>;

#[derive(Debug, Clone)]
pub enum RegistryAction {
    Add(ConnectionDescriptor),
    Update(ConnectionDescriptor),
    Remove(String),
}

#[derive(Default)]
struct Entries {
    order: Vec<String>,
    by_id: HashMap<String, DeviceConnection>,
}

pub struct ConnectionRegistry {
    transports: TransportSet,
    entries: RwLock<Entries>,
}

impl ConnectionRegistry {
    pub fn new(transports: TransportSet) -> RegistryState {
        Arc::new(Self {
            transports,
            entries: RwLock::new(Entries::default()),
        })
    }

    // ── Reducer ─────────────────────────────────────────────────────

    /// Apply one mutation. Validation happens before anything changes.
    pub async fn apply(&self, action: RegistryAction) -> ReplResult<()> {
        match action {
            RegistryAction::Add(descriptor) => self.add(descriptor).await,
            RegistryAction::Update(descriptor) => {
                let conn = self.get(&descriptor.id).await?;
                conn.update_descriptor(descriptor).await?;
                log::info!("[registry] updated {}", conn.id());
                Ok(())
            }
            RegistryAction::Remove(id) => self.remove(&id).await,
        }
    }

    async fn add(&self, descriptor: ConnectionDescriptor) -> ReplResult<()> {
        let id = descriptor.id.clone();
        let conn = DeviceConnection::build(descriptor, &self.transports)?;
        let mut entries = self.entries.write().await;
        if entries.by_id.contains_key(&id) {
            return Err(ReplError::validation(format!(
                "Connection '{}' already exists",
                id
            )));
        }
        entries.order.push(id.clone());
        entries.by_id.insert(id.clone(), conn);
        log::info!("[registry] added {}", id);
        Ok(())
    }

    async fn remove(&self, id: &str) -> ReplResult<()> {
        let conn = {
            let mut entries = self.entries.write().await;
            let conn = entries
                .by_id
                .remove(id)
                .ok_or_else(|| ReplError::not_found(id))?;
            entries.order.retain(|x| x != id);
            conn
        };
        // a removed connection must not leave its socket or port open
        if let Err(e) = conn.disconnect().await {
            log::warn!("[registry] disconnect of removed {} failed: {}", id, e);
        }
        log::info!("[registry] removed {}", id);
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub async fn get(&self, id: &str) -> ReplResult<DeviceConnection> {
        self.entries
            .read()
            .await
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| ReplError::not_found(id))
    }

    /// Look up by id, or by name when no id matches.
    pub async fn find(&self, key: &str) -> ReplResult<DeviceConnection> {
        if let Ok(conn) = self.get(key).await {
            return Ok(conn);
        }
        for conn in self.list().await {
            if conn.descriptor().await.name == key {
                return Ok(conn);
            }
        }
        Err(ReplError::not_found(key))
    }

    /// Connections in insertion order.
    pub async fn list(&self) -> Vec<DeviceConnection> {
        let entries = self.entries.read().await;
        entries
            .order
            .iter()
            .filter_map(|id| entries.by_id.get(id).cloned())
            .collect()
    }

    pub async fn descriptors(&self) -> Vec<ConnectionDescriptor> {
        let mut out = Vec::new();
        for conn in self.list().await {
            out.push(conn.descriptor().await);
        }
        out
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    // ── Shutdown ────────────────────────────────────────────────────

    pub async fn disconnect_all(&self) {
        for conn in self.list().await {
            if let Err(e) = conn.disconnect().await {
                log::warn!("[registry] disconnect {} failed: {}", conn.id(), e);
            }
        }
    }
}
