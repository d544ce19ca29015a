//! Tunnel management for the admin layer.
//!
//! Every successful mutation marks the engine for restart; the restart job
//! picks the request up on its next tick.

use tracing::info;
use warden_engine::RestartFlag;
use warden_storage::{Database, NewTunnel, Result, StorageError, Tunnel};

/// Tunnel CRUD that keeps the engine in sync with the stored set.
#[derive(Clone)]
pub struct TunnelService {
    db: Database,
    flag: RestartFlag,
}

impl TunnelService {
    pub fn new(db: Database, flag: RestartFlag) -> Self {
        Self { db, flag }
    }

    /// Creates one tunnel.
    pub fn add(&self, tunnel: &NewTunnel) -> Result<Tunnel> {
        let id = self.db.create_tunnel(tunnel)?;
        self.flag.set();
        info!(tag = %tunnel.tag(), "Tunnel added");
        self.fetch(id)
    }

    /// Creates several tunnels in one transaction.
    pub fn add_many(&self, tunnels: &[NewTunnel]) -> Result<Vec<Tunnel>> {
        if tunnels.is_empty() {
            return Ok(Vec::new());
        }
        let ids = self.db.create_tunnels(tunnels)?;
        self.flag.set();
        info!(count = ids.len(), "Tunnels added");
        ids.into_iter().map(|id| self.fetch(id)).collect()
    }

    /// Replaces a tunnel's fields.
    pub fn update(&self, id: i64, tunnel: &NewTunnel) -> Result<Tunnel> {
        self.db.update_tunnel(id, tunnel)?;
        self.flag.set();
        info!(id, tag = %tunnel.tag(), "Tunnel updated");
        self.fetch(id)
    }

    /// Deletes a tunnel.
    pub fn delete(&self, id: i64) -> Result<()> {
        self.db.delete_tunnel(id)?;
        self.flag.set();
        info!(id, "Tunnel deleted");
        Ok(())
    }

    /// Tunnels owned by `user_id`.
    pub fn list_for_user(&self, user_id: i64) -> Result<Vec<Tunnel>> {
        self.db.get_tunnels_by_user(user_id)
    }

    fn fetch(&self, id: i64) -> Result<Tunnel> {
        self.db
            .get_tunnel(id)?
            .ok_or_else(|| StorageError::NotFound(format!("tunnel {}", id)))
    }
}
