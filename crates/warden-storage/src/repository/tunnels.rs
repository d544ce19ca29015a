//! Tunnels repository.

use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;
use warden_core::{Protocol, TrafficDelta};

use crate::error::{Result, StorageError};
use crate::models::{NewTunnel, Tunnel};

const SELECT_COLUMNS: &str = "SELECT id, user_id, up, down, total, remark, enable, expiry_time,
        listen, port, protocol, settings, stream_settings, tag, sniffing FROM tunnels";

/// Repository for tunnel operations.
pub struct TunnelsRepo;

impl TunnelsRepo {
    /// Insert a new tunnel. Fails with `Conflict` if the port is taken.
    pub fn insert(conn: &Connection, tunnel: &NewTunnel) -> Result<i64> {
        if Self::port_exists(conn, tunnel.port, None)? {
            return Err(StorageError::Conflict(format!(
                "port already in use: {}",
                tunnel.port
            )));
        }

        conn.execute(
            "INSERT INTO tunnels (user_id, up, down, total, remark, enable, expiry_time,
                listen, port, protocol, settings, stream_settings, tag, sniffing)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                tunnel.user_id,
                tunnel.up,
                tunnel.down,
                tunnel.total,
                tunnel.remark,
                tunnel.enable as i32,
                tunnel.expiry_time,
                tunnel.listen,
                tunnel.port,
                tunnel.protocol.as_str(),
                tunnel.settings,
                tunnel.stream_settings,
                tunnel.tag(),
                tunnel.sniffing,
            ],
        )?;

        Ok(conn.last_insert_rowid())
    }

    /// Insert several tunnels in one transaction; none are stored if any fails.
    pub fn insert_many(conn: &Connection, tunnels: &[NewTunnel]) -> Result<Vec<i64>> {
        let tx = conn.unchecked_transaction()?;
        let mut ids = Vec::with_capacity(tunnels.len());
        for tunnel in tunnels {
            ids.push(Self::insert(&tx, tunnel)?);
        }
        tx.commit()?;
        Ok(ids)
    }

    /// Get a tunnel by ID.
    pub fn get_by_id(conn: &Connection, id: i64) -> Result<Option<Tunnel>> {
        let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", SELECT_COLUMNS))?;
        let tunnel = stmt.query_row([id], map_tunnel).optional()?;
        Ok(tunnel)
    }

    /// Get a tunnel by its engine tag.
    pub fn get_by_tag(conn: &Connection, tag: &str) -> Result<Option<Tunnel>> {
        let mut stmt = conn.prepare(&format!("{} WHERE tag = ?1", SELECT_COLUMNS))?;
        let tunnel = stmt.query_row([tag], map_tunnel).optional()?;
        Ok(tunnel)
    }

    /// Get all tunnels owned by a user.
    pub fn get_by_user(conn: &Connection, user_id: i64) -> Result<Vec<Tunnel>> {
        let mut stmt = conn.prepare(&format!(
            "{} WHERE user_id = ?1 ORDER BY id ASC",
            SELECT_COLUMNS
        ))?;
        let tunnels = stmt
            .query_map([user_id], map_tunnel)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tunnels)
    }

    /// Get all tunnels.
    pub fn get_all(conn: &Connection) -> Result<Vec<Tunnel>> {
        let mut stmt = conn.prepare(&format!("{} ORDER BY id ASC", SELECT_COLUMNS))?;
        let tunnels = stmt
            .query_map([], map_tunnel)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tunnels)
    }

    /// Get all enabled tunnels, the set the engine is configured with.
    pub fn get_enabled(conn: &Connection) -> Result<Vec<Tunnel>> {
        let mut stmt = conn.prepare(&format!(
            "{} WHERE enable = 1 ORDER BY id ASC",
            SELECT_COLUMNS
        ))?;
        let tunnels = stmt
            .query_map([], map_tunnel)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tunnels)
    }

    /// Replace every field of a tunnel. The tag is recomputed from the port.
    pub fn update(conn: &Connection, id: i64, tunnel: &NewTunnel) -> Result<()> {
        if Self::port_exists(conn, tunnel.port, Some(id))? {
            return Err(StorageError::Conflict(format!(
                "port already in use: {}",
                tunnel.port
            )));
        }

        let updated = conn.execute(
            "UPDATE tunnels SET user_id = ?1, up = ?2, down = ?3, total = ?4, remark = ?5,
                enable = ?6, expiry_time = ?7, listen = ?8, port = ?9, protocol = ?10,
                settings = ?11, stream_settings = ?12, tag = ?13, sniffing = ?14
             WHERE id = ?15",
            params![
                tunnel.user_id,
                tunnel.up,
                tunnel.down,
                tunnel.total,
                tunnel.remark,
                tunnel.enable as i32,
                tunnel.expiry_time,
                tunnel.listen,
                tunnel.port,
                tunnel.protocol.as_str(),
                tunnel.settings,
                tunnel.stream_settings,
                tunnel.tag(),
                tunnel.sniffing,
                id
            ],
        )?;

        if updated == 0 {
            return Err(StorageError::NotFound(format!("Tunnel with id {}", id)));
        }

        Ok(())
    }

    /// Delete a tunnel.
    pub fn delete(conn: &Connection, id: i64) -> Result<()> {
        let deleted = conn.execute("DELETE FROM tunnels WHERE id = ?1", [id])?;

        if deleted == 0 {
            return Err(StorageError::NotFound(format!("Tunnel with id {}", id)));
        }

        Ok(())
    }

    /// Fold a batch of engine deltas into the cumulative counters.
    ///
    /// Only inbound deltas are applied. Deltas for tags with no tunnel match
    /// no row and are dropped. The batch commits as one unit: any failing
    /// increment rolls back every increment before it. Returns the number of
    /// tunnel rows updated.
    pub fn add_traffic(conn: &Connection, deltas: &[TrafficDelta]) -> Result<usize> {
        if deltas.is_empty() {
            return Ok(0);
        }

        let tx = conn.unchecked_transaction()?;
        let mut applied = 0;
        {
            let mut stmt =
                tx.prepare("UPDATE tunnels SET up = up + ?1, down = down + ?2 WHERE tag = ?3")?;
            for delta in deltas.iter().filter(|d| d.is_inbound) {
                let rows = stmt.execute(params![delta.up, delta.down, delta.tag])?;
                if rows == 0 {
                    debug!(tag = %delta.tag, "Dropping traffic for unknown tag");
                }
                applied += rows;
            }
        }
        tx.commit()?;

        Ok(applied)
    }

    /// Disable every enabled tunnel over quota or past expiry at `now_ms`.
    ///
    /// Returns the number of tunnels disabled. Never enables anything.
    pub fn disable_invalid(conn: &Connection, now_ms: i64) -> Result<u64> {
        let changed = conn.execute(
            "UPDATE tunnels SET enable = 0
             WHERE enable = 1
               AND ((total > 0 AND up + down >= total)
                    OR (expiry_time > 0 AND expiry_time <= ?1))",
            [now_ms],
        )?;
        Ok(changed as u64)
    }

    fn port_exists(conn: &Connection, port: u16, ignore_id: Option<i64>) -> Result<bool> {
        let count: i64 = match ignore_id {
            Some(id) => conn.query_row(
                "SELECT COUNT(*) FROM tunnels WHERE port = ?1 AND id != ?2",
                params![port, id],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT COUNT(*) FROM tunnels WHERE port = ?1",
                [port],
                |row| row.get(0),
            )?,
        };
        Ok(count > 0)
    }
}

fn map_tunnel(row: &Row<'_>) -> rusqlite::Result<Tunnel> {
    let protocol: String = row.get(10)?;
    let protocol = Protocol::parse(&protocol).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(10, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let port: u16 = row.get(9)?;

    Ok(Tunnel {
        id: row.get(0)?,
        user_id: row.get(1)?,
        up: row.get(2)?,
        down: row.get(3)?,
        total: row.get(4)?,
        remark: row.get(5)?,
        enable: row.get::<_, i32>(6)? != 0,
        expiry_time: row.get(7)?,
        listen: row.get(8)?,
        port,
        protocol,
        settings: row.get(11)?,
        stream_settings: row.get(12)?,
        tag: row.get(13)?,
        sniffing: row.get(14)?,
    })
}
