//! SQLite time series of samples and per-device storage rows.
//!
//! Tables are append-only. Opening a database written by an older build adds any missing
//! columns with `DEFAULT 0`; columns are never dropped or renamed.

use crate::snapshot::DeviceClass;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info};

const BASE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS metrics (
    ts_ms INTEGER NOT NULL,
    cpu_load1 REAL,
    cpu_load5 REAL,
    cpu_load15 REAL,
    mem_used_mb INTEGER,
    mem_total_mb INTEGER,
    disk_used_percent REAL,
    disk_size_bytes INTEGER,
    net_rx_bps REAL,
    net_tx_bps REAL,
    tx_download_bps REAL,
    tx_upload_bps REAL,
    tx_active_torrents INTEGER
);
CREATE INDEX IF NOT EXISTS idx_metrics_ts ON metrics(ts_ms);

CREATE TABLE IF NOT EXISTS storage_metrics (
    ts_ms INTEGER NOT NULL,
    device_fs TEXT NOT NULL,
    mount TEXT,
    device_type TEXT NOT NULL,
    total_bytes INTEGER,
    used_bytes INTEGER,
    use_percent REAL
);
CREATE INDEX IF NOT EXISTS idx_storage_ts ON storage_metrics(ts_ms);
CREATE INDEX IF NOT EXISTS idx_storage_device ON storage_metrics(device_type, device_fs, ts_ms);
"#;

/// Columns added to `metrics` after the base layout, in the order they were introduced.
const METRICS_UPGRADES: [(&str, &str); 9] = [
    ("mem_swap_used_mb", "INTEGER"),
    ("mem_swap_total_mb", "INTEGER"),
    ("mem_free_mb", "INTEGER"),
    ("mem_available_mb", "INTEGER"),
    ("mem_shared_mb", "INTEGER"),
    ("mem_buffers_mb", "INTEGER"),
    ("mem_cached_mb", "INTEGER"),
    ("mem_buffcache_mb", "INTEGER"),
    ("mem_used_pct", "REAL"),
];

pub const SAMPLE_COLUMNS: [&str; 22] = [
    "ts_ms",
    "cpu_load1",
    "cpu_load5",
    "cpu_load15",
    "mem_used_mb",
    "mem_total_mb",
    "mem_swap_used_mb",
    "mem_swap_total_mb",
    "mem_free_mb",
    "mem_available_mb",
    "mem_shared_mb",
    "mem_buffers_mb",
    "mem_cached_mb",
    "mem_buffcache_mb",
    "mem_used_pct",
    "disk_used_percent",
    "disk_size_bytes",
    "net_rx_bps",
    "net_tx_bps",
    "tx_download_bps",
    "tx_upload_bps",
    "tx_active_torrents",
];

pub const STORAGE_COLUMNS: [&str; 7] = [
    "ts_ms",
    "device_fs",
    "mount",
    "device_type",
    "total_bytes",
    "used_bytes",
    "use_percent",
];

/// One recorder tick, flattened. Rates are bits per second.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Sample {
    pub ts_ms: i64,
    pub cpu_load1: f64,
    pub cpu_load5: f64,
    pub cpu_load15: f64,
    pub mem_used_mb: i64,
    pub mem_total_mb: i64,
    pub mem_swap_used_mb: i64,
    pub mem_swap_total_mb: i64,
    pub mem_free_mb: i64,
    pub mem_available_mb: i64,
    pub mem_shared_mb: i64,
    pub mem_buffers_mb: i64,
    pub mem_cached_mb: i64,
    pub mem_buffcache_mb: i64,
    pub mem_used_pct: f64,
    pub disk_used_percent: f64,
    pub disk_size_bytes: i64,
    pub net_rx_bps: f64,
    pub net_tx_bps: f64,
    pub tx_download_bps: f64,
    pub tx_upload_bps: f64,
    pub tx_active_torrents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageSample {
    pub ts_ms: i64,
    pub device_fs: String,
    pub mount: String,
    pub device_type: String,
    pub total_bytes: i64,
    pub used_bytes: i64,
    pub use_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleQuery {
    /// Most recent `limit` rows, returned oldest first.
    Latest { limit: usize },
    /// Every row with `ts_ms >= since_ms`, oldest first.
    Since { since_ms: i64 },
}

/// Storage rows filter. With `limit`, the most recent matching rows are kept; results are
/// always oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageQuery {
    pub device_type: Option<DeviceClass>,
    pub device_fs: Option<String>,
    pub since_ms: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to create database directory {path}: {source}")]
    CreateDir {
        path: String,
        source: std::io::Error,
    },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database connection lock poisoned")]
    Poisoned,
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        let added = migrate(&conn)?;
        info!(path = %path.display(), columns_added = added, "metrics store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Writes one recorder tick: the sample and its storage rows commit together or not at all.
    pub fn append_tick(
        &self,
        sample: &Sample,
        storage: &[StorageSample],
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        insert_sample(&tx, sample)?;
        insert_storage_rows(&tx, storage)?;
        tx.commit()?;
        Ok(())
    }

    #[cfg(test)]
    pub fn append_sample(&self, s: &Sample) -> Result<(), StoreError> {
        self.append_tick(s, &[])
    }

    /// All rows go in one transaction.
    #[cfg(test)]
    pub fn append_storage_samples(&self, rows: &[StorageSample]) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        insert_storage_rows(&tx, rows)?;
        tx.commit()?;
        Ok(())
    }

    pub fn query_samples(&self, query: SampleQuery) -> Result<Vec<Sample>, StoreError> {
        let columns = SAMPLE_COLUMNS.join(", ");
        let conn = self.lock()?;
        match query {
            SampleQuery::Since { since_ms } => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {columns} FROM metrics WHERE ts_ms >= ?1 ORDER BY ts_ms ASC, rowid ASC"
                ))?;
                let rows = stmt.query_map(params![since_ms], sample_from_row)?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            }
            SampleQuery::Latest { limit } => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {columns} FROM metrics ORDER BY ts_ms DESC, rowid DESC LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![sql_limit(limit)], sample_from_row)?;
                let mut out = rows.collect::<Result<Vec<_>, _>>()?;
                out.reverse();
                Ok(out)
            }
        }
    }

    pub fn query_storage_samples(
        &self,
        query: &StorageQuery,
    ) -> Result<Vec<StorageSample>, StoreError> {
        let mut clauses = Vec::new();
        let mut args: Vec<Value> = Vec::new();
        if let Some(class) = query.device_type {
            args.push(Value::Text(class.as_str().to_string()));
            clauses.push(format!("device_type = ?{}", args.len()));
        }
        if let Some(fs) = &query.device_fs {
            args.push(Value::Text(fs.clone()));
            clauses.push(format!("device_fs = ?{}", args.len()));
        }
        if let Some(since) = query.since_ms {
            args.push(Value::Integer(since));
            clauses.push(format!("ts_ms >= ?{}", args.len()));
        }

        let mut sql = format!("SELECT {} FROM storage_metrics", STORAGE_COLUMNS.join(", "));
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        match query.limit {
            Some(limit) => {
                args.push(Value::Integer(sql_limit(limit)));
                sql.push_str(&format!(" ORDER BY ts_ms DESC, rowid DESC LIMIT ?{}", args.len()));
            }
            None => sql.push_str(" ORDER BY ts_ms ASC, rowid ASC"),
        }

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), storage_from_row)?;
        let mut out = rows.collect::<Result<Vec<_>, _>>()?;
        if query.limit.is_some() {
            out.reverse();
        }
        Ok(out)
    }

    pub fn export_samples_delimited(
        &self,
        query: SampleQuery,
        delimiter: char,
    ) -> Result<String, StoreError> {
        let rows = self.query_samples(query)?;
        Ok(samples_to_delimited(&rows, delimiter))
    }

    pub fn export_storage_delimited(
        &self,
        query: &StorageQuery,
        delimiter: char,
    ) -> Result<String, StoreError> {
        let rows = self.query_storage_samples(query)?;
        Ok(storage_to_delimited(&rows, delimiter))
    }
}

fn insert_sample(conn: &Connection, s: &Sample) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO metrics (
            ts_ms, cpu_load1, cpu_load5, cpu_load15,
            mem_used_mb, mem_total_mb, mem_swap_used_mb, mem_swap_total_mb,
            mem_free_mb, mem_available_mb, mem_shared_mb, mem_buffers_mb,
            mem_cached_mb, mem_buffcache_mb, mem_used_pct,
            disk_used_percent, disk_size_bytes,
            net_rx_bps, net_tx_bps,
            tx_download_bps, tx_upload_bps, tx_active_torrents
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                  ?18, ?19, ?20, ?21, ?22)",
        params![
            s.ts_ms,
            s.cpu_load1,
            s.cpu_load5,
            s.cpu_load15,
            s.mem_used_mb,
            s.mem_total_mb,
            s.mem_swap_used_mb,
            s.mem_swap_total_mb,
            s.mem_free_mb,
            s.mem_available_mb,
            s.mem_shared_mb,
            s.mem_buffers_mb,
            s.mem_cached_mb,
            s.mem_buffcache_mb,
            s.mem_used_pct,
            s.disk_used_percent,
            s.disk_size_bytes,
            s.net_rx_bps,
            s.net_tx_bps,
            s.tx_download_bps,
            s.tx_upload_bps,
            s.tx_active_torrents,
        ],
    )?;
    Ok(())
}

fn insert_storage_rows(conn: &Connection, rows: &[StorageSample]) -> Result<(), StoreError> {
    if rows.is_empty() {
        return Ok(());
    }
    let mut stmt = conn.prepare(
        "INSERT INTO storage_metrics
            (ts_ms, device_fs, mount, device_type, total_bytes, used_bytes, use_percent)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    for r in rows {
        stmt.execute(params![
            r.ts_ms,
            r.device_fs,
            r.mount,
            r.device_type,
            r.total_bytes,
            r.used_bytes,
            r.use_percent,
        ])?;
    }
    Ok(())
}

/// Creates missing tables and adds later columns. Returns how many columns were added.
fn migrate(conn: &Connection) -> Result<usize, StoreError> {
    conn.execute_batch(BASE_SCHEMA)?;
    let mut added = 0;
    for (column, ty) in METRICS_UPGRADES {
        if add_column(conn, "metrics", column, ty)? {
            added += 1;
        }
    }
    Ok(added)
}

fn add_column(conn: &Connection, table: &str, column: &str, ty: &str) -> Result<bool, StoreError> {
    let sql = format!("ALTER TABLE {table} ADD COLUMN {column} {ty} DEFAULT 0");
    match conn.execute(&sql, []) {
        Ok(_) => {
            debug!(table, column, "column added");
            Ok(true)
        }
        Err(err) if err.to_string().contains("duplicate column name") => Ok(false),
        Err(err) => Err(err.into()),
    }
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn real(row: &Row<'_>, idx: usize) -> rusqlite::Result<f64> {
    Ok(row.get::<_, Option<f64>>(idx)?.unwrap_or(0.0))
}

fn int(row: &Row<'_>, idx: usize) -> rusqlite::Result<i64> {
    Ok(row.get::<_, Option<i64>>(idx)?.unwrap_or(0))
}

fn text(row: &Row<'_>, idx: usize) -> rusqlite::Result<String> {
    Ok(row.get::<_, Option<String>>(idx)?.unwrap_or_default())
}

fn sample_from_row(row: &Row<'_>) -> rusqlite::Result<Sample> {
    Ok(Sample {
        ts_ms: int(row, 0)?,
        cpu_load1: real(row, 1)?,
        cpu_load5: real(row, 2)?,
        cpu_load15: real(row, 3)?,
        mem_used_mb: int(row, 4)?,
        mem_total_mb: int(row, 5)?,
        mem_swap_used_mb: int(row, 6)?,
        mem_swap_total_mb: int(row, 7)?,
        mem_free_mb: int(row, 8)?,
        mem_available_mb: int(row, 9)?,
        mem_shared_mb: int(row, 10)?,
        mem_buffers_mb: int(row, 11)?,
        mem_cached_mb: int(row, 12)?,
        mem_buffcache_mb: int(row, 13)?,
        mem_used_pct: real(row, 14)?,
        disk_used_percent: real(row, 15)?,
        disk_size_bytes: int(row, 16)?,
        net_rx_bps: real(row, 17)?,
        net_tx_bps: real(row, 18)?,
        tx_download_bps: real(row, 19)?,
        tx_upload_bps: real(row, 20)?,
        tx_active_torrents: int(row, 21)?,
    })
}

fn storage_from_row(row: &Row<'_>) -> rusqlite::Result<StorageSample> {
    Ok(StorageSample {
        ts_ms: int(row, 0)?,
        device_fs: text(row, 1)?,
        mount: text(row, 2)?,
        device_type: text(row, 3)?,
        total_bytes: int(row, 4)?,
        used_bytes: int(row, 5)?,
        use_percent: real(row, 6)?,
    })
}

/// Quotes a field holding the delimiter, a quote, CR or LF; inner quotes are doubled.
pub fn escape_field(value: &str, delimiter: char) -> String {
    if value.contains(delimiter) || value.contains(['"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn join_line(fields: &[String], delimiter: char) -> String {
    fields
        .iter()
        .map(|f| escape_field(f, delimiter))
        .collect::<Vec<_>>()
        .join(&delimiter.to_string())
}

fn delimited<const N: usize>(
    header: &[&str; N],
    rows: impl Iterator<Item = Vec<String>>,
    delimiter: char,
) -> String {
    let header: Vec<String> = header.iter().map(|h| h.to_string()).collect();
    let mut out = join_line(&header, delimiter);
    out.push('\n');
    for row in rows {
        out.push_str(&join_line(&row, delimiter));
        out.push('\n');
    }
    out
}

pub fn samples_to_delimited(rows: &[Sample], delimiter: char) -> String {
    delimited(
        &SAMPLE_COLUMNS,
        rows.iter().map(|s| {
            vec![
                s.ts_ms.to_string(),
                s.cpu_load1.to_string(),
                s.cpu_load5.to_string(),
                s.cpu_load15.to_string(),
                s.mem_used_mb.to_string(),
                s.mem_total_mb.to_string(),
                s.mem_swap_used_mb.to_string(),
                s.mem_swap_total_mb.to_string(),
                s.mem_free_mb.to_string(),
                s.mem_available_mb.to_string(),
                s.mem_shared_mb.to_string(),
                s.mem_buffers_mb.to_string(),
                s.mem_cached_mb.to_string(),
                s.mem_buffcache_mb.to_string(),
                s.mem_used_pct.to_string(),
                s.disk_used_percent.to_string(),
                s.disk_size_bytes.to_string(),
                s.net_rx_bps.to_string(),
                s.net_tx_bps.to_string(),
                s.tx_download_bps.to_string(),
                s.tx_upload_bps.to_string(),
                s.tx_active_torrents.to_string(),
            ]
        }),
        delimiter,
    )
}

pub fn storage_to_delimited(rows: &[StorageSample], delimiter: char) -> String {
    delimited(
        &STORAGE_COLUMNS,
        rows.iter().map(|r| {
            vec![
                r.ts_ms.to_string(),
                r.device_fs.clone(),
                r.mount.clone(),
                r.device_type.clone(),
                r.total_bytes.to_string(),
                r.used_bytes.to_string(),
                r.use_percent.to_string(),
            ]
        }),
        delimiter,
    )
}
