use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::OptionalExtension;

use super::{Allocation, AllocationStore, StoreError};
use crate::types::UserAddress;

/// Allocation store backed by a single SQLite file.
#[derive(Clone, Debug)]
pub struct SqliteAllocationStore {
    path: PathBuf,
}

impl SqliteAllocationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }
}

#[async_trait]
impl AllocationStore for SqliteAllocationStore {
    async fn get_allocation(&self, user: &UserAddress) -> Result<Option<Allocation>, StoreError> {
        let path = self.path.clone();
        let user = *user;
        tokio::task::spawn_blocking(move || -> Result<Option<Allocation>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let allocation = conn
                .query_row(
                    &format!("SELECT {COLUMNS} FROM gas_allocations WHERE user=?1"),
                    rusqlite::params![user.to_string()],
                    row_to_allocation,
                )
                .optional()?;
            Ok(allocation)
        })
        .await?
    }

    async fn save_allocation(
        &self,
        allocation: &Allocation,
        expected: Option<&Allocation>,
    ) -> Result<bool, StoreError> {
        let path = self.path.clone();
        let row = AllocationRow::new(allocation)?;
        let expected = revision(expected)?;
        tokio::task::spawn_blocking(move || -> Result<bool, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;

            let changed = match expected {
                None => tx.execute(
                    "INSERT INTO gas_allocations
                        (user, id, amount, used, created_at_ms, expires_at_ms, last_used_at_ms, version)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(user) DO NOTHING",
                    rusqlite::params![
                        row.user,
                        row.id,
                        row.amount,
                        row.used,
                        row.created_at_ms,
                        row.expires_at_ms,
                        row.last_used_at_ms,
                        row.version,
                    ],
                )?,
                Some((expected_id, expected_version)) => tx.execute(
                    "UPDATE gas_allocations
                     SET id=?2, amount=?3, used=?4, created_at_ms=?5, expires_at_ms=?6,
                         last_used_at_ms=?7, version=?8
                     WHERE user=?1 AND id=?9 AND version=?10",
                    rusqlite::params![
                        row.user,
                        row.id,
                        row.amount,
                        row.used,
                        row.created_at_ms,
                        row.expires_at_ms,
                        row.last_used_at_ms,
                        row.version,
                        expected_id,
                        expected_version,
                    ],
                )?,
            };

            tx.commit()?;
            Ok(changed == 1)
        })
        .await?
    }

    async fn delete_allocation(
        &self,
        user: &UserAddress,
        expected: Option<&Allocation>,
    ) -> Result<bool, StoreError> {
        let path = self.path.clone();
        let user = user.to_string();
        let expected = revision(expected)?;
        tokio::task::spawn_blocking(move || -> Result<bool, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let deleted = match expected {
                None => conn.execute(
                    "DELETE FROM gas_allocations WHERE user=?1",
                    rusqlite::params![user],
                )?,
                Some((expected_id, expected_version)) => conn.execute(
                    "DELETE FROM gas_allocations WHERE user=?1 AND id=?2 AND version=?3",
                    rusqlite::params![user, expected_id, expected_version],
                )?,
            };
            Ok(deleted > 0)
        })
        .await?
    }

    async fn list_allocations(&self) -> Result<Vec<Allocation>, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Allocation>, StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM gas_allocations ORDER BY user"
            ))?;
            let rows = stmt.query_map([], row_to_allocation)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await?
    }
}

/// An allocation with every integer already checked to fit SQLite's signed 64-bit column.
struct AllocationRow {
    user: String,
    id: String,
    amount: i64,
    used: i64,
    created_at_ms: i64,
    expires_at_ms: i64,
    last_used_at_ms: i64,
    version: i64,
}

impl AllocationRow {
    fn new(allocation: &Allocation) -> Result<Self, StoreError> {
        Ok(Self {
            user: allocation.user.to_string(),
            id: allocation.id.clone(),
            amount: to_i64("amount", allocation.amount)?,
            used: to_i64("used", allocation.used)?,
            created_at_ms: to_i64("created_at_ms", allocation.created_at_ms)?,
            expires_at_ms: to_i64("expires_at_ms", allocation.expires_at_ms)?,
            last_used_at_ms: to_i64("last_used_at_ms", allocation.last_used_at_ms)?,
            version: to_i64("version", allocation.version)?,
        })
    }
}

const COLUMNS: &str =
    "user, id, amount, used, created_at_ms, expires_at_ms, last_used_at_ms, version";

fn row_to_allocation(row: &rusqlite::Row<'_>) -> Result<Allocation, rusqlite::Error> {
    let raw_user: String = row.get(0)?;
    let user = raw_user.parse::<UserAddress>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
    })?;
    Ok(Allocation {
        user,
        id: row.get(1)?,
        amount: i64_to_u64(row.get(2)?),
        used: i64_to_u64(row.get(3)?),
        created_at_ms: i64_to_u64(row.get(4)?),
        expires_at_ms: i64_to_u64(row.get(5)?),
        last_used_at_ms: i64_to_u64(row.get(6)?),
        version: i64_to_u64(row.get(7)?),
    })
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS gas_allocations (
            user TEXT PRIMARY KEY NOT NULL,
            id TEXT NOT NULL,
            amount INTEGER NOT NULL,
            used INTEGER NOT NULL DEFAULT 0,
            created_at_ms INTEGER NOT NULL,
            expires_at_ms INTEGER NOT NULL,
            last_used_at_ms INTEGER NOT NULL,
            version INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_gas_allocations_expires_at
            ON gas_allocations(expires_at_ms);",
    )
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn revision(expected: Option<&Allocation>) -> Result<Option<(String, i64)>, StoreError> {
    expected
        .map(|expected| Ok((expected.id.clone(), to_i64("version", expected.version)?)))
        .transpose()
}

fn to_i64(column: &'static str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::OutOfRange { column, value })
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}
