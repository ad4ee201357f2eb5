use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use civpds_types::{Cid, Tid, Uid};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use crate::error::{CarStoreError, CarStoreResult};

/// Block refs inserted per SQL statement.
pub const REF_BATCH_SIZE: usize = 2000;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS car_shards (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    actor_id INTEGER NOT NULL,
    seq INTEGER NOT NULL,
    rev TEXT NOT NULL,
    root BLOB NOT NULL,
    path TEXT NOT NULL,
    data_start INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(actor_id, seq)
);
CREATE INDEX IF NOT EXISTS car_shards_actor_rev ON car_shards(actor_id, rev);
CREATE TABLE IF NOT EXISTS block_refs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cid BLOB NOT NULL,
    shard_id INTEGER NOT NULL REFERENCES car_shards(id) ON DELETE CASCADE,
    actor_id INTEGER NOT NULL,
    byte_offset INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS block_refs_cid_actor ON block_refs(cid, actor_id);
CREATE INDEX IF NOT EXISTS block_refs_shard ON block_refs(shard_id);
"#;

/// A persisted shard row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub id: i64,
    pub actor: Uid,
    pub seq: i64,
    pub rev: Tid,
    pub root: Cid,
    pub path: String,
    pub data_start: u64,
    pub created_at: String,
}

/// A shard about to be inserted.
#[derive(Debug, Clone)]
pub struct NewShard {
    pub actor: Uid,
    pub seq: i64,
    pub rev: Tid,
    pub root: Cid,
    pub path: String,
    pub data_start: u64,
}

/// A block's position inside a shard being inserted.
#[derive(Debug, Clone, Copy)]
pub struct NewBlockRef {
    pub cid: Cid,
    pub byte_offset: u64,
}

/// A resolved block location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRef {
    pub shard_id: i64,
    pub path: String,
    pub byte_offset: u64,
    /// Actor whose shard holds the block.
    pub owner: Uid,
}

/// SQLite index of shards and block refs.
///
/// The connection lives behind a mutex and every query runs on the blocking
/// pool, so callers never stall the async runtime on disk I/O.
#[derive(Clone)]
pub struct ShardIndex {
    conn: Arc<Mutex<Connection>>,
}

impl ShardIndex {
    /// Open (creating if needed) an index database at `path`.
    pub fn open(path: impl AsRef<Path>) -> CarStoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    /// Open a private in-memory index.
    pub fn open_in_memory() -> CarStoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> CarStoreResult<Self> {
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> CarStoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> CarStoreResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().expect("lock poisoned");
            f(&mut conn)
        })
        .await
        .map_err(|e| CarStoreError::Task(e.to_string()))?
    }

    /// Cheap liveness check.
    pub async fn ping(&self) -> CarStoreResult<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .await
    }

    /// Insert a shard and all its block refs in one transaction.
    pub async fn put_shard_and_refs(
        &self,
        shard: NewShard,
        refs: Vec<NewBlockRef>,
    ) -> CarStoreResult<Shard> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let row = insert_shard(&tx, &shard)?;
            insert_refs(&tx, row.id, shard.actor, &refs)?;
            tx.commit()?;
            debug!(actor = %shard.actor, seq = shard.seq, refs = refs.len(), "indexed shard");
            Ok(row)
        })
        .await
    }

    /// Replace every shard of `actor` with `shard`, atomically.
    ///
    /// Returns the object paths of the removed shards.
    pub async fn replace_actor_shards(
        &self,
        shard: NewShard,
        refs: Vec<NewBlockRef>,
    ) -> CarStoreResult<(Shard, Vec<String>)> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let old_paths = delete_actor_rows(&tx, shard.actor)?;
            let row = insert_shard(&tx, &shard)?;
            insert_refs(&tx, row.id, shard.actor, &refs)?;
            tx.commit()?;
            Ok((row, old_paths))
        })
        .await
    }

    /// Delete every shard and block ref of `actor`, returning the removed
    /// object paths.
    pub async fn delete_actor(&self, actor: Uid) -> CarStoreResult<Vec<String>> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let paths = delete_actor_rows(&tx, actor)?;
            tx.commit()?;
            Ok(paths)
        })
        .await
    }

    /// Most recent shard of `actor`.
    pub async fn last_shard(&self, actor: Uid) -> CarStoreResult<Option<Shard>> {
        self.with_conn(move |conn| {
            let shard = conn
                .query_row(
                    &format!("{SHARD_SELECT} WHERE actor_id = ?1 ORDER BY seq DESC LIMIT 1"),
                    params![actor.get() as i64],
                    row_to_shard,
                )
                .optional()?;
            shard.transpose()
        })
        .await
    }

    /// Shards of `actor` with `rev >= since`, oldest first. `None` selects all.
    pub async fn shards_since(&self, actor: Uid, since: Option<Tid>) -> CarStoreResult<Vec<Shard>> {
        self.with_conn(move |conn| {
            let since = since.map(String::from).unwrap_or_default();
            let mut stmt = conn.prepare(&format!(
                "{SHARD_SELECT} WHERE actor_id = ?1 AND rev >= ?2 ORDER BY seq ASC"
            ))?;
            let rows = stmt
                .query_map(params![actor.get() as i64, since], row_to_shard)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().collect()
        })
        .await
    }

    /// Number of shards held by `actor`.
    pub async fn shard_count(&self, actor: Uid) -> CarStoreResult<i64> {
        self.with_conn(move |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM car_shards WHERE actor_id = ?1",
                params![actor.get() as i64],
                |row| row.get(0),
            )?)
        })
        .await
    }

    /// Actors holding more than `min_shards` shards.
    pub async fn actors_over(&self, min_shards: i64) -> CarStoreResult<Vec<Uid>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT actor_id FROM car_shards GROUP BY actor_id HAVING COUNT(*) > ?1 ORDER BY actor_id",
            )?;
            let ids = stmt
                .query_map(params![min_shards], |row| row.get::<_, i64>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids.into_iter().map(|id| Uid::new(id as u64)).collect())
        })
        .await
    }

    /// Resolve the location of `cid`, preferring a copy owned by `actor`.
    pub async fn lookup_block_ref(&self, cid: Cid, actor: Uid) -> CarStoreResult<Option<BlockRef>> {
        self.with_conn(move |conn| {
            let found = conn
                .query_row(
                    "SELECT s.id, s.path, b.byte_offset, b.actor_id
                     FROM block_refs b JOIN car_shards s ON s.id = b.shard_id
                     WHERE b.cid = ?1
                     ORDER BY (b.actor_id = ?2) DESC
                     LIMIT 1",
                    params![cid.to_bytes(), actor.get() as i64],
                    |row| {
                        Ok(BlockRef {
                            shard_id: row.get(0)?,
                            path: row.get(1)?,
                            byte_offset: row.get::<_, i64>(2)? as u64,
                            owner: Uid::new(row.get::<_, i64>(3)? as u64),
                        })
                    },
                )
                .optional()?;
            Ok(found)
        })
        .await
    }

    /// Whether `actor` itself holds a ref to `cid`. Copies owned by other
    /// actors do not count.
    pub async fn owns_block(&self, cid: Cid, actor: Uid) -> CarStoreResult<bool> {
        self.with_conn(move |conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM block_refs WHERE cid = ?1 AND actor_id = ?2",
                    params![cid.to_bytes(), actor.get() as i64],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    /// Number of block refs held by `actor`.
    pub async fn block_ref_count(&self, actor: Uid) -> CarStoreResult<i64> {
        self.with_conn(move |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM block_refs WHERE actor_id = ?1",
                params![actor.get() as i64],
                |row| row.get(0),
            )?)
        })
        .await
    }
}

const SHARD_SELECT: &str =
    "SELECT id, actor_id, seq, rev, root, path, data_start, created_at FROM car_shards";

fn row_to_shard(row: &rusqlite::Row<'_>) -> rusqlite::Result<CarStoreResult<Shard>> {
    let rev: String = row.get(3)?;
    let root: Vec<u8> = row.get(4)?;
    let parsed = (|| -> CarStoreResult<Shard> {
        Ok(Shard {
            id: row.get(0)?,
            actor: Uid::new(row.get::<_, i64>(1)? as u64),
            seq: row.get(2)?,
            rev: Tid::parse(&rev)?,
            root: Cid::try_from(root.as_slice()).map_err(|e| CarStoreError::Corrupt {
                path: String::new(),
                reason: format!("bad root cid: {e}"),
            })?,
            path: row.get(5)?,
            data_start: row.get::<_, i64>(6)? as u64,
            created_at: row.get(7)?,
        })
    })();
    Ok(parsed)
}

fn insert_shard(tx: &rusqlite::Transaction<'_>, shard: &NewShard) -> CarStoreResult<Shard> {
    let created_at = chrono::Utc::now().to_rfc3339();
    tx.execute(
        "INSERT INTO car_shards (actor_id, seq, rev, root, path, data_start, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            shard.actor.get() as i64,
            shard.seq,
            shard.rev.as_str(),
            shard.root.to_bytes(),
            shard.path,
            shard.data_start as i64,
            created_at,
        ],
    )?;
    Ok(Shard {
        id: tx.last_insert_rowid(),
        actor: shard.actor,
        seq: shard.seq,
        rev: shard.rev.clone(),
        root: shard.root,
        path: shard.path.clone(),
        data_start: shard.data_start,
        created_at,
    })
}

fn insert_refs(
    tx: &rusqlite::Transaction<'_>,
    shard_id: i64,
    actor: Uid,
    refs: &[NewBlockRef],
) -> CarStoreResult<()> {
    for batch in refs.chunks(REF_BATCH_SIZE) {
        let placeholders = vec!["(?, ?, ?, ?)"; batch.len()].join(", ");
        let sql = format!(
            "INSERT OR IGNORE INTO block_refs (cid, shard_id, actor_id, byte_offset) VALUES {placeholders}"
        );
        let mut values: Vec<rusqlite::types::Value> = Vec::with_capacity(batch.len() * 4);
        for r in batch {
            values.push(r.cid.to_bytes().into());
            values.push(shard_id.into());
            values.push((actor.get() as i64).into());
            values.push((r.byte_offset as i64).into());
        }
        tx.execute(&sql, params_from_iter(values))?;
    }
    Ok(())
}

fn delete_actor_rows(tx: &rusqlite::Transaction<'_>, actor: Uid) -> CarStoreResult<Vec<String>> {
    let paths = {
        let mut stmt = tx.prepare("SELECT path FROM car_shards WHERE actor_id = ?1 ORDER BY seq")?;
        let rows = stmt
            .query_map(params![actor.get() as i64], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };
    tx.execute(
        "DELETE FROM block_refs WHERE actor_id = ?1",
        params![actor.get() as i64],
    )?;
    tx.execute(
        "DELETE FROM car_shards WHERE actor_id = ?1",
        params![actor.get() as i64],
    )?;
    Ok(paths)
}
