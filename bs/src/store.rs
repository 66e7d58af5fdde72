//! Core Store implementation over SQLite
//!
//! One database file per store directory. Records live in a single
//! `records` table keyed by (collection, id); indexed fields are mirrored
//! into `record_index` so filtered queries stay off the JSON bodies.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, params};
use tracing::{debug, info};

use crate::{Filter, FilterOp, IndexValue, Record, StoreError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    collection  TEXT NOT NULL,
    id          TEXT NOT NULL,
    body        TEXT NOT NULL,
    updated_at  INTEGER NOT NULL,
    PRIMARY KEY (collection, id)
);
CREATE TABLE IF NOT EXISTS record_index (
    collection  TEXT NOT NULL,
    id          TEXT NOT NULL,
    field       TEXT NOT NULL,
    value       TEXT NOT NULL,
    value_int   INTEGER,
    PRIMARY KEY (collection, id, field)
);
CREATE INDEX IF NOT EXISTS idx_record_index_lookup
    ON record_index (collection, field, value);
CREATE INDEX IF NOT EXISTS idx_records_updated
    ON records (collection, updated_at);
";

/// Per-collection record count, for inspection tooling
#[derive(Debug, Clone)]
pub struct CollectionStats {
    pub name: String,
    pub count: usize,
}

/// The record store
pub struct Store {
    conn: Connection,
    #[allow(dead_code)]
    base_path: PathBuf,
}

impl Store {
    /// Open or create a store at the given directory
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let base_path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path)?;

        let db_path = base_path.join("boardstore.db");
        let conn = Connection::open(&db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;

        debug!(path = %db_path.display(), "Opened store");
        Ok(Self { conn, base_path })
    }

    /// In-memory store, for tests
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            base_path: PathBuf::new(),
        })
    }

    /// Insert a new record; fails with `Duplicate` if the id exists
    pub fn insert<T: Record>(&mut self, record: &T) -> Result<(), StoreError> {
        self.insert_into(T::collection_name(), record)
    }

    /// Insert into an explicit collection (used for partitioned logs)
    pub fn insert_into<T: Record>(&mut self, collection: &str, record: &T) -> Result<(), StoreError> {
        let body = serde_json::to_string(record)?;
        let fields = record.indexed_fields();
        let tx = self.conn.transaction()?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM records WHERE collection = ?1 AND id = ?2)",
            params![collection, record.id()],
            |row| row.get(0),
        )?;
        if exists {
            return Err(StoreError::Duplicate {
                collection: collection.to_string(),
                id: record.id().to_string(),
            });
        }

        tx.execute(
            "INSERT INTO records (collection, id, body, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![collection, record.id(), body, record.updated_at()],
        )?;
        for (field, value) in &fields {
            tx.execute(
                "INSERT INTO record_index (collection, id, field, value, value_int) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![collection, record.id(), field, value.as_text(), value.as_int()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Insert or replace a record, refreshing its index rows
    pub fn upsert<T: Record>(&mut self, record: &T) -> Result<(), StoreError> {
        self.upsert_into(T::collection_name(), record)
    }

    /// Upsert into an explicit collection
    pub fn upsert_into<T: Record>(&mut self, collection: &str, record: &T) -> Result<(), StoreError> {
        let body = serde_json::to_string(record)?;
        let fields = record.indexed_fields();
        let tx = self.conn.transaction()?;

        tx.execute(
            "INSERT INTO records (collection, id, body, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (collection, id) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
            params![collection, record.id(), body, record.updated_at()],
        )?;
        tx.execute(
            "DELETE FROM record_index WHERE collection = ?1 AND id = ?2",
            params![collection, record.id()],
        )?;
        for (field, value) in &fields {
            tx.execute(
                "INSERT INTO record_index (collection, id, field, value, value_int) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![collection, record.id(), field, value.as_text(), value.as_int()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Fetch a record by id
    pub fn get<T: Record>(&self, id: &str) -> Result<Option<T>, StoreError> {
        self.get_from(T::collection_name(), id)
    }

    /// Fetch from an explicit collection
    pub fn get_from<T: Record>(&self, collection: &str, id: &str) -> Result<Option<T>, StoreError> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM records WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        match body {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Delete a record; returns whether it existed
    pub fn delete<T: Record>(&mut self, id: &str) -> Result<bool, StoreError> {
        let collection = T::collection_name();
        let tx = self.conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
            params![collection, id],
        )?;
        tx.execute(
            "DELETE FROM record_index WHERE collection = ?1 AND id = ?2",
            params![collection, id],
        )?;
        tx.commit()?;
        Ok(removed > 0)
    }

    /// List records matching all filters, ordered by update time
    pub fn list<T: Record>(&self, filters: &[Filter]) -> Result<Vec<T>, StoreError> {
        self.list_in(T::collection_name(), filters)
    }

    /// List from an explicit collection
    pub fn list_in<T: Record>(&self, collection: &str, filters: &[Filter]) -> Result<Vec<T>, StoreError> {
        let mut sql = String::from("SELECT r.body FROM records r WHERE r.collection = ?1");
        let mut bound: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(collection.to_string())];

        for filter in filters {
            let field_slot = bound.len() + 1;
            let value_slot = bound.len() + 2;
            let clause = filter_clause(filter, field_slot, value_slot);
            sql.push_str(&clause);
            bound.push(Box::new(filter.field.clone()));
            match (&filter.op, &filter.value) {
                (FilterOp::Gt | FilterOp::Lt, IndexValue::Int(i)) => bound.push(Box::new(*i)),
                (_, value) => bound.push(Box::new(value.as_text())),
            }
        }
        sql.push_str(" ORDER BY r.updated_at ASC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(bound.iter().map(|b| b.as_ref() as &dyn rusqlite::ToSql)),
            |row| row.get::<_, String>(0),
        )?;

        let mut records = Vec::new();
        for row in rows {
            records.push(serde_json::from_str(&row?)?);
        }
        Ok(records)
    }

    /// Cursor-style scan: records updated after `since_ms`, oldest first
    pub fn scan_since<T: Record>(&self, since_ms: i64, limit: usize) -> Result<Vec<T>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT body FROM records WHERE collection = ?1 AND updated_at > ?2
             ORDER BY updated_at ASC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![T::collection_name(), since_ms, limit as i64], |row| {
            row.get::<_, String>(0)
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(serde_json::from_str(&row?)?);
        }
        Ok(records)
    }

    /// Number of records in a collection
    pub fn count<T: Record>(&self) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM records WHERE collection = ?1",
            params![T::collection_name()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Rebuild the secondary index for every record of a collection
    pub fn rebuild_indexes<T: Record>(&mut self) -> Result<usize, StoreError> {
        let records: Vec<T> = self.list(&[])?;
        let collection = T::collection_name();
        let tx = self.conn.transaction()?;

        tx.execute("DELETE FROM record_index WHERE collection = ?1", params![collection])?;
        for record in &records {
            for (field, value) in record.indexed_fields() {
                tx.execute(
                    "INSERT INTO record_index (collection, id, field, value, value_int) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![collection, record.id(), field, value.as_text(), value.as_int()],
                )?;
            }
        }
        tx.commit()?;

        info!(collection, count = records.len(), "Rebuilt indexes");
        Ok(records.len())
    }

    /// Drop whole partitions of `base` older than the partition containing `cutoff_ms`
    pub fn drop_partitions_before(&mut self, base: &str, cutoff_ms: i64) -> Result<usize, StoreError> {
        let cutoff = crate::partitioned_collection(base, cutoff_ms);
        let prefix = format!("{}_", base);
        let tx = self.conn.transaction()?;

        // Partition names are zero-padded, so lexical compare is chronological
        let removed = tx.execute(
            "DELETE FROM records WHERE collection LIKE ?1 || '%' AND collection < ?2",
            params![prefix, cutoff],
        )?;
        tx.execute(
            "DELETE FROM record_index WHERE collection LIKE ?1 || '%' AND collection < ?2",
            params![prefix, cutoff],
        )?;
        tx.commit()?;

        if removed > 0 {
            info!(base, removed, "Dropped expired partitions");
        }
        Ok(removed)
    }

    /// All collections with their record counts
    pub fn collections(&self) -> Result<Vec<CollectionStats>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT collection, COUNT(*) FROM records GROUP BY collection ORDER BY collection")?;
        let rows = stmt.query_map([], |row| {
            Ok(CollectionStats {
                name: row.get(0)?,
                count: row.get::<_, i64>(1)? as usize,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    /// Raw JSON body of a record, for inspection tooling
    pub fn raw_get(&self, collection: &str, id: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let body: Option<String> = self
            .conn
            .query_row(
                "SELECT body FROM records WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        match body {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Raw JSON bodies of a collection, oldest first
    pub fn raw_list(&self, collection: &str, limit: usize) -> Result<Vec<serde_json::Value>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT body FROM records WHERE collection = ?1 ORDER BY updated_at ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![collection, limit as i64], |row| row.get::<_, String>(0))?;

        let mut values = Vec::new();
        for row in rows {
            values.push(serde_json::from_str(&row?)?);
        }
        Ok(values)
    }
}

fn filter_clause(filter: &Filter, field_slot: usize, value_slot: usize) -> String {
    let int_compare = matches!(
        (&filter.op, &filter.value),
        (FilterOp::Gt | FilterOp::Lt, IndexValue::Int(_))
    );
    let column = if int_compare { "i.value_int" } else { "i.value" };
    let op = match filter.op {
        FilterOp::Eq => "=",
        FilterOp::Ne => "<>",
        FilterOp::Gt => ">",
        FilterOp::Lt => "<",
    };
    format!(
        " AND EXISTS (SELECT 1 FROM record_index i WHERE i.collection = r.collection \
         AND i.id = r.id AND i.field = ?{field_slot} AND {column} {op} ?{value_slot})"
    )
}
