//! SQLite storage implementation

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{Connection, OptionalExtension, ToSql, params};
use crate::oid::{Entry, Kind, Oid};
use crate::{Error, Result};
use super::adapter::{Literal, StorageAdapter, StoreStats};
use super::schema;

const META_NEXT_OID: &str = "next_oid";
const META_DBID: &str = "dbid";

/// SQLite-backed storage for object graphs
pub struct SqliteStorage {
    conn: Connection,
    dbid: String,
    next_oid: i64,
    ssid: Option<i64>,
    in_transaction: bool,
}

impl SqliteStorage {
    /// Open a database file (creates if doesn't exist)
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let default_dbid = path
            .canonicalize()
            .unwrap_or_else(|_| path.to_path_buf())
            .display()
            .to_string();
        Self::with_connection(conn, default_dbid)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, ":memory:".to_string())
    }

    fn with_connection(conn: Connection, default_dbid: String) -> Result<Self> {
        let mut store = Self {
            conn,
            dbid: default_dbid,
            next_oid: Oid::FIRST.get(),
            ssid: None,
            in_transaction: false,
        };
        store.initialize_schema()?;
        store.fetch_metadata()?;
        Ok(store)
    }

    /// Initialize the database schema
    fn initialize_schema(&self) -> Result<()> {
        for stmt in schema::all_schema_statements() {
            self.conn.execute(stmt, [])?;
        }
        Ok(())
    }

    fn fetch_metadata(&mut self) -> Result<()> {
        if let Some(next) = self.get_meta::<i64>(META_NEXT_OID)? {
            self.next_oid = next.max(Oid::FIRST.get());
        }
        if let Some(dbid) = self.get_meta::<String>(META_DBID)? {
            self.dbid = dbid;
        }
        Ok(())
    }

    fn get_meta<T: rusqlite::types::FromSql>(&self, attr: &str) -> Result<Option<T>> {
        self.conn
            .query_row(
                "SELECT value FROM odb_metadata WHERE attr = ?1",
                [attr],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    fn set_meta(&self, attr: &str, value: &dyn ToSql) -> Result<()> {
        self.conn.execute(
            "REPLACE INTO odb_metadata (attr, value) VALUES (?1, ?2)",
            params![attr, value],
        )?;
        Ok(())
    }

    /// Identifier of this store, persisted in metadata
    pub fn dbid(&self) -> &str {
        &self.dbid
    }

    pub fn set_dbid(&mut self, dbid: &str) -> Result<()> {
        self.begin_write()?;
        self.set_meta(META_DBID, &dbid)?;
        self.dbid = dbid.to_string();
        Ok(())
    }

    /// Session id of this writer, if it has written anything
    pub fn ssid(&self) -> Option<i64> {
        self.ssid
    }

    /// Start the write transaction and register the session on first write
    fn begin_write(&mut self) -> Result<()> {
        if self.in_transaction {
            return Ok(());
        }
        self.conn.execute("BEGIN DEFERRED", [])?;
        self.in_transaction = true;

        if self.ssid.is_none() {
            let token = session_token(&self.dbid);
            self.conn.execute(
                "INSERT INTO odb_sessions (ssid, session, next_oid) VALUES (NULL, ?1, ?2)",
                params![token, self.next_oid],
            )?;
            let ssid = self.conn.last_insert_rowid();
            tracing::debug!("Opened writable session {} on {}", ssid, self.dbid);
            self.ssid = Some(ssid);
        }
        Ok(())
    }

    fn count(&self, sql: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn entries(&self, sql: &str, oid: Oid) -> Result<Vec<Entry>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map([oid.get()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(to_entry).collect()
    }
}

fn to_entry((oid, kind, otype): (i64, String, String)) -> Result<Entry> {
    Ok(Entry::new(Oid(oid), kind.parse::<Kind>()?, otype))
}

fn session_token(dbid: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut hasher = blake3::Hasher::new();
    hasher.update(dbid.as_bytes());
    hasher.update(&nanos.to_le_bytes());
    hasher.update(&std::process::id().to_le_bytes());
    hasher.finalize().to_hex()[..32].to_string()
}

impl ToSql for Literal {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Literal::Null => ToSqlOutput::Owned(SqlValue::Null),
            Literal::Integer(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Literal::Real(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Literal::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Literal::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl From<SqlValue> for Literal {
    fn from(value: SqlValue) -> Self {
        match value {
            SqlValue::Null => Literal::Null,
            SqlValue::Integer(i) => Literal::Integer(i),
            SqlValue::Real(f) => Literal::Real(f),
            SqlValue::Text(s) => Literal::Text(s),
            SqlValue::Blob(b) => Literal::Blob(b),
        }
    }
}

impl StorageAdapter for SqliteStorage {
    // ========== Shape Operations ==========

    fn allocate_id(&mut self) -> Result<Oid> {
        self.begin_write()?;
        let oid = Oid(self.next_oid);
        self.next_oid += 1;
        Ok(oid)
    }

    fn set_shape(&mut self, oid: Oid, kind: Kind, otype: &str) -> Result<()> {
        self.begin_write()?;
        self.conn.execute(
            "INSERT INTO oid_lookup (oid, stg_kind, otype, ssid) VALUES (?1, ?2, ?3, ?4)",
            params![oid.get(), kind.as_str(), otype, self.ssid],
        )?;
        Ok(())
    }

    fn get_shape(&self, oid: Oid) -> Result<Entry> {
        let row = self
            .conn
            .query_row(
                "SELECT oid, stg_kind, otype FROM oid_lookup WHERE oid = ?1",
                [oid.get()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        match row {
            Some(row) => to_entry(row),
            None => Err(Error::NotFound(oid)),
        }
    }

    fn contains(&self, oid: Oid) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM oid_lookup WHERE oid = ?1",
                [oid.get()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // ========== Literal Operations ==========

    fn get_literal(&self, oid: Oid) -> Result<Literal> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM literals WHERE oid = ?1",
                [oid.get()],
                |row| row.get::<_, SqlValue>(0),
            )
            .optional()?;
        value.map(Literal::from).ok_or(Error::NotFound(oid))
    }

    fn find_literal(&self, value: &Literal, hash: i64, value_type: &str) -> Result<Option<Oid>> {
        self.conn
            .query_row(
                "SELECT oid FROM literals WHERE value IS ?1 AND value_hash = ?2 AND value_type = ?3 LIMIT 1",
                params![value, hash, value_type],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map(|found| found.map(Oid))
            .map_err(Into::into)
    }

    fn put_literal(&mut self, oid: Oid, value: &Literal, hash: i64, value_type: &str) -> Result<()> {
        self.begin_write()?;
        self.conn.execute(
            "INSERT INTO literals (oid, value, value_hash, value_type, ssid) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![oid.get(), value, hash, value_type, self.ssid],
        )?;
        Ok(())
    }

    // ========== Edge Operations ==========

    fn get_ordered(&self, oid: Oid) -> Result<Vec<Entry>> {
        self.entries(
            r#"
            SELECT v.oid, v.stg_kind, v.otype
            FROM mappings AS m
            JOIN oid_lookup AS v ON v.oid = m.oid_value
            WHERE m.oid_host = ?1 AND m.oid_key IS NULL
            ORDER BY m.tidx
            "#,
            oid,
        )
    }

    fn set_ordered(&mut self, oid: Oid, values: &[Oid]) -> Result<()> {
        self.begin_write()?;
        self.conn
            .execute("DELETE FROM mappings WHERE oid_host = ?1", [oid.get()])?;
        let mut stmt = self.conn.prepare(
            "INSERT INTO mappings (tidx, oid_host, oid_key, oid_value, ssid) VALUES (NULL, ?1, NULL, ?2, ?3)",
        )?;
        for value in values {
            stmt.execute(params![oid.get(), value.get(), self.ssid])?;
        }
        Ok(())
    }

    fn get_mapping(&self, oid: Oid) -> Result<Vec<(Entry, Entry)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT k.oid, k.stg_kind, k.otype, v.oid, v.stg_kind, v.otype
            FROM mappings AS m
            JOIN oid_lookup AS k ON k.oid = m.oid_key
            JOIN oid_lookup AS v ON v.oid = m.oid_value
            WHERE m.oid_host = ?1
            ORDER BY m.tidx
            "#,
        )?;
        let rows = stmt
            .query_map([oid.get()], |row| {
                Ok((
                    (row.get(0)?, row.get(1)?, row.get(2)?),
                    (row.get(3)?, row.get(4)?, row.get(5)?),
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter()
            .map(|(key, value)| Ok((to_entry(key)?, to_entry(value)?)))
            .collect()
    }

    fn set_mapping(&mut self, oid: Oid, pairs: &[(Oid, Oid)]) -> Result<()> {
        self.begin_write()?;
        self.conn
            .execute("DELETE FROM mappings WHERE oid_host = ?1", [oid.get()])?;
        let mut stmt = self.conn.prepare(
            "INSERT INTO mappings (tidx, oid_host, oid_key, oid_value, ssid) VALUES (NULL, ?1, ?2, ?3, ?4)",
        )?;
        for (key, value) in pairs {
            stmt.execute(params![oid.get(), key.get(), value.get(), self.ssid])?;
        }
        Ok(())
    }

    fn get_weakref(&self, oid: Oid) -> Result<Option<Entry>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT v.oid, v.stg_kind, v.otype
                FROM weakrefs AS w
                JOIN oid_lookup AS v ON v.oid = w.oid_ref
                WHERE w.oid_host = ?1
                "#,
                [oid.get()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        row.map(to_entry).transpose()
    }

    fn set_weakref(&mut self, oid: Oid, target: Option<Oid>) -> Result<()> {
        self.begin_write()?;
        self.conn.execute(
            "INSERT INTO weakrefs (oid_host, oid_ref, ssid) VALUES (?1, ?2, ?3)",
            params![oid.get(), target.map(Oid::get), self.ssid],
        )?;
        Ok(())
    }

    fn get_external(&self, oid: Oid) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT url FROM externals WHERE oid = ?1",
                [oid.get()],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    fn set_external(&mut self, oid: Oid, url: &str) -> Result<()> {
        self.begin_write()?;
        self.conn.execute(
            "INSERT INTO externals (oid, url, ssid) VALUES (?1, ?2, ?3)",
            params![oid.get(), url, self.ssid],
        )?;
        Ok(())
    }

    // ========== Root Operations ==========

    fn get_root(&self, name: &str) -> Result<Option<Entry>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT v.oid, v.stg_kind, v.otype
                FROM exports AS e
                JOIN oid_lookup AS v ON v.oid = e.oid_ref
                WHERE e.urlpath = ?1
                "#,
                [name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        row.map(to_entry).transpose()
    }

    fn set_root(&mut self, name: &str, oid: Oid) -> Result<()> {
        self.begin_write()?;
        self.conn.execute(
            "INSERT INTO exports (urlpath, oid_ref, ssid) VALUES (?1, ?2, ?3)",
            params![name, oid.get(), self.ssid],
        )?;
        // Keep an in-progress mark phase aware of the new root
        self.conn.execute(
            "INSERT OR IGNORE INTO oid_graph_members (oid) VALUES (?1)",
            [oid.get()],
        )?;
        Ok(())
    }

    fn remove_root(&mut self, name: &str) -> Result<bool> {
        self.begin_write()?;
        let removed = self
            .conn
            .execute("DELETE FROM exports WHERE urlpath = ?1", [name])?;
        Ok(removed > 0)
    }

    fn all_roots(&self) -> Result<Vec<(String, Oid)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT urlpath, oid_ref FROM exports ORDER BY urlpath")?;
        let roots = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, Oid(row.get(1)?))))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(roots)
    }

    fn root_count(&self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM exports")
    }

    // ========== Lifecycle ==========

    fn remove_id(&mut self, oid: Oid) -> Result<bool> {
        self.begin_write()?;
        let id = oid.get();
        let removed = self
            .conn
            .execute("DELETE FROM oid_lookup WHERE oid = ?1", [id])?;
        self.conn.execute("DELETE FROM literals WHERE oid = ?1", [id])?;
        self.conn.execute("DELETE FROM weakrefs WHERE oid_host = ?1", [id])?;
        self.conn.execute("DELETE FROM mappings WHERE oid_host = ?1", [id])?;
        self.conn.execute("DELETE FROM externals WHERE oid = ?1", [id])?;
        self.conn.execute("DELETE FROM exports WHERE oid_ref = ?1", [id])?;
        Ok(removed > 0)
    }

    fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.set_meta(META_NEXT_OID, &self.next_oid)?;
        if self.get_meta::<String>(META_DBID)?.is_none() {
            self.set_meta(META_DBID, &self.dbid)?;
        }
        self.conn.execute("COMMIT", [])?;
        self.in_transaction = false;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.in_transaction {
            tracing::debug!("Discarding uncommitted writes on {}", self.dbid);
            self.conn.execute("ROLLBACK", [])?;
            self.in_transaction = false;
        }
        Ok(())
    }

    // ========== Garbage Collection ==========

    fn mark_reset(&mut self) -> Result<usize> {
        self.conn.execute("DELETE FROM oid_graph_members", [])?;
        let seeded = self.conn.execute(
            "INSERT OR IGNORE INTO oid_graph_members (oid) SELECT oid_ref FROM exports",
            [],
        )?;
        Ok(seeded)
    }

    fn mark_step(&mut self) -> Result<usize> {
        let keys = self.conn.execute(
            r#"
            INSERT OR IGNORE INTO oid_graph_members (oid)
                SELECT oid_key FROM mappings
                WHERE oid_key IS NOT NULL
                  AND oid_host IN (SELECT oid FROM oid_graph_members)
            "#,
            [],
        )?;
        let values = self.conn.execute(
            r#"
            INSERT OR IGNORE INTO oid_graph_members (oid)
                SELECT oid_value FROM mappings
                WHERE oid_host IN (SELECT oid FROM oid_graph_members)
            "#,
            [],
        )?;
        Ok(keys + values)
    }

    fn marked_count(&self) -> Result<usize> {
        self.count("SELECT COUNT(*) FROM oid_graph_members")
    }

    fn reap_unmarked(&mut self) -> Result<usize> {
        self.begin_write()?;
        let reclaimed = self.conn.execute(
            "DELETE FROM oid_lookup WHERE oid NOT IN (SELECT oid FROM oid_graph_members)",
            [],
        )?;
        if reclaimed > 0 {
            for stmt in schema::DELETE_GARBAGE {
                self.conn.execute(stmt, [])?;
            }
        }
        self.commit()?;
        Ok(reclaimed)
    }

    fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            oids: self.count("SELECT COUNT(*) FROM oid_lookup")?,
            literals: self.count("SELECT COUNT(*) FROM literals")?,
            edges: self.count("SELECT COUNT(*) FROM mappings")?,
            weakrefs: self.count("SELECT COUNT(*) FROM weakrefs")?,
            externals: self.count("SELECT COUNT(*) FROM externals")?,
            roots: self.count("SELECT COUNT(*) FROM exports")?,
            sessions: self.count("SELECT COUNT(*) FROM odb_sessions")?,
            next_oid: self.next_oid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(store: &mut SqliteStorage, kind: Kind, otype: &str) -> Oid {
        let oid = store.allocate_id().unwrap();
        store.set_shape(oid, kind, otype).unwrap();
        oid
    }

    #[test]
    fn test_oids_start_at_first() {
        let mut store = SqliteStorage::open_in_memory().unwrap();
        assert_eq!(store.allocate_id().unwrap(), Oid::FIRST);
        assert_eq!(store.allocate_id().unwrap(), Oid(1001));
    }

    #[test]
    fn test_shape_crud() {
        let mut store = SqliteStorage::open_in_memory().unwrap();
        let oid = shape(&mut store, Kind::Mapping, "dict");

        let entry = store.get_shape(oid).unwrap();
        assert_eq!(entry, Entry::new(oid, Kind::Mapping, "dict"));
        assert!(store.contains(oid).unwrap());
        assert!(matches!(store.get_shape(Oid(5)), Err(Error::NotFound(Oid(5)))));
    }

    #[test]
    fn test_literal_dedup() {
        let mut store = SqliteStorage::open_in_memory().unwrap();
        let a = store.set_literal(&Literal::Integer(42), "int", Kind::Literal).unwrap();
        let b = store.set_literal(&Literal::Integer(42), "int", Kind::Literal).unwrap();
        let c = store.set_literal(&Literal::Integer(42), "bool", Kind::Literal).unwrap();
        let n1 = store.set_literal(&Literal::Null, "null", Kind::Null).unwrap();
        let n2 = store.set_literal(&Literal::Null, "null", Kind::Null).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(n1, n2);
        assert_eq!(store.get_literal(a).unwrap(), Literal::Integer(42));
    }

    #[test]
    fn test_ordered_edges_keep_order() {
        let mut store = SqliteStorage::open_in_memory().unwrap();
        let list = shape(&mut store, Kind::ListLike, "list");
        let x = store.set_literal(&Literal::Text("x".into()), "str", Kind::Literal).unwrap();
        let y = store.set_literal(&Literal::Text("y".into()), "str", Kind::Literal).unwrap();

        store.set_ordered(list, &[y, x, y]).unwrap();
        let oids: Vec<Oid> = store.get_ordered(list).unwrap().iter().map(|e| e.oid).collect();
        assert_eq!(oids, vec![y, x, y]);

        store.set_ordered(list, &[x]).unwrap();
        assert_eq!(store.get_ordered(list).unwrap().len(), 1);
    }

    #[test]
    fn test_mapping_edges() {
        let mut store = SqliteStorage::open_in_memory().unwrap();
        let map = shape(&mut store, Kind::Mapping, "dict");
        let k = store.set_literal(&Literal::Text("a".into()), "str", Kind::Literal).unwrap();
        let v = store.set_literal(&Literal::Integer(1), "int", Kind::Literal).unwrap();

        store.set_mapping(map, &[(k, v)]).unwrap();
        let pairs = store.get_mapping(map).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0.oid, k);
        assert_eq!(pairs[0].1.kind, Kind::Literal);
        assert!(store.get_ordered(map).unwrap().is_empty());
    }

    #[test]
    fn test_weakref_to_missing_target() {
        let mut store = SqliteStorage::open_in_memory().unwrap();
        let weak = shape(&mut store, Kind::Weakref, "weakref");
        store.set_weakref(weak, None).unwrap();
        assert_eq!(store.get_weakref(weak).unwrap(), None);

        let target = shape(&mut store, Kind::ListLike, "list");
        store.set_weakref(weak, Some(target)).unwrap();
        assert_eq!(store.get_weakref(weak).unwrap().map(|e| e.oid), Some(target));
    }

    #[test]
    fn test_roots() {
        let mut store = SqliteStorage::open_in_memory().unwrap();
        let oid = shape(&mut store, Kind::Mapping, "dict");
        store.set_root("doc", oid).unwrap();

        assert_eq!(store.get_root("doc").unwrap().map(|e| e.oid), Some(oid));
        assert_eq!(store.all_roots().unwrap(), vec![("doc".to_string(), oid)]);
        assert!(store.remove_root("doc").unwrap());
        assert!(!store.remove_root("doc").unwrap());
        assert_eq!(store.get_root("doc").unwrap(), None);
    }

    #[test]
    fn test_remove_id_cascades() {
        let mut store = SqliteStorage::open_in_memory().unwrap();
        let list = shape(&mut store, Kind::ListLike, "list");
        let item = store.set_literal(&Literal::Integer(1), "int", Kind::Literal).unwrap();
        store.set_ordered(list, &[item]).unwrap();
        store.set_root("l", list).unwrap();

        assert!(store.remove_id(list).unwrap());
        let stats = store.stats().unwrap();
        assert_eq!(stats.oids, 1);
        assert_eq!(stats.edges, 0);
        assert_eq!(stats.roots, 0);
    }

    #[test]
    fn test_gc_marks_and_reaps() {
        let mut store = SqliteStorage::open_in_memory().unwrap();
        let root = shape(&mut store, Kind::ListLike, "list");
        let kept = store.set_literal(&Literal::Integer(1), "int", Kind::Literal).unwrap();
        let orphan = store.set_literal(&Literal::Integer(2), "int", Kind::Literal).unwrap();
        store.set_ordered(root, &[kept]).unwrap();
        store.set_root("r", root).unwrap();
        store.commit().unwrap();

        assert_eq!(store.mark_reset().unwrap(), 1);
        assert_eq!(store.mark_step().unwrap(), 1);
        assert_eq!(store.mark_step().unwrap(), 0);
        assert_eq!(store.marked_count().unwrap(), 2);

        assert_eq!(store.reap_unmarked().unwrap(), 1);
        assert!(!store.contains(orphan).unwrap());
        assert!(store.contains(kept).unwrap());
        assert_eq!(store.stats().unwrap().literals, 1);
    }

    #[test]
    fn test_close_discards_uncommitted_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        let mut store = SqliteStorage::open(&path).unwrap();
        let committed = shape(&mut store, Kind::Mapping, "dict");
        store.commit().unwrap();
        let dropped = shape(&mut store, Kind::Mapping, "dict");
        store.close().unwrap();
        drop(store);

        let mut reopened = SqliteStorage::open(&path).unwrap();
        assert!(reopened.contains(committed).unwrap());
        assert!(!reopened.contains(dropped).unwrap());
        // The counter resumes after the last committed allocation
        assert_eq!(reopened.allocate_id().unwrap(), Oid(1001));
    }

    #[test]
    fn test_sessions_are_recorded() {
        let mut store = SqliteStorage::open_in_memory().unwrap();
        assert_eq!(store.ssid(), None);
        shape(&mut store, Kind::Tuple, "tuple");
        store.commit().unwrap();
        assert!(store.ssid().is_some());
        assert_eq!(store.stats().unwrap().sessions, 1);
    }

    struct NoHost;

    impl crate::lazy::LazyHost for NoHost {
        fn load_lazy(&self, oid: Oid) -> Result<crate::value::Value> {
            Err(Error::Detached(oid))
        }
    }

    #[test]
    fn test_unknown_stored_kind_fails_load() {
        use crate::deserialize::Deserializer;
        use crate::identity::IdentityMaps;
        use crate::reduce::TypeRegistry;
        use crate::session::Context;
        use std::cell::RefCell;

        let mut store = SqliteStorage::open_in_memory().unwrap();
        let oid = shape(&mut store, Kind::ListLike, "list");
        store
            .conn
            .execute("UPDATE oid_lookup SET stg_kind = 'bogus' WHERE oid = ?1", [oid.get()])
            .unwrap();

        let cx = Context {
            storage: RefCell::new(Box::new(store)),
            identity: RefCell::new(IdentityMaps::new()),
            types: TypeRegistry::default(),
            resolver: None,
            host: std::sync::Weak::<NoHost>::new(),
            lazy_depth: 1,
        };
        let err = Deserializer::new().load(&cx, oid, 1).unwrap_err();
        assert!(matches!(err, Error::UnknownKind(ref tag) if tag == "bogus"));
    }
}
