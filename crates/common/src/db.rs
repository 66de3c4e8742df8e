//! SQLite persistence for nodes and pending join requests
//!
//! Rows carry their full record as a JSON body. The columns beside it exist
//! for lookups and to let unique indexes back the allocator: one gateway,
//! unique private addresses, unique Docker subnets.

use crate::{Error, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path.as_ref())?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                role TEXT NOT NULL,
                private_address TEXT NOT NULL UNIQUE,
                docker_subnet TEXT UNIQUE,
                is_current INTEGER NOT NULL DEFAULT 0,
                body TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_nodes_single_gateway
                ON nodes(role) WHERE role = 'gateway';

            CREATE TABLE IF NOT EXISTS pending_join_requests (
                id TEXT PRIMARY KEY,
                role TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Run `f` inside an IMMEDIATE transaction.
    ///
    /// The write lock is taken up front, so concurrent callers serialize
    /// before reading. Any error rolls the whole transaction back.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Run a read-only closure against the connection
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Node rows
pub mod nodes {
    use super::*;
    use crate::{Node, NodeRole};
    use rusqlite::{params, OptionalExtension};
    use std::collections::BTreeMap;

    fn decode(body: String) -> Result<Node> {
        Ok(serde_json::from_str(&body)?)
    }

    fn query_one<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Option<Node>> {
        let body: Option<String> = conn
            .query_row(sql, params, |row| row.get(0))
            .optional()?;
        body.map(decode).transpose()
    }

    /// Every node keyed by id
    pub fn load_all(conn: &Connection) -> Result<BTreeMap<String, Node>> {
        let mut stmt = conn.prepare("SELECT body FROM nodes")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut nodes = BTreeMap::new();
        for body in rows {
            let node = decode(body?)?;
            nodes.insert(node.id.clone(), node);
        }
        Ok(nodes)
    }

    pub fn get(conn: &Connection, id: &str) -> Result<Option<Node>> {
        query_one(conn, "SELECT body FROM nodes WHERE id = ?1", [id])
    }

    pub fn get_gateway(conn: &Connection) -> Result<Option<Node>> {
        query_one(
            conn,
            "SELECT body FROM nodes WHERE role = ?1",
            [NodeRole::Gateway.as_str()],
        )
    }

    pub fn get_current(conn: &Connection) -> Result<Option<Node>> {
        query_one(conn, "SELECT body FROM nodes WHERE is_current = 1", [])
    }

    /// Insert a new row; a clash on any unique column is `AlreadyExists`
    pub fn insert(conn: &Connection, node: &Node) -> Result<()> {
        let body = serde_json::to_string(node)?;
        conn.execute(
            r#"INSERT INTO nodes (id, role, private_address, docker_subnet, is_current, body, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
            params![
                node.id,
                node.role.as_str(),
                node.private_address.to_string(),
                node.docker_subnet.map(|s| s.to_string()),
                node.is_current,
                body,
                node.created_at,
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::AlreadyExists {
                    kind: "node".into(),
                    id: node.id.clone(),
                }
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    /// Insert or replace by id
    pub fn upsert(conn: &Connection, node: &Node) -> Result<()> {
        conn.execute("DELETE FROM nodes WHERE id = ?1", params![node.id])?;
        insert(conn, node)
    }

    /// Clear the current marker on every row except `keep`
    pub fn clear_current_except(conn: &Connection, keep: &str) -> Result<()> {
        let mut stmt = conn.prepare("SELECT body FROM nodes WHERE is_current = 1 AND id != ?1")?;
        let others = stmt
            .query_map([keep], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for body in others {
            let mut node = decode(body)?;
            node.is_current = false;
            upsert(conn, &node)?;
        }
        Ok(())
    }

    pub fn delete_all(conn: &Connection) -> Result<usize> {
        Ok(conn.execute("DELETE FROM nodes", [])?)
    }
}

/// Pending join request rows
pub mod pending {
    use super::*;
    use crate::PendingJoinRequest;
    use rusqlite::{params, OptionalExtension};

    pub fn insert(conn: &Connection, request: &PendingJoinRequest) -> Result<()> {
        let body = serde_json::to_string(request)?;
        conn.execute(
            "INSERT INTO pending_join_requests (id, role, body, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                request.id,
                request.role.as_str(),
                body,
                chrono::Utc::now().timestamp(),
            ],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::AlreadyExists {
                    kind: "join request".into(),
                    id: request.id.clone(),
                }
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    pub fn get(conn: &Connection, id: &str) -> Result<Option<PendingJoinRequest>> {
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM pending_join_requests WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
    }

    /// Outstanding requests, oldest first
    pub fn list(conn: &Connection) -> Result<Vec<PendingJoinRequest>> {
        let mut stmt =
            conn.prepare("SELECT body FROM pending_join_requests ORDER BY created_at, id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut requests = Vec::new();
        for body in rows {
            requests.push(serde_json::from_str(&body?)?);
        }
        Ok(requests)
    }

    /// Returns whether a row was removed
    pub fn delete(conn: &Connection, id: &str) -> Result<bool> {
        Ok(conn.execute("DELETE FROM pending_join_requests WHERE id = ?1", [id])? > 0)
    }

    pub fn delete_all(conn: &Connection) -> Result<usize> {
        Ok(conn.execute("DELETE FROM pending_join_requests", [])?)
    }
}
