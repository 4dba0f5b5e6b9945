//! Relational state store: entities, EAV properties, typed relationships.
//!
//! Everything durable in the daemon is an entity with properties and
//! relationships, held in a single embedded SQLite file. Writes go through
//! one connection guarded by a mutex (one transaction per exposed handler
//! call); readers take the same lock for their short queries. Deleting an
//! entity cascades to its properties and every relationship it participates
//! in.
//!
//! Property values round-trip structurally: objects and arrays are stored as
//! kind `json`, booleans/numbers/strings keep their native kind, and writing
//! `null` removes the property.

pub mod handlers;

use rusqlite::{Connection, OptionalExtension, params};
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use ksi_core::KsiError;
use ksi_core::envelope::{epoch_to_iso, now_epoch, prefixed_id};

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS entities (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    created_at REAL NOT NULL,
    updated_at REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS properties (
    entity_id TEXT NOT NULL,
    name TEXT NOT NULL,
    value TEXT,
    value_kind TEXT NOT NULL DEFAULT 'string',
    PRIMARY KEY (entity_id, name),
    FOREIGN KEY (entity_id) REFERENCES entities(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS relationships (
    from_id TEXT NOT NULL,
    to_id TEXT NOT NULL,
    relation_type TEXT NOT NULL,
    metadata TEXT,
    created_at REAL NOT NULL,
    PRIMARY KEY (from_id, to_id, relation_type),
    FOREIGN KEY (from_id) REFERENCES entities(id) ON DELETE CASCADE,
    FOREIGN KEY (to_id) REFERENCES entities(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_entities_type ON entities(type);
CREATE INDEX IF NOT EXISTS idx_entities_created ON entities(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_properties_entity ON properties(entity_id);
CREATE INDEX IF NOT EXISTS idx_relationships_from ON relationships(from_id);
CREATE INDEX IF NOT EXISTS idx_relationships_to ON relationships(to_id);
CREATE INDEX IF NOT EXISTS idx_relationships_type ON relationships(relation_type);
";

/// Traversal direction for [`StateStore::traverse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
    Both,
}

impl Direction {
    pub fn parse(raw: &str) -> Result<Self, KsiError> {
        match raw {
            "outgoing" => Ok(Self::Outgoing),
            "incoming" => Ok(Self::Incoming),
            "both" => Ok(Self::Both),
            other => Err(KsiError::bad_request(format!(
                "direction must be outgoing, incoming, or both (got {other:?})"
            ))),
        }
    }
}

/// Serialise a JSON value into `(column_value, value_kind)`.
fn encode_value(value: &Value) -> (Option<String>, &'static str) {
    match value {
        Value::Null => (None, "null"),
        Value::Bool(b) => (Some(b.to_string()), "bool"),
        Value::Number(n) => (Some(n.to_string()), "number"),
        Value::String(s) => (Some(s.clone()), "string"),
        Value::Array(_) | Value::Object(_) => (Some(value.to_string()), "json"),
    }
}

/// Inverse of [`encode_value`].
fn decode_value(raw: Option<String>, kind: &str) -> Value {
    let Some(raw) = raw else {
        return Value::Null;
    };
    match kind {
        "null" => Value::Null,
        "bool" => Value::Bool(raw == "true"),
        "number" | "json" => serde_json::from_str(&raw).unwrap_or(Value::Null),
        _ => Value::String(raw),
    }
}

fn map_sql_err(context: &str, err: rusqlite::Error) -> KsiError {
    match &err {
        rusqlite::Error::SqliteFailure(code, _)
            if code.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            KsiError::precondition(format!("{context}: constraint violation"))
        }
        _ => KsiError::internal_with(context.to_string(), err),
    }
}

/// The store. One per daemon; shared by `Arc`.
pub struct StateStore {
    conn: Mutex<Connection>,
}

impl StateStore {
    /// Open (creating if needed) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, KsiError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| KsiError::internal_with("failed to create store directory", e))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| map_sql_err("failed to open store", e))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| map_sql_err("failed to initialise schema", e))?;
        info!("relational store ready at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, for tests.
    pub fn open_in_memory() -> Result<Self, KsiError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| map_sql_err("failed to open in-memory store", e))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| map_sql_err("failed to initialise schema", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an entity with optional initial properties. Returns the
    /// created entity object; a duplicate id is a precondition error with no
    /// partial effects.
    pub fn create_entity(
        &self,
        id: Option<String>,
        entity_type: &str,
        properties: &Map<String, Value>,
    ) -> Result<Value, KsiError> {
        let entity_id = id.unwrap_or_else(|| prefixed_id(entity_type));
        let now = now_epoch();

        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| map_sql_err("begin transaction", e))?;
        tx.execute(
            "INSERT INTO entities (id, type, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![entity_id, entity_type, now, now],
        )
        .map_err(|e| match &e {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                KsiError::precondition(format!("entity {entity_id} already exists"))
            }
            _ => map_sql_err("insert entity", e),
        })?;
        for (name, value) in properties {
            if value.is_null() {
                continue;
            }
            let (raw, kind) = encode_value(value);
            tx.execute(
                "INSERT INTO properties (entity_id, name, value, value_kind) VALUES (?1, ?2, ?3, ?4)",
                params![entity_id, name, raw, kind],
            )
            .map_err(|e| map_sql_err("insert property", e))?;
        }
        tx.commit().map_err(|e| map_sql_err("commit", e))?;

        debug!(entity_id, entity_type, "entity created");
        Ok(json!({
            "id": entity_id,
            "type": entity_type,
            "created_at": now,
            "created_at_iso": epoch_to_iso(now),
            "updated_at": now,
            "updated_at_iso": epoch_to_iso(now),
            "properties": properties
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Map<String, Value>>(),
        }))
    }

    /// Upsert properties on an existing entity. A `null` value deletes the
    /// property.
    pub fn update_entity(
        &self,
        entity_id: &str,
        properties: &Map<String, Value>,
    ) -> Result<(), KsiError> {
        let now = now_epoch();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| map_sql_err("begin transaction", e))?;

        let exists: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM entities WHERE id = ?1",
                params![entity_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| map_sql_err("check entity", e))?;
        if exists.is_none() {
            return Err(KsiError::precondition(format!(
                "entity {entity_id} not found"
            )));
        }

        tx.execute(
            "UPDATE entities SET updated_at = ?1 WHERE id = ?2",
            params![now, entity_id],
        )
        .map_err(|e| map_sql_err("touch entity", e))?;

        for (name, value) in properties {
            if value.is_null() {
                tx.execute(
                    "DELETE FROM properties WHERE entity_id = ?1 AND name = ?2",
                    params![entity_id, name],
                )
                .map_err(|e| map_sql_err("delete property", e))?;
            } else {
                let (raw, kind) = encode_value(value);
                tx.execute(
                    "INSERT OR REPLACE INTO properties (entity_id, name, value, value_kind) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![entity_id, name, raw, kind],
                )
                .map_err(|e| map_sql_err("upsert property", e))?;
            }
        }
        tx.commit().map_err(|e| map_sql_err("commit", e))?;
        debug!(entity_id, "entity updated");
        Ok(())
    }

    /// Delete an entity; properties and relationships cascade. Returns
    /// whether the entity existed.
    pub fn delete_entity(&self, entity_id: &str) -> Result<bool, KsiError> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn
            .execute("DELETE FROM entities WHERE id = ?1", params![entity_id])
            .map_err(|e| map_sql_err("delete entity", e))?;
        if deleted > 0 {
            debug!(entity_id, "entity deleted");
        }
        Ok(deleted > 0)
    }

    /// Fetch one entity. `include_relationships` splits edges into `from`
    /// (outgoing) and `to` (incoming).
    pub fn get_entity(
        &self,
        entity_id: &str,
        include_properties: bool,
        include_relationships: bool,
    ) -> Result<Option<Value>, KsiError> {
        let conn = self.conn.lock().unwrap();
        self.get_entity_locked(&conn, entity_id, include_properties, include_relationships)
    }

    fn get_entity_locked(
        &self,
        conn: &Connection,
        entity_id: &str,
        include_properties: bool,
        include_relationships: bool,
    ) -> Result<Option<Value>, KsiError> {
        let row: Option<(String, String, f64, f64)> = conn
            .query_row(
                "SELECT id, type, created_at, updated_at FROM entities WHERE id = ?1",
                params![entity_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| map_sql_err("get entity", e))?;

        let Some((id, entity_type, created_at, updated_at)) = row else {
            return Ok(None);
        };

        let mut result = json!({
            "id": id,
            "type": entity_type,
            "created_at": created_at,
            "created_at_iso": epoch_to_iso(created_at),
            "updated_at": updated_at,
            "updated_at_iso": epoch_to_iso(updated_at),
        });

        if include_properties {
            result["properties"] = Value::Object(self.properties_locked(conn, entity_id)?);
        }

        if include_relationships {
            let outgoing = self.relationships_locked(conn, Some(entity_id), None, None)?;
            let incoming = self.relationships_locked(conn, None, Some(entity_id), None)?;
            result["relationships"] = json!({ "from": outgoing, "to": incoming });
        }

        Ok(Some(result))
    }

    fn properties_locked(
        &self,
        conn: &Connection,
        entity_id: &str,
    ) -> Result<Map<String, Value>, KsiError> {
        let mut stmt = conn
            .prepare("SELECT name, value, value_kind FROM properties WHERE entity_id = ?1")
            .map_err(|e| map_sql_err("prepare properties", e))?;
        let rows = stmt
            .query_map(params![entity_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(|e| map_sql_err("query properties", e))?;

        let mut props = Map::new();
        for row in rows {
            let (name, raw, kind) = row.map_err(|e| map_sql_err("read property", e))?;
            props.insert(name, decode_value(raw, &kind));
        }
        Ok(props)
    }

    /// Query entities by type and property equalities.
    pub fn query_entities(
        &self,
        entity_type: Option<&str>,
        where_props: &Map<String, Value>,
        order_by: Option<&str>,
        limit: Option<usize>,
        include_properties: bool,
    ) -> Result<Vec<Value>, KsiError> {
        let mut sql = String::from("SELECT e.id FROM entities e");
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(t) = entity_type {
            clauses.push("e.type = ?".to_string());
            args.push(Box::new(t.to_string()));
        }
        for (name, value) in where_props {
            clauses.push(
                "EXISTS (SELECT 1 FROM properties p WHERE p.entity_id = e.id \
                 AND p.name = ? AND p.value = ?)"
                    .to_string(),
            );
            let (raw, _) = encode_value(value);
            args.push(Box::new(name.clone()));
            args.push(Box::new(raw));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&order_clause(order_by)?);
        if let Some(n) = limit {
            sql.push_str(&format!(" LIMIT {n}"));
        }

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| map_sql_err("prepare entity query", e))?;
        let params_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let ids = stmt
            .query_map(params_ref.as_slice(), |row| row.get::<_, String>(0))
            .map_err(|e| map_sql_err("query entities", e))?
            .collect::<Result<Vec<String>, _>>()
            .map_err(|e| map_sql_err("read entity ids", e))?;

        let mut entities = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entity) = self.get_entity_locked(&conn, &id, include_properties, false)? {
                entities.push(entity);
            }
        }
        Ok(entities)
    }

    /// Create a typed relationship. Both endpoints must exist; the triple is
    /// unique.
    pub fn create_relationship(
        &self,
        from_id: &str,
        to_id: &str,
        relation_type: &str,
        metadata: Option<&Value>,
    ) -> Result<(), KsiError> {
        let now = now_epoch();
        let metadata_raw = metadata.map(Value::to_string);
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO relationships (from_id, to_id, relation_type, metadata, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![from_id, to_id, relation_type, metadata_raw, now],
        )
        .map_err(|e| match &e {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                KsiError::precondition(format!(
                    "relationship {from_id} -{relation_type}-> {to_id} already exists \
                     or an endpoint is missing"
                ))
            }
            _ => map_sql_err("insert relationship", e),
        })?;
        debug!(from_id, to_id, relation_type, "relationship created");
        Ok(())
    }

    /// Delete one relationship. Returns whether it existed.
    pub fn delete_relationship(
        &self,
        from_id: &str,
        to_id: &str,
        relation_type: &str,
    ) -> Result<bool, KsiError> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn
            .execute(
                "DELETE FROM relationships WHERE from_id = ?1 AND to_id = ?2 AND relation_type = ?3",
                params![from_id, to_id, relation_type],
            )
            .map_err(|e| map_sql_err("delete relationship", e))?;
        Ok(deleted > 0)
    }

    /// Query relationships by any subset of (from, to, type).
    pub fn query_relationships(
        &self,
        from_id: Option<&str>,
        to_id: Option<&str>,
        relation_type: Option<&str>,
    ) -> Result<Vec<Value>, KsiError> {
        let conn = self.conn.lock().unwrap();
        self.relationships_locked(&conn, from_id, to_id, relation_type)
    }

    fn relationships_locked(
        &self,
        conn: &Connection,
        from_id: Option<&str>,
        to_id: Option<&str>,
        relation_type: Option<&str>,
    ) -> Result<Vec<Value>, KsiError> {
        let mut sql =
            String::from("SELECT from_id, to_id, relation_type, metadata, created_at FROM relationships WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(f) = from_id {
            sql.push_str(" AND from_id = ?");
            args.push(Box::new(f.to_string()));
        }
        if let Some(t) = to_id {
            sql.push_str(" AND to_id = ?");
            args.push(Box::new(t.to_string()));
        }
        if let Some(rt) = relation_type {
            sql.push_str(" AND relation_type = ?");
            args.push(Box::new(rt.to_string()));
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| map_sql_err("prepare relationship query", e))?;
        let params_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let rows = stmt
            .query_map(params_ref.as_slice(), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, f64>(4)?,
                ))
            })
            .map_err(|e| map_sql_err("query relationships", e))?;

        let mut out = Vec::new();
        for row in rows {
            let (from, to, rtype, metadata, created_at) =
                row.map_err(|e| map_sql_err("read relationship", e))?;
            let mut rel = json!({
                "from": from,
                "to": to,
                "type": rtype,
                "created_at": created_at,
                "created_at_iso": epoch_to_iso(created_at),
            });
            if let Some(raw) = metadata {
                rel["metadata"] = serde_json::from_str(&raw).unwrap_or(Value::Null);
            }
            out.push(rel);
        }
        Ok(out)
    }

    /// Breadth-first traversal from `root`, bounded by `depth`.
    pub fn traverse(
        &self,
        root: &str,
        direction: Direction,
        types: &[String],
        depth: u32,
        include_entities: bool,
    ) -> Result<Value, KsiError> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut nodes = Map::new();
        let mut edges: Vec<Value> = Vec::new();
        let mut seen_edges: HashSet<(String, String, String)> = HashSet::new();
        let mut queue: VecDeque<(String, u32)> = VecDeque::new();
        queue.push_back((root.to_string(), 0));

        while let Some((current, current_depth)) = queue.pop_front() {
            if visited.contains(&current) || current_depth > depth {
                continue;
            }
            visited.insert(current.clone());

            let node = if include_entities {
                self.get_entity(&current, true, false)?
                    .unwrap_or_else(|| json!({"id": current}))
            } else {
                json!({"id": current})
            };
            nodes.insert(current.clone(), node);

            if current_depth >= depth {
                continue;
            }

            if matches!(direction, Direction::Outgoing | Direction::Both) {
                for rel in self.query_relationships(Some(&current), None, None)? {
                    let rtype = rel["type"].as_str().unwrap_or_default().to_string();
                    if !types.is_empty() && !types.contains(&rtype) {
                        continue;
                    }
                    let to = rel["to"].as_str().unwrap_or_default().to_string();
                    if seen_edges.insert((current.clone(), to.clone(), rtype)) {
                        edges.push(rel);
                    }
                    queue.push_back((to, current_depth + 1));
                }
            }
            if matches!(direction, Direction::Incoming | Direction::Both) {
                for rel in self.query_relationships(None, Some(&current), None)? {
                    let rtype = rel["type"].as_str().unwrap_or_default().to_string();
                    if !types.is_empty() && !types.contains(&rtype) {
                        continue;
                    }
                    let from = rel["from"].as_str().unwrap_or_default().to_string();
                    if seen_edges.insert((from.clone(), current.clone(), rtype)) {
                        edges.push(rel);
                    }
                    queue.push_back((from, current_depth + 1));
                }
            }
        }

        Ok(json!({
            "root": root,
            "nodes": nodes,
            "edges": edges,
            "node_count": visited.len(),
            "edge_count": edges.len(),
        }))
    }

    /// Count entities, optionally grouped by type.
    pub fn count_entities(
        &self,
        type_filter: Option<&str>,
        group_by_type: bool,
    ) -> Result<Value, KsiError> {
        let conn = self.conn.lock().unwrap();
        if group_by_type {
            let mut stmt = conn
                .prepare("SELECT type, COUNT(*) FROM entities GROUP BY type")
                .map_err(|e| map_sql_err("prepare count", e))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
                })
                .map_err(|e| map_sql_err("count entities", e))?;
            let mut counts: HashMap<String, u64> = HashMap::new();
            for row in rows {
                let (t, n) = row.map_err(|e| map_sql_err("read count", e))?;
                counts.insert(t, n);
            }
            Ok(json!({ "counts": counts, "grouped_by": "type" }))
        } else {
            let total: u64 = match type_filter {
                Some(t) => conn
                    .query_row(
                        "SELECT COUNT(*) FROM entities WHERE type = ?1",
                        params![t],
                        |row| row.get(0),
                    )
                    .map_err(|e| map_sql_err("count entities", e))?,
                None => conn
                    .query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))
                    .map_err(|e| map_sql_err("count entities", e))?,
            };
            Ok(json!({ "total": total }))
        }
    }

    /// Count relationships, optionally grouped by relation type.
    pub fn count_relationships(&self, group_by_type: bool) -> Result<Value, KsiError> {
        let conn = self.conn.lock().unwrap();
        if group_by_type {
            let mut stmt = conn
                .prepare("SELECT relation_type, COUNT(*) FROM relationships GROUP BY relation_type")
                .map_err(|e| map_sql_err("prepare count", e))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
                })
                .map_err(|e| map_sql_err("count relationships", e))?;
            let mut counts: HashMap<String, u64> = HashMap::new();
            for row in rows {
                let (t, n) = row.map_err(|e| map_sql_err("read count", e))?;
                counts.insert(t, n);
            }
            Ok(json!({ "counts": counts, "grouped_by": "relation_type" }))
        } else {
            let total: u64 = conn
                .query_row("SELECT COUNT(*) FROM relationships", [], |row| row.get(0))
                .map_err(|e| map_sql_err("count relationships", e))?;
            Ok(json!({ "total": total }))
        }
    }
}

fn order_clause(order_by: Option<&str>) -> Result<String, KsiError> {
    let Some(raw) = order_by else {
        return Ok(" ORDER BY e.created_at DESC".to_string());
    };
    let mut parts = raw.split_whitespace();
    let column = parts.next().unwrap_or_default();
    let direction = parts.next().unwrap_or("asc");
    if !matches!(column, "created_at" | "updated_at" | "id" | "type") {
        return Err(KsiError::bad_request(format!(
            "order_by column must be one of created_at, updated_at, id, type (got {column:?})"
        )));
    }
    let dir_sql = match direction.to_ascii_lowercase().as_str() {
        "asc" => "ASC",
        "desc" => "DESC",
        other => {
            return Err(KsiError::bad_request(format!(
                "order_by direction must be asc or desc (got {other:?})"
            )));
        }
    };
    Ok(format!(" ORDER BY e.{column} {dir_sql}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    fn props(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_create_and_get_round_trip_values() {
        let s = store();
        let created = s
            .create_entity(
                Some("e1".into()),
                "note",
                &props(&[
                    ("title", json!("hello")),
                    ("count", json!(42)),
                    ("ratio", json!(0.5)),
                    ("done", json!(true)),
                    ("tags", json!(["a", "b"])),
                    ("meta", json!({"nested": {"deep": 1}})),
                ]),
            )
            .unwrap();
        assert_eq!(created["id"], "e1");

        let got = s.get_entity("e1", true, false).unwrap().unwrap();
        let p = &got["properties"];
        assert_eq!(p["title"], json!("hello"));
        assert_eq!(p["count"], json!(42));
        assert_eq!(p["ratio"], json!(0.5));
        assert_eq!(p["done"], json!(true));
        assert_eq!(p["tags"], json!(["a", "b"]));
        assert_eq!(p["meta"], json!({"nested": {"deep": 1}}));
    }

    #[test]
    fn test_duplicate_id_is_precondition_without_partial_effects() {
        let s = store();
        s.create_entity(Some("dup".into()), "note", &Map::new())
            .unwrap();
        let err = s
            .create_entity(
                Some("dup".into()),
                "note",
                &props(&[("marker", json!("second"))]),
            )
            .unwrap_err();
        assert_eq!(err.code(), "precondition");

        let got = s.get_entity("dup", true, false).unwrap().unwrap();
        assert!(got["properties"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_update_upserts_and_null_deletes() {
        let s = store();
        s.create_entity(
            Some("e1".into()),
            "note",
            &props(&[("keep", json!(1)), ("drop", json!(2))]),
        )
        .unwrap();

        s.update_entity(
            "e1",
            &props(&[
                ("keep", json!(10)),
                ("drop", Value::Null),
                ("added", json!("new")),
            ]),
        )
        .unwrap();

        let got = s.get_entity("e1", true, false).unwrap().unwrap();
        let p = got["properties"].as_object().unwrap();
        assert_eq!(p["keep"], json!(10));
        assert_eq!(p["added"], json!("new"));
        assert!(!p.contains_key("drop"));

        let err = s.update_entity("missing", &Map::new()).unwrap_err();
        assert_eq!(err.code(), "precondition");
    }

    #[test]
    fn test_delete_cascades_properties_and_relationships() {
        let s = store();
        s.create_entity(Some("a".into()), "node", &props(&[("x", json!(1))]))
            .unwrap();
        s.create_entity(Some("b".into()), "node", &Map::new())
            .unwrap();
        s.create_relationship("a", "b", "next", None).unwrap();
        s.create_relationship("b", "a", "prev", None).unwrap();

        assert!(s.delete_entity("a").unwrap());
        assert!(!s.delete_entity("a").unwrap());
        assert!(s.get_entity("a", true, false).unwrap().is_none());

        // Both edges touching "a" are gone.
        assert!(s.query_relationships(Some("a"), None, None).unwrap().is_empty());
        assert!(s.query_relationships(None, Some("a"), None).unwrap().is_empty());
        assert!(s.query_relationships(Some("b"), None, None).unwrap().is_empty());
    }

    #[test]
    fn test_relationship_uniqueness_and_missing_endpoint() {
        let s = store();
        s.create_entity(Some("a".into()), "node", &Map::new())
            .unwrap();
        s.create_entity(Some("b".into()), "node", &Map::new())
            .unwrap();
        s.create_relationship("a", "b", "next", Some(&json!({"w": 1})))
            .unwrap();

        let dup = s.create_relationship("a", "b", "next", None).unwrap_err();
        assert_eq!(dup.code(), "precondition");

        let missing = s.create_relationship("a", "ghost", "next", None).unwrap_err();
        assert_eq!(missing.code(), "precondition");

        let rels = s.query_relationships(Some("a"), None, None).unwrap();
        assert_eq!(rels.len(), 1);
        assert_eq!(rels[0]["metadata"], json!({"w": 1}));
    }

    #[test]
    fn test_query_entities_by_type_and_properties() {
        let s = store();
        for (id, status) in [("a1", "active"), ("a2", "active"), ("a3", "stopped")] {
            s.create_entity(
                Some(id.into()),
                "agent",
                &props(&[("status", json!(status))]),
            )
            .unwrap();
        }
        s.create_entity(Some("n1".into()), "note", &props(&[("status", json!("active"))]))
            .unwrap();

        let agents = s
            .query_entities(Some("agent"), &Map::new(), None, None, true)
            .unwrap();
        assert_eq!(agents.len(), 3);

        let active = s
            .query_entities(
                Some("agent"),
                &props(&[("status", json!("active"))]),
                Some("id asc"),
                None,
                false,
            )
            .unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0]["id"], "a1");

        let limited = s
            .query_entities(None, &Map::new(), Some("id asc"), Some(2), false)
            .unwrap();
        assert_eq!(limited.len(), 2);

        assert!(
            s.query_entities(None, &Map::new(), Some("value; DROP TABLE"), None, false)
                .is_err()
        );
    }

    #[test]
    fn test_traverse_chain_bounded_by_depth() {
        let s = store();
        for i in 0..10 {
            s.create_entity(Some(format!("n{i}")), "node", &Map::new())
                .unwrap();
        }
        for i in 0..9 {
            s.create_relationship(&format!("n{i}"), &format!("n{}", i + 1), "next", None)
                .unwrap();
        }

        let result = s
            .traverse("n0", Direction::Outgoing, &[], 5, true)
            .unwrap();
        assert_eq!(result["node_count"], 6);
        assert_eq!(result["edge_count"], 5);
        assert!(result["nodes"]["n5"].is_object());
        assert!(result["nodes"].get("n6").is_none());
    }

    #[test]
    fn test_traverse_directions_and_type_filter() {
        let s = store();
        for id in ["root", "child", "parent", "other"] {
            s.create_entity(Some(id.into()), "node", &Map::new())
                .unwrap();
        }
        s.create_relationship("root", "child", "spawned", None)
            .unwrap();
        s.create_relationship("parent", "root", "spawned", None)
            .unwrap();
        s.create_relationship("root", "other", "observes", None)
            .unwrap();

        let out = s
            .traverse("root", Direction::Outgoing, &["spawned".into()], 2, false)
            .unwrap();
        assert_eq!(out["node_count"], 2);

        let both = s.traverse("root", Direction::Both, &[], 1, false).unwrap();
        assert_eq!(both["node_count"], 4);
    }

    #[test]
    fn test_aggregate_counts() {
        let s = store();
        s.create_entity(Some("a1".into()), "agent", &Map::new())
            .unwrap();
        s.create_entity(Some("a2".into()), "agent", &Map::new())
            .unwrap();
        s.create_entity(Some("n1".into()), "note", &Map::new())
            .unwrap();
        s.create_relationship("a1", "a2", "peer", None).unwrap();
        s.create_relationship("a1", "n1", "owns", None).unwrap();

        assert_eq!(s.count_entities(None, false).unwrap()["total"], 3);
        assert_eq!(s.count_entities(Some("agent"), false).unwrap()["total"], 2);

        let grouped = s.count_entities(None, true).unwrap();
        assert_eq!(grouped["counts"]["agent"], 2);
        assert_eq!(grouped["counts"]["note"], 1);

        let rel_grouped = s.count_relationships(true).unwrap();
        assert_eq!(rel_grouped["counts"]["peer"], 1);
        assert_eq!(rel_grouped["grouped_by"], "relation_type");
    }

    #[test]
    fn test_generated_ids_carry_type_prefix() {
        let s = store();
        let created = s.create_entity(None, "session", &Map::new()).unwrap();
        let id = created["id"].as_str().unwrap();
        assert!(id.starts_with("session_"));
    }
}
