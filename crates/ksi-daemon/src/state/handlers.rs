//! Event handler layer over the relational store.
//!
//! One handler per `state:*` event; each call is one store transaction and
//! returns a deterministic reply shape. Validation failures surface as
//! `bad_request`, missing entities and constraint violations as
//! `precondition`; the dispatcher turns both into error reply objects.

use serde_json::{Map, Value, json};
use std::sync::Arc;

use ksi_core::KsiError;

use super::{Direction, StateStore};
use crate::dispatcher::EventDispatcher;
use crate::runtime_config::RuntimeLimits;

fn props_of(data: &Value) -> Map<String, Value> {
    data.get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn required_str<'a>(data: &'a Value, field: &str) -> Result<&'a str, KsiError> {
    data.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| KsiError::bad_request(format!("{field} is required")))
}

/// Register every `state:*` handler.
pub fn register_handlers(
    dispatcher: &Arc<EventDispatcher>,
    store: Arc<StateStore>,
    limits: Arc<RuntimeLimits>,
) {
    {
        let store = store.clone();
        dispatcher.on("state:entity:create", 0, move |data, _ctx| {
            let store = store.clone();
            async move {
                let entity_type = required_str(&data, "type")?.to_string();
                let id = data
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let entity = store.create_entity(id, &entity_type, &props_of(&data))?;
                Ok(Some(entity))
            }
        });
    }

    {
        let store = store.clone();
        dispatcher.on("state:entity:update", 0, move |data, _ctx| {
            let store = store.clone();
            async move {
                let id = required_str(&data, "id")?.to_string();
                store.update_entity(&id, &props_of(&data))?;
                Ok(Some(json!({ "status": "updated", "id": id })))
            }
        });
    }

    {
        let store = store.clone();
        dispatcher.on("state:entity:delete", 0, move |data, _ctx| {
            let store = store.clone();
            async move {
                let id = required_str(&data, "id")?.to_string();
                if store.delete_entity(&id)? {
                    Ok(Some(json!({ "status": "deleted", "id": id })))
                } else {
                    Err(KsiError::precondition(format!("entity {id} not found")))
                }
            }
        });
    }

    {
        let store = store.clone();
        dispatcher.on("state:entity:get", 0, move |data, _ctx| {
            let store = store.clone();
            async move {
                let id = required_str(&data, "id")?.to_string();
                let include = includes_of(&data);
                match store.get_entity(&id, include.0, include.1)? {
                    Some(entity) => Ok(Some(entity)),
                    None => Err(KsiError::precondition(format!("entity {id} not found"))),
                }
            }
        });
    }

    {
        let store = store.clone();
        dispatcher.on("state:entity:query", 0, move |data, _ctx| {
            let store = store.clone();
            async move {
                let entity_type = data.get("type").and_then(Value::as_str);
                let where_props = data
                    .get("where")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                let order_by = data.get("order_by").and_then(Value::as_str);
                let limit = data.get("limit").and_then(Value::as_u64).map(|n| n as usize);
                let include = includes_of(&data);
                let entities =
                    store.query_entities(entity_type, &where_props, order_by, limit, include.0)?;
                Ok(Some(json!({
                    "count": entities.len(),
                    "entities": entities,
                })))
            }
        });
    }

    {
        let store = store.clone();
        dispatcher.on("state:entity:bulk_create", 0, move |data, _ctx| {
            let store = store.clone();
            async move {
                let items = data
                    .get("entities")
                    .and_then(Value::as_array)
                    .filter(|a| !a.is_empty())
                    .ok_or_else(|| KsiError::bad_request("entities list is required"))?
                    .clone();

                let mut results = Vec::with_capacity(items.len());
                let mut success = 0usize;
                for item in &items {
                    let outcome = (|| -> Result<Value, KsiError> {
                        let entity_type = required_str(item, "type")?.to_string();
                        let id = item
                            .get("id")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                        store.create_entity(id, &entity_type, &props_of(item))
                    })();
                    match outcome {
                        Ok(entity) => {
                            success += 1;
                            results.push(entity);
                        }
                        Err(err) => results.push(err.to_value()),
                    }
                }
                Ok(Some(json!({
                    "results": results,
                    "total": items.len(),
                    "success": success,
                    "failed": items.len() - success,
                })))
            }
        });
    }

    {
        let store = store.clone();
        dispatcher.on("state:relationship:create", 0, move |data, _ctx| {
            let store = store.clone();
            async move {
                let from = required_str(&data, "from")?.to_string();
                let to = required_str(&data, "to")?.to_string();
                let rtype = required_str(&data, "type")?.to_string();
                store.create_relationship(&from, &to, &rtype, data.get("metadata"))?;
                Ok(Some(json!({
                    "status": "created",
                    "from": from,
                    "to": to,
                    "type": rtype,
                })))
            }
        });
    }

    {
        let store = store.clone();
        dispatcher.on("state:relationship:delete", 0, move |data, _ctx| {
            let store = store.clone();
            async move {
                let from = required_str(&data, "from")?.to_string();
                let to = required_str(&data, "to")?.to_string();
                let rtype = required_str(&data, "type")?.to_string();
                if store.delete_relationship(&from, &to, &rtype)? {
                    Ok(Some(json!({
                        "status": "deleted",
                        "from": from,
                        "to": to,
                        "type": rtype,
                    })))
                } else {
                    Err(KsiError::precondition("relationship not found"))
                }
            }
        });
    }

    {
        let store = store.clone();
        dispatcher.on("state:relationship:query", 0, move |data, _ctx| {
            let store = store.clone();
            async move {
                let relationships = store.query_relationships(
                    data.get("from").and_then(Value::as_str),
                    data.get("to").and_then(Value::as_str),
                    data.get("type").and_then(Value::as_str),
                )?;
                Ok(Some(json!({
                    "count": relationships.len(),
                    "relationships": relationships,
                })))
            }
        });
    }

    {
        let store = store.clone();
        let limits = limits.clone();
        dispatcher.on("state:graph:traverse", 0, move |data, _ctx| {
            let store = store.clone();
            let limits = limits.clone();
            async move {
                let root = required_str(&data, "from")?.to_string();
                let direction = Direction::parse(
                    data.get("direction").and_then(Value::as_str).unwrap_or("outgoing"),
                )?;
                let types: Vec<String> = data
                    .get("types")
                    .and_then(Value::as_array)
                    .map(|a| {
                        a.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                let requested = data.get("depth").and_then(Value::as_u64).unwrap_or(1) as u32;
                let depth = requested.min(limits.max_traversal_depth());
                let include_entities = data
                    .get("include_entities")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                Ok(Some(store.traverse(
                    &root,
                    direction,
                    &types,
                    depth,
                    include_entities,
                )?))
            }
        });
    }

    dispatcher.on("state:aggregate:count", 0, move |data, _ctx| {
        let store = store.clone();
        async move {
            let target = required_str(&data, "target")?;
            let group_by = data.get("group_by").and_then(Value::as_str);
            match target {
                "entities" => {
                    let type_filter = data
                        .get("where")
                        .and_then(|w| w.get("type"))
                        .and_then(Value::as_str);
                    Ok(Some(store.count_entities(type_filter, group_by == Some("type"))?))
                }
                "relationships" => {
                    Ok(Some(store.count_relationships(group_by == Some("type"))?))
                }
                other => Err(KsiError::bad_request(format!(
                    "target must be 'entities' or 'relationships' (got {other:?})"
                ))),
            }
        }
    });
}

/// `(properties, relationships)` include flags; properties default on.
fn includes_of(data: &Value) -> (bool, bool) {
    match data.get("include").and_then(Value::as_array) {
        None => (true, false),
        Some(list) => {
            let has = |name: &str| list.iter().any(|v| v.as_str() == Some(name));
            (has("properties"), has("relationships"))
        }
    }
}
