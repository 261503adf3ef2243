//! Entity registry: descriptor/delta envelope production and inbound
//! command decoding.
//!
//! Envelopes are built as one serde_json tree and printed once. The
//! registry caches the last-published state per entity so successive
//! `updated_json(false)` calls yield true deltas only.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use super::{Entity, Value};

/// A decoded server-side method invocation, forwarded to the host.
#[derive(Debug, Clone, PartialEq)]
pub struct IotCommand {
    pub entity: String,
    pub method: String,
    pub parameters: HashMap<String, Value>,
}

/// Holds registered entities and their last-published states.
///
/// Owned exclusively by the engine task; the only shared mutable state is
/// each entity's own `states` map behind its leaf lock.
#[derive(Default)]
pub struct Registry {
    entities: Vec<Arc<Entity>>,
    last_published: HashMap<String, HashMap<String, Value>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entity: Arc<Entity>) {
        debug!(entity = entity.name(), "iot entity registered");
        self.entities.push(entity);
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// One descriptor envelope per registered entity, carrying the full
    /// method/property schema.
    pub fn descriptors_json(&self) -> Vec<String> {
        self.entities
            .iter()
            .map(|entity| {
                let properties: serde_json::Map<String, serde_json::Value> = entity
                    .properties()
                    .values()
                    .map(|p| {
                        (
                            p.name.clone(),
                            json!({
                                "description": p.description,
                                "type": p.value_type.wire_name(),
                            }),
                        )
                    })
                    .collect();

                let methods: serde_json::Map<String, serde_json::Value> = entity
                    .methods()
                    .values()
                    .map(|m| {
                        let parameters: serde_json::Map<String, serde_json::Value> = m
                            .parameters
                            .iter()
                            .map(|p| {
                                (
                                    p.name.clone(),
                                    json!({
                                        "description": p.description,
                                        "type": p.value_type.wire_name(),
                                    }),
                                )
                            })
                            .collect();
                        (
                            m.name.clone(),
                            json!({
                                "description": m.description,
                                "parameters": parameters,
                            }),
                        )
                    })
                    .collect();

                let envelope = json!({
                    "session_id": "",
                    "type": "iot",
                    "update": true,
                    "descriptors": [{
                        "name": entity.name(),
                        "description": entity.description(),
                        "properties": properties,
                        "methods": methods,
                    }],
                });
                envelope.to_string()
            })
            .collect()
    }

    /// One state envelope per entity whose states changed since the last
    /// publication — or per every entity when `force` is true. The
    /// envelope's `state` map carries only the changed keys (all keys when
    /// forced). The publication cache is refreshed either way.
    pub fn updated_json(&mut self, force: bool) -> Vec<String> {
        let mut result = Vec::new();

        for entity in &self.entities {
            let current = entity.states();
            let diff = Self::diff_states(
                self.last_published.entry(entity.name().to_string()),
                current,
                force,
            );
            if diff.is_empty() {
                continue;
            }

            let state: serde_json::Map<String, serde_json::Value> = diff
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::from(v)))
                .collect();
            let envelope = json!({
                "session_id": "",
                "type": "iot",
                "update": true,
                "states": [{
                    "name": entity.name(),
                    "state": state,
                }],
            });
            result.push(envelope.to_string());
        }

        result
    }

    fn diff_states(
        cache: std::collections::hash_map::Entry<'_, String, HashMap<String, Value>>,
        current: HashMap<String, Value>,
        force: bool,
    ) -> HashMap<String, Value> {
        use std::collections::hash_map::Entry;

        match cache {
            Entry::Vacant(slot) => {
                // Never published: everything is new.
                slot.insert(current.clone());
                current
            }
            Entry::Occupied(mut slot) => {
                if force {
                    slot.insert(current.clone());
                    return current;
                }
                let previous = slot.get();
                let diff: HashMap<String, Value> = current
                    .iter()
                    .filter(|(key, value)| previous.get(*key) != Some(value))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                slot.insert(current);
                diff
            }
        }
    }

    /// Decode a server `iot` frame's `commands` array into invocations.
    /// Malformed entries are skipped; parameter values map to
    /// bool → `Bool`, string → `Text`, number → `Int` (truncated).
    pub fn decode_commands(commands: &serde_json::Value) -> Vec<IotCommand> {
        let Some(commands) = commands.as_array() else {
            return Vec::new();
        };

        commands
            .iter()
            .filter_map(|command| {
                let entity = command.get("name")?.as_str()?.to_string();
                let method = command.get("method")?.as_str()?.to_string();
                let parameters = command
                    .get("parameters")
                    .and_then(|p| p.as_object())
                    .map(|params| {
                        params
                            .iter()
                            .filter_map(|(key, value)| {
                                let value = match value {
                                    serde_json::Value::Bool(b) => Value::Bool(*b),
                                    serde_json::Value::String(s) => Value::Text(s.clone()),
                                    serde_json::Value::Number(n) => {
                                        Value::Int(n.as_i64().or_else(|| {
                                            n.as_f64().map(|f| f as i64)
                                        })?)
                                    }
                                    _ => return None,
                                };
                                Some((key.clone(), value))
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                Some(IotCommand {
                    entity,
                    method,
                    parameters,
                })
            })
            .collect()
    }
}
