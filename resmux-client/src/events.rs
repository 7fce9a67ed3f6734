//! Inbound resource event handling.
//!
//! Events arrive as `<rid>.<name>` frames. `change`, `add`, `remove` and
//! `unsubscribe` get protocol-defined treatment; everything else passes
//! through to the event bus verbatim.

use serde_json::Value;

use resmux_proto::EventFrame;

use crate::bus::EventPayload;
use crate::client::{ClientInner, Effect, Effects, State};
use crate::error::{Error, Result};
use crate::model::{PropChange, PropDelta};
use crate::registry::ChangeCtx;
use crate::resource::Resource;

// ─── Payload parsing ──────────────────────────────────────────────────────

/// Parses a change event payload into a delta.
///
/// Object values are only accepted when they are the delete sentinel; any
/// other object or array is unsupported.
pub(crate) fn parse_change_delta(data: &Value) -> Result<PropDelta> {
    let map = data
        .as_object()
        .ok_or_else(|| Error::protocol("change event data is not an object"))?;

    let mut delta = PropDelta::new();
    for (key, value) in map {
        let change = if resmux_proto::is_delete_sentinel(value) {
            PropChange::Delete
        } else if value.is_object() || value.is_array() {
            return Err(Error::protocol(format!(
                "unsupported value for changed key '{key}'"
            )));
        } else {
            PropChange::Set(value.clone())
        };
        delta.insert(key.clone(), change);
    }
    Ok(delta)
}

struct AddEvent {
    elem: Value,
    idx: usize,
}

fn parse_add_event(data: Option<&Value>) -> Result<AddEvent> {
    let data = data.ok_or_else(|| Error::protocol("add event carries no data"))?;
    let idx = data
        .get("idx")
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::protocol("add event carries no idx"))? as usize;
    // Repackage as a `{rid, data?}` collection element for ingestion.
    let mut elem = serde_json::Map::new();
    let rid = data
        .get("rid")
        .cloned()
        .ok_or_else(|| Error::protocol("add event carries no rid"))?;
    elem.insert("rid".to_string(), rid);
    if let Some(value) = data.get("data") {
        elem.insert("data".to_string(), value.clone());
    }
    Ok(AddEvent {
        elem: Value::Object(elem),
        idx,
    })
}

fn parse_remove_idx(data: Option<&Value>) -> Result<usize> {
    data.and_then(|d| d.get("idx"))
        .and_then(Value::as_u64)
        .map(|idx| idx as usize)
        .ok_or_else(|| Error::protocol("remove event carries no idx"))
}

// ─── Application ──────────────────────────────────────────────────────────

impl ClientInner {
    /// Routes one event frame. Malformed names and payloads surface as
    /// protocol errors; unknown rids are logged and dropped.
    pub(crate) fn handle_event_frame(
        &self,
        st: &mut State,
        effects: &mut Effects,
        frame: &EventFrame,
    ) -> Result<()> {
        let (rid, name) = resmux_proto::split_event(&frame.event)
            .ok_or_else(|| Error::protocol(format!("malformed event name '{}'", frame.event)))?;

        match name {
            "change" => self.handle_change(st, effects, rid, frame.data.as_ref()),
            "add" => self.handle_add(st, effects, rid, frame.data.as_ref()),
            "remove" => self.handle_remove(st, effects, rid, frame.data.as_ref()),
            "unsubscribe" => {
                self.handle_unsubscribe(st, effects, rid);
                Ok(())
            }
            _ => {
                effects.push(Effect::emit(
                    rid,
                    name,
                    EventPayload::Custom {
                        name: name.to_string(),
                        data: frame.data.clone(),
                    },
                ));
                Ok(())
            }
        }
    }

    /// Applies a change event, or a model resynchronization snapshot
    /// (which takes the same path).
    pub(crate) fn handle_change(
        &self,
        st: &mut State,
        effects: &mut Effects,
        rid: &str,
        data: Option<&Value>,
    ) -> Result<()> {
        let Some(entry) = st.cache.get(rid) else {
            tracing::warn!(rid, "change event for unknown resource");
            return Ok(());
        };
        let Some(item) = entry.item.clone() else {
            return Ok(());
        };
        let model = match item {
            Resource::Model(m) => m,
            Resource::Collection(_) => {
                return Err(Error::protocol(format!(
                    "change event for collection {rid}"
                )))
            }
        };
        let Some(data) = data else {
            return Ok(());
        };
        let delta = parse_change_delta(data)?;

        let custom = entry.model_type.as_ref().and_then(|t| t.change_handler.clone());
        match custom {
            Some(handler) => effects.push(Effect::CustomChange {
                handler,
                ctx: ChangeCtx {
                    client: self.weak.clone(),
                    model,
                    delta,
                },
            }),
            None => {
                let old = model.apply(&delta);
                if !old.is_empty() {
                    effects.push(Effect::emit(rid, "change", EventPayload::Change { old }));
                }
            }
        }
        Ok(())
    }

    fn handle_add(
        &self,
        st: &mut State,
        effects: &mut Effects,
        rid: &str,
        data: Option<&Value>,
    ) -> Result<()> {
        let Some(entry) = st.cache.get(rid) else {
            tracing::warn!(rid, "add event for unknown resource");
            return Ok(());
        };
        let coll = match entry.item.clone() {
            Some(Resource::Collection(c)) => c,
            Some(Resource::Model(_)) => {
                return Err(Error::protocol(format!("add event for model {rid}")))
            }
            None => return Ok(()),
        };

        let add = parse_add_event(data)?;
        let model = self.ingest_element(st, effects, &add.elem)?;
        if let Err(err) = coll.insert(add.idx, model.clone()) {
            // Roll the indirect reference back; the insert never happened.
            let child_rid = model.rid().to_string();
            if let Some(ce) = st.cache.get_mut(&child_rid) {
                ce.indirect = ce.indirect.saturating_sub(1);
            }
            self.try_release(st, effects, &child_rid);
            return Err(err);
        }
        effects.push(Effect::emit(
            rid,
            "add",
            EventPayload::Add {
                item: model,
                idx: add.idx,
            },
        ));
        Ok(())
    }

    fn handle_remove(
        &self,
        st: &mut State,
        effects: &mut Effects,
        rid: &str,
        data: Option<&Value>,
    ) -> Result<()> {
        let Some(entry) = st.cache.get(rid) else {
            tracing::warn!(rid, "remove event for unknown resource");
            return Ok(());
        };
        let coll = match entry.item.clone() {
            Some(Resource::Collection(c)) => c,
            Some(Resource::Model(_)) => {
                return Err(Error::protocol(format!("remove event for model {rid}")))
            }
            None => return Ok(()),
        };
        let idx = parse_remove_idx(data)?;
        self.remove_child_at(st, effects, &coll, rid, idx)
    }

    /// Server-initiated unsubscribe: the entry goes stale. Direct
    /// listeners keep it alive and arm the resubscribe timer.
    pub(crate) fn handle_unsubscribe(&self, st: &mut State, effects: &mut Effects, rid: &str) {
        let Some(entry) = st.cache.get_mut(rid) else {
            tracing::warn!(rid, "unsubscribe event for unknown resource");
            return;
        };
        entry.subscribed = false;
        let item = entry.item.clone();
        self.try_release(st, effects, rid);
        if let Some(item) = item {
            effects.push(Effect::emit(rid, "unsubscribe", EventPayload::Unsubscribe { item }));
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn change_delta_translates_sentinel() {
        let delta = parse_change_delta(&json!({
            "name": "B",
            "legacy": { "action": "delete" },
            "count": 3,
            "gone": null,
        }))
        .unwrap();

        assert_eq!(delta["name"], PropChange::Set(json!("B")));
        assert_eq!(delta["legacy"], PropChange::Delete);
        assert_eq!(delta["count"], PropChange::Set(json!(3)));
        assert_eq!(delta["gone"], PropChange::Set(Value::Null));
    }

    #[test]
    fn change_delta_rejects_nested_values() {
        let err = parse_change_delta(&json!({"bad": {"action": "rename"}})).unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));

        let err = parse_change_delta(&json!({"bad": [1, 2]})).unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));

        let err = parse_change_delta(&json!("not an object")).unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn add_event_shape() {
        let data = json!({"rid": "x.item.9", "data": {"name": "n"}, "idx": 2});
        let add = parse_add_event(Some(&data)).unwrap();
        assert_eq!(add.idx, 2);
        assert_eq!(add.elem["rid"], "x.item.9");
        assert_eq!(add.elem["data"]["name"], "n");

        assert!(parse_add_event(None).is_err());
        assert!(parse_add_event(Some(&json!({"rid": "x.1"}))).is_err());
        assert!(parse_add_event(Some(&json!({"idx": 0}))).is_err());
    }

    #[test]
    fn remove_event_shape() {
        assert_eq!(parse_remove_idx(Some(&json!({"idx": 4}))).unwrap(), 4);
        assert!(parse_remove_idx(Some(&json!({}))).is_err());
        assert!(parse_remove_idx(None).is_err());
    }
}
