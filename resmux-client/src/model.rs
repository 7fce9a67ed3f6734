//! Live model values.
//!
//! A [`Model`] is a cheaply clonable handle over a remote key/value
//! resource. The library keeps it synchronized with the server; user code
//! reads it and listens for `change` events. Mutation goes through the
//! crate-private [`Model::apply`] hook, driven only by the sync engine.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock, Weak};

use serde_json::Value;

use crate::bus::{EventPayload, HandlerId};
use crate::client::ClientInner;
use crate::error::{Error, Result};

// ─── Change deltas ────────────────────────────────────────────────────────

/// One property mutation inside a change delta.
#[derive(Debug, Clone, PartialEq)]
pub enum PropChange {
    /// Set the key to a primitive value.
    Set(Value),
    /// Remove the key.
    Delete,
}

/// Parsed change delta: key → mutation. Wire-level delete sentinels have
/// already been translated to [`PropChange::Delete`].
pub type PropDelta = BTreeMap<String, PropChange>;

// ─── Model ────────────────────────────────────────────────────────────────

struct ModelShared {
    rid: String,
    client: Weak<ClientInner>,
    props: RwLock<BTreeMap<String, Value>>,
}

/// Handle to a live remote model.
#[derive(Clone)]
pub struct Model {
    shared: Arc<ModelShared>,
}

impl Model {
    pub(crate) fn new(client: Weak<ClientInner>, rid: &str, props: BTreeMap<String, Value>) -> Self {
        Self {
            shared: Arc::new(ModelShared {
                rid: rid.to_string(),
                client,
                props: RwLock::new(props),
            }),
        }
    }

    /// Resource id of this model.
    pub fn rid(&self) -> &str {
        &self.shared.rid
    }

    /// Current value of a property.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.shared.props.read().unwrap().get(key).cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.shared.props.read().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.shared.props.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.props.read().unwrap().is_empty()
    }

    /// Snapshot of all properties.
    pub fn props(&self) -> BTreeMap<String, Value> {
        self.shared.props.read().unwrap().clone()
    }

    /// Attaches a handler for space-separated event names (typically
    /// `"change"`). Counts as one direct reference on the cached resource:
    /// the entry stays alive, and stale entries are resubscribed, for as
    /// long as handlers are attached.
    pub fn on(
        &self,
        events: &str,
        handler: impl Fn(&str, &EventPayload) + Send + Sync + 'static,
    ) -> Result<HandlerId> {
        let inner = self.client()?;
        let id = inner.bus.on(&self.shared.rid, events, Arc::new(handler));
        inner.add_direct(&self.shared.rid);
        Ok(id)
    }

    /// Detaches a handler previously attached with [`Model::on`] and drops
    /// its direct reference.
    pub fn off(&self, events: &str, id: HandlerId) -> Result<()> {
        let inner = self.client()?;
        if inner.bus.off(&self.shared.rid, events, id) {
            inner.remove_direct(&self.shared.rid);
        }
        Ok(())
    }

    fn client(&self) -> Result<Arc<ClientInner>> {
        self.shared
            .client
            .upgrade()
            .ok_or_else(|| Error::transport("client has been dropped"))
    }

    /// Applies a change delta and returns the previous values of the keys
    /// that actually changed (`None` for keys that did not exist).
    ///
    /// Invoked only by the sync engine.
    pub(crate) fn apply(&self, delta: &PropDelta) -> HashMap<String, Option<Value>> {
        let mut props = self.shared.props.write().unwrap();
        let mut old = HashMap::new();
        for (key, change) in delta {
            match change {
                PropChange::Set(value) => {
                    let previous = props.get(key);
                    if previous != Some(value) {
                        old.insert(key.clone(), previous.cloned());
                        props.insert(key.clone(), value.clone());
                    }
                }
                PropChange::Delete => {
                    if let Some(previous) = props.remove(key) {
                        old.insert(key.clone(), Some(previous));
                    }
                }
            }
        }
        old
    }
}

impl PartialEq for Model {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("rid", &self.shared.rid)
            .field("props", &*self.shared.props.read().unwrap())
            .finish()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn model(props: &[(&str, Value)]) -> Model {
        Model::new(
            Weak::new(),
            "test.model.1",
            props
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn apply_reports_old_values() {
        let m = model(&[("name", json!("A")), ("level", json!(3))]);
        let mut delta = PropDelta::new();
        delta.insert("name".into(), PropChange::Set(json!("B")));
        delta.insert("role".into(), PropChange::Set(json!("admin")));

        let old = m.apply(&delta);
        assert_eq!(old.get("name"), Some(&Some(json!("A"))));
        assert_eq!(old.get("role"), Some(&None));
        assert_eq!(m.get("name"), Some(json!("B")));
        assert_eq!(m.get("role"), Some(json!("admin")));
        assert_eq!(m.get("level"), Some(json!(3)));
    }

    #[test]
    fn apply_skips_unchanged_values() {
        let m = model(&[("name", json!("A"))]);
        let mut delta = PropDelta::new();
        delta.insert("name".into(), PropChange::Set(json!("A")));

        let old = m.apply(&delta);
        assert!(old.is_empty());
    }

    #[test]
    fn apply_delete_removes_key() {
        let m = model(&[("name", json!("A"))]);
        let mut delta = PropDelta::new();
        delta.insert("name".into(), PropChange::Delete);
        delta.insert("ghost".into(), PropChange::Delete);

        let old = m.apply(&delta);
        assert_eq!(old.get("name"), Some(&Some(json!("A"))));
        assert!(!old.contains_key("ghost"));
        assert!(!m.contains_key("name"));
    }
}
