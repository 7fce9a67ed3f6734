//! Live collection values.
//!
//! A [`Collection`] is a handle over an ordered list of [`Model`]s,
//! identified by their rids. The library applies server-driven `add` and
//! `remove` events through crate-private hooks; user code reads the list
//! and listens for events.
//!
//! An optional id callback maintains a secondary id → model lookup map.
//! Duplicate ids fail initialization or insertion.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, Weak};

use crate::bus::{EventPayload, HandlerId};
use crate::client::ClientInner;
use crate::error::{Error, Result};
use crate::model::Model;

/// Derives a secondary lookup id from a model.
pub type IdCallback = Arc<dyn Fn(&Model) -> String + Send + Sync>;

struct CollectionShared {
    rid: String,
    client: Weak<ClientInner>,
    list: RwLock<Vec<Model>>,
    id_callback: Option<IdCallback>,
    by_id: RwLock<HashMap<String, Model>>,
}

/// Handle to a live remote collection.
#[derive(Clone)]
pub struct Collection {
    shared: Arc<CollectionShared>,
}

impl Collection {
    pub(crate) fn new(
        client: Weak<ClientInner>,
        rid: &str,
        id_callback: Option<IdCallback>,
    ) -> Self {
        Self {
            shared: Arc::new(CollectionShared {
                rid: rid.to_string(),
                client,
                list: RwLock::new(Vec::new()),
                id_callback,
                by_id: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Resource id of this collection.
    pub fn rid(&self) -> &str {
        &self.shared.rid
    }

    pub fn len(&self) -> usize {
        self.shared.list.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.list.read().unwrap().is_empty()
    }

    /// Model at `idx`, if in bounds.
    pub fn get(&self, idx: usize) -> Option<Model> {
        self.shared.list.read().unwrap().get(idx).cloned()
    }

    /// Position of `item` in the list, matched by rid.
    pub fn index_of(&self, item: &Model) -> Option<usize> {
        self.shared
            .list
            .read()
            .unwrap()
            .iter()
            .position(|m| m.rid() == item.rid())
    }

    /// Snapshot of the current list.
    pub fn to_vec(&self) -> Vec<Model> {
        self.shared.list.read().unwrap().clone()
    }

    /// Iterates over a snapshot of the current list.
    pub fn iter(&self) -> std::vec::IntoIter<Model> {
        self.to_vec().into_iter()
    }

    /// Rids of the current elements, in order.
    pub fn rids(&self) -> Vec<String> {
        self.shared
            .list
            .read()
            .unwrap()
            .iter()
            .map(|m| m.rid().to_string())
            .collect()
    }

    /// Secondary-id lookup. Always `None` without an id callback.
    pub fn get_by_id(&self, id: &str) -> Option<Model> {
        self.shared.by_id.read().unwrap().get(id).cloned()
    }

    /// Attaches a handler for space-separated event names (typically
    /// `"add"`, `"remove"`). Counts as one direct reference on the cached
    /// resource.
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

    /// Detaches a handler previously attached with [`Collection::on`] and
    /// drops its direct reference.
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

    // ─── Mutation hooks (sync engine only) ────────────────────────────────

    /// Replaces the list with an initial snapshot.
    pub(crate) fn init(&self, items: Vec<Model>) -> Result<()> {
        if let Some(cb) = &self.shared.id_callback {
            let mut by_id = HashMap::with_capacity(items.len());
            for item in &items {
                let id = cb(item);
                if by_id.insert(id.clone(), item.clone()).is_some() {
                    return Err(Error::cache(format!(
                        "duplicate id '{id}' in collection {}",
                        self.shared.rid
                    )));
                }
            }
            *self.shared.by_id.write().unwrap() = by_id;
        }
        *self.shared.list.write().unwrap() = items;
        Ok(())
    }

    /// Inserts `item` at `idx`. The id callback is applied to the inserted
    /// item; a duplicate id is an integrity error and leaves the list
    /// untouched.
    pub(crate) fn insert(&self, idx: usize, item: Model) -> Result<()> {
        let mut list = self.shared.list.write().unwrap();
        if idx > list.len() {
            return Err(Error::cache(format!(
                "add index {idx} out of bounds for collection {} of length {}",
                self.shared.rid,
                list.len()
            )));
        }
        if let Some(cb) = &self.shared.id_callback {
            let id = cb(&item);
            let mut by_id = self.shared.by_id.write().unwrap();
            if by_id.contains_key(&id) {
                return Err(Error::cache(format!(
                    "duplicate id '{id}' in collection {}",
                    self.shared.rid
                )));
            }
            by_id.insert(id, item.clone());
        }
        list.insert(idx, item);
        Ok(())
    }

    /// Removes and returns the item at `idx`.
    pub(crate) fn remove(&self, idx: usize) -> Option<Model> {
        let mut list = self.shared.list.write().unwrap();
        if idx >= list.len() {
            return None;
        }
        let item = list.remove(idx);
        if let Some(cb) = &self.shared.id_callback {
            self.shared.by_id.write().unwrap().remove(&cb(&item));
        }
        Some(item)
    }
}

impl IntoIterator for &Collection {
    type Item = Model;
    type IntoIter = std::vec::IntoIter<Model>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl PartialEq for Collection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("rid", &self.shared.rid)
            .field("rids", &self.rids())
            .finish()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
