//! Resource cache.
//!
//! One [`CacheEntry`] per referenced rid, carrying the bound value and
//! three kinds of interest: *direct* (user-attached handlers), *indirect*
//! (parent collections containing the model), and the *subscribed* flag
//! (the server pushes events for this rid). [`ClientInner::try_release`] is
//! the single GC decision point; an entry is dropped only when all three
//! reach zero and no fetch is parked on it.
//!
//! All mutation happens under the client state lock; user-visible events
//! are collected as effects and dispatched after the lock is released.

use std::collections::BTreeMap;

use serde_json::Value;
use tokio::sync::oneshot;

use resmux_proto::{method, VERB_SUBSCRIBE, VERB_UNSUBSCRIBE};

use crate::bus::EventPayload;
use crate::client::{ClientInner, Effect, Effects, State};
use crate::codec::Completion;
use crate::collection::Collection;
use crate::error::{Error, Result};
use crate::registry::ModelInit;
use crate::resource::Resource;

// ─── Cache entry ──────────────────────────────────────────────────────────

pub(crate) struct CacheEntry {
    pub rid: String,
    /// Bound value; unset while the initial subscribe is in flight.
    pub item: Option<Resource>,
    /// Model type used to build the item (models only).
    pub model_type: Option<std::sync::Arc<crate::registry::ModelType>>,
    /// User-attached handler count.
    pub direct: usize,
    /// Parent-collection reference count.
    pub indirect: usize,
    /// Whether the server currently pushes events for this rid.
    pub subscribed: bool,
    /// Fetches parked on the initial subscribe.
    pub waiters: Vec<oneshot::Sender<Result<Resource>>>,
    /// A stale-resubscribe timer is pending.
    pub resub_armed: bool,
}

impl CacheEntry {
    pub(crate) fn new(rid: &str) -> Self {
        Self {
            rid: rid.to_string(),
            item: None,
            model_type: None,
            direct: 0,
            indirect: 0,
            subscribed: false,
            waiters: Vec::new(),
            resub_armed: false,
        }
    }
}

// ─── Reference counting ───────────────────────────────────────────────────

impl ClientInner {
    /// Adds one direct reference, arming the stale-resubscribe timer when
    /// the entry is not subscribed.
    pub(crate) fn add_direct(&self, rid: &str) {
        let mut st = self.state.lock().unwrap();
        let Some(entry) = st.cache.get_mut(rid) else {
            tracing::warn!(rid, "direct reference on unknown resource");
            return;
        };
        entry.direct += 1;
        if !entry.subscribed {
            self.arm_stale_timer(&mut st, rid);
        }
    }

    /// Drops one direct reference; the last one triggers the release walk.
    pub(crate) fn remove_direct(&self, rid: &str) {
        let mut effects = Effects::new();
        {
            let mut st = self.state.lock().unwrap();
            let Some(entry) = st.cache.get_mut(rid) else {
                return;
            };
            if entry.direct == 0 {
                tracing::warn!(rid, "direct reference count underflow");
                return;
            }
            entry.direct -= 1;
            if entry.direct == 0 {
                self.release_direct(&mut st, &mut effects, rid);
            }
        }
        self.run_effects(effects);
    }

    /// Last direct reference dropped: unsubscribe and release.
    ///
    /// A subscribed collection first re-subscribes any child that is still
    /// directly observed but held only by this collection's indirect
    /// reference, so the child survives the parent's release.
    fn release_direct(&self, st: &mut State, effects: &mut Effects, rid: &str) {
        let Some(entry) = st.cache.get(rid) else {
            return;
        };
        if !entry.subscribed {
            self.try_release(st, effects, rid);
            return;
        }

        if let Some(Resource::Collection(coll)) = entry.item.clone() {
            for child_rid in coll.rids() {
                let orphaned = st
                    .cache
                    .get(&child_rid)
                    .map(|ce| ce.direct > 0 && ce.indirect == 1 && !ce.subscribed)
                    .unwrap_or(false);
                if orphaned && st.writer().is_some() {
                    st.cache.get_mut(&child_rid).unwrap().subscribed = true;
                    let completion = Completion::Resubscribe {
                        rid: child_rid.clone(),
                    };
                    if self
                        .send_locked(st, method(VERB_SUBSCRIBE, &child_rid), None, completion)
                        .is_err()
                    {
                        st.cache.get_mut(&child_rid).unwrap().subscribed = false;
                    }
                }
            }
        }

        if st.writer().is_some() {
            let completion = Completion::Unsubscribe {
                rid: rid.to_string(),
            };
            if self
                .send_locked(st, method(VERB_UNSUBSCRIBE, rid), None, completion)
                .is_ok()
            {
                return; // completion clears the flag and releases
            }
        }
        if let Some(entry) = st.cache.get_mut(rid) {
            entry.subscribed = false;
        }
        self.try_release(st, effects, rid);
    }

    /// The central GC decision. No-op while any interest remains; otherwise
    /// drops the entry and walks collection children.
    pub(crate) fn try_release(&self, st: &mut State, effects: &mut Effects, rid: &str) {
        let Some(entry) = st.cache.get_mut(rid) else {
            return;
        };
        if entry.indirect > 0 {
            return;
        }
        if entry.direct > 0 {
            if !entry.subscribed {
                self.arm_stale_timer(st, rid);
            }
            return;
        }
        if entry.subscribed || !entry.waiters.is_empty() {
            return;
        }

        let entry = st.cache.remove(rid).unwrap();
        tracing::debug!(rid, "released cache entry");

        if let Some(Resource::Collection(coll)) = &entry.item {
            for child_rid in coll.rids() {
                match st.cache.get_mut(&child_rid) {
                    Some(ce) if ce.indirect > 0 => ce.indirect -= 1,
                    _ => {
                        let err = Error::cache(format!(
                            "child {child_rid} of released collection {rid} has no indirect reference"
                        ));
                        tracing::error!(%err, "cache integrity violation");
                        effects.push(Effect::client_error(err));
                        continue;
                    }
                }
                self.try_release(st, effects, &child_rid);
            }
        }
    }

    // ─── Stale resubscribe ────────────────────────────────────────────────

    /// Arms the 2000 ms stale-resubscribe timer for an entry retained only
    /// by direct listeners. Armed at most once per stale period, and only
    /// while a connection is up; reconnect handles the offline case.
    pub(crate) fn arm_stale_timer(&self, st: &mut State, rid: &str) {
        if st.writer().is_none() {
            return;
        }
        let Some(entry) = st.cache.get_mut(rid) else {
            return;
        };
        if entry.resub_armed {
            return;
        }
        entry.resub_armed = true;

        let Some(inner) = self.weak.upgrade() else {
            return;
        };
        let rid = rid.to_string();
        let delay = self.cfg.stale_resubscribe_delay;
        self.rt.spawn(async move {
            tokio::time::sleep(delay).await;
            inner.stale_tick(&rid);
        });
    }

    fn stale_tick(&self, rid: &str) {
        let mut effects = Effects::new();
        {
            let mut st = self.state.lock().unwrap();
            let Some(entry) = st.cache.get_mut(rid) else {
                return;
            };
            entry.resub_armed = false;
            if entry.subscribed {
                return;
            }
            if entry.direct == 0 {
                self.try_release(&mut st, &mut effects, rid);
            } else if st.writer().is_some() {
                tracing::debug!(rid, "resubscribing stale resource");
                st.cache.get_mut(rid).unwrap().subscribed = true;
                let completion = Completion::Resubscribe {
                    rid: rid.to_string(),
                };
                if self
                    .send_locked(&mut st, method(VERB_SUBSCRIBE, rid), None, completion)
                    .is_err()
                {
                    st.cache.get_mut(rid).unwrap().subscribed = false;
                }
            }
        }
        self.run_effects(effects);
    }

    // ─── Snapshot ingestion ───────────────────────────────────────────────

    /// Routes a snapshot payload into the cache.
    ///
    /// An entry that already has an item is stale: the payload goes through
    /// resynchronization. Otherwise the item is created. An array payload
    /// is a collection snapshot whose `{rid, data?}` elements are ingested
    /// recursively as indirect references; an object payload is a model
    /// snapshot bound through the registered model type factory.
    pub(crate) fn ingest_snapshot(
        &self,
        st: &mut State,
        effects: &mut Effects,
        rid: &str,
        payload: &Value,
        add_indirect: bool,
    ) -> Result<Resource> {
        let has_item = st.cache.get(rid).map(|e| e.item.is_some()).unwrap_or(false);
        if has_item {
            self.sync_resource(st, effects, rid, payload)?;
            let entry = st.cache.get_mut(rid).unwrap();
            if add_indirect {
                entry.indirect += 1;
            }
            return Ok(entry.item.clone().unwrap());
        }

        let mut model_type = None;
        let item: Resource = match payload {
            Value::Array(elems) => {
                let mut models = Vec::with_capacity(elems.len());
                for elem in elems {
                    models.push(self.ingest_element(st, effects, elem)?);
                }
                let coll = Collection::new(
                    self.weak.clone(),
                    rid,
                    self.cfg.collection_id_callback.clone(),
                );
                coll.init(models)?;
                Resource::Collection(coll)
            }
            Value::Object(map) => {
                let props = parse_model_props(rid, map)?;
                let mtype = self.registry.lock().unwrap().resolve(rid);
                let model = (mtype.factory)(ModelInit {
                    client: self.weak.clone(),
                    rid: rid.to_string(),
                    data: props,
                });
                model_type = Some(mtype);
                Resource::Model(model)
            }
            _ => {
                return Err(Error::protocol(format!(
                    "snapshot for {rid} is neither an object nor an array"
                )))
            }
        };

        let entry = st
            .cache
            .entry(rid.to_string())
            .or_insert_with(|| CacheEntry::new(rid));
        entry.item = Some(item.clone());
        if model_type.is_some() {
            entry.model_type = model_type;
        }
        if add_indirect {
            entry.indirect += 1;
        }
        Ok(item)
    }

    /// Resolves one `{rid, data?}` collection element into a model,
    /// contributing an indirect reference either way.
    pub(crate) fn ingest_element(
        &self,
        st: &mut State,
        effects: &mut Effects,
        elem: &Value,
    ) -> Result<crate::model::Model> {
        let child_rid = elem
            .get("rid")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::protocol("collection element carries no rid"))?
            .to_string();

        let child = match elem.get("data") {
            Some(data) if !data.is_null() => {
                self.ingest_snapshot(st, effects, &child_rid, data, true)?
            }
            _ => match st.cache.get_mut(&child_rid) {
                Some(ce) if ce.item.is_some() => {
                    ce.indirect += 1;
                    ce.item.clone().unwrap()
                }
                _ => {
                    return Err(Error::protocol(format!(
                        "collection element {child_rid} has no data and is not cached"
                    )))
                }
            },
        };
        child.into_model()
    }

    /// Removes the collection element at `idx`: emits `remove`, drops the
    /// child's indirect reference, and tries to release it.
    pub(crate) fn remove_child_at(
        &self,
        st: &mut State,
        effects: &mut Effects,
        coll: &Collection,
        parent_rid: &str,
        idx: usize,
    ) -> Result<()> {
        let item = coll.remove(idx).ok_or_else(|| {
            Error::cache(format!(
                "remove index {idx} out of bounds for collection {parent_rid}"
            ))
        })?;
        effects.push(Effect::emit(
            parent_rid,
            "remove",
            EventPayload::Remove {
                item: item.clone(),
                idx,
            },
        ));

        let child_rid = item.rid().to_string();
        match st.cache.get_mut(&child_rid) {
            Some(ce) if ce.indirect > 0 => ce.indirect -= 1,
            Some(_) => {
                return Err(Error::cache(format!(
                    "removed model {child_rid} has no indirect reference"
                )))
            }
            None => {
                return Err(Error::cache(format!(
                    "removed model {child_rid} missing from cache"
                )))
            }
        }
        self.try_release(st, effects, &child_rid);
        Ok(())
    }

    // ─── Subscribe completions ────────────────────────────────────────────

    /// Outcome of the initial subscribe for a fetched rid.
    pub(crate) fn complete_subscribe(
        &self,
        st: &mut State,
        effects: &mut Effects,
        rid: &str,
        outcome: Result<Value>,
    ) {
        let bound = outcome.and_then(|result| {
            let payload = result
                .get("data")
                .cloned()
                .ok_or_else(|| Error::protocol(format!("subscribe result for {rid} has no data")))?;
            self.ingest_snapshot(st, effects, rid, &payload, false)
        });

        let Some(entry) = st.cache.get_mut(rid) else {
            return;
        };
        let waiters = std::mem::take(&mut entry.waiters);
        match bound {
            Ok(item) => {
                for waiter in waiters {
                    let _ = waiter.send(Ok(item.clone()));
                }
            }
            Err(err) => {
                entry.subscribed = false;
                for waiter in waiters {
                    let _ = waiter.send(Err(err.clone()));
                }
                if !matches!(err, Error::Resource { .. }) {
                    effects.push(Effect::client_error(err));
                }
                self.try_release(st, effects, rid);
            }
        }
    }

    /// Outcome of a resubscribe issued for a stale entry (reconnect, stale
    /// timer, or orphaned-child rescue).
    pub(crate) fn complete_resubscribe(
        &self,
        st: &mut State,
        effects: &mut Effects,
        rid: &str,
        outcome: Result<Value>,
    ) {
        if !st.cache.contains_key(rid) {
            return;
        }
        let synced = outcome.and_then(|result| {
            let payload = result
                .get("data")
                .cloned()
                .ok_or_else(|| Error::protocol(format!("subscribe result for {rid} has no data")))?;
            self.ingest_snapshot(st, effects, rid, &payload, false)
                .map(|_| ())
        });
        if let Err(err) = synced {
            tracing::warn!(rid, error = %err, "resubscribe failed");
            if let Some(entry) = st.cache.get_mut(rid) {
                entry.subscribed = false;
            }
            if !matches!(err, Error::Resource { .. }) {
                effects.push(Effect::client_error(err));
            }
            self.try_release(st, effects, rid);
        }
    }

    /// Completion of a client-initiated unsubscribe. Success or failure,
    /// the subscription is gone.
    pub(crate) fn complete_unsubscribe(&self, st: &mut State, effects: &mut Effects, rid: &str) {
        if let Some(entry) = st.cache.get_mut(rid) {
            entry.subscribed = false;
        }
        self.try_release(st, effects, rid);
    }
}

// ─── Snapshot parsing ─────────────────────────────────────────────────────

/// Validates a model snapshot: every value must be a JSON primitive.
pub(crate) fn parse_model_props(
    rid: &str,
    map: &serde_json::Map<String, Value>,
) -> Result<BTreeMap<String, Value>> {
    let mut props = BTreeMap::new();
    for (key, value) in map {
        if value.is_object() || value.is_array() {
            return Err(Error::protocol(format!(
                "model {rid} property '{key}' is not a primitive"
            )));
        }
        props.insert(key.clone(), value.clone());
    }
    Ok(props)
}
