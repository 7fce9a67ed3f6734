//! Model type registry.
//!
//! Maps a rid's two-segment *type prefix* to a factory for building the
//! model value, plus an optional custom change handler. Unmatched prefixes
//! fall back to a default factory. Dispatch is a registry lookup, not
//! subclass polymorphism.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use serde_json::Value;

use crate::client::ClientInner;
use crate::error::{Error, Result};
use crate::model::{Model, PropDelta};

// ─── Factory and change handler ───────────────────────────────────────────

/// Everything needed to construct a model: the rid and its initial data.
///
/// A factory may inspect or rewrite `data` before calling
/// [`ModelInit::build`]. Factories run inside cache bookkeeping and must
/// not call back into the client.
pub struct ModelInit {
    pub(crate) client: Weak<ClientInner>,
    pub rid: String,
    pub data: BTreeMap<String, Value>,
}

impl ModelInit {
    /// Builds the model from the (possibly rewritten) initial data.
    pub fn build(self) -> Model {
        Model::new(self.client, &self.rid, self.data)
    }
}

pub type ModelFactory = Arc<dyn Fn(ModelInit) -> Model + Send + Sync>;

/// Context handed to a custom change handler.
///
/// The handler owns the change: the library neither mutates the model nor
/// emits anything when a custom handler is registered. Call
/// [`ChangeCtx::apply_default`] to get the stock behavior back.
pub struct ChangeCtx {
    pub(crate) client: Weak<ClientInner>,
    pub model: Model,
    pub delta: PropDelta,
}

impl ChangeCtx {
    /// Applies the delta, returning the old values of changed keys.
    pub fn apply(&self) -> HashMap<String, Option<Value>> {
        self.model.apply(&self.delta)
    }

    /// Emits a `change` event carrying `old` on the model's event channel.
    /// A no-op when `old` is empty.
    pub fn emit_change(&self, old: HashMap<String, Option<Value>>) {
        if old.is_empty() {
            return;
        }
        if let Some(inner) = self.client.upgrade() {
            inner.bus.emit(
                self.model.rid(),
                "change",
                &crate::bus::EventPayload::Change { old },
            );
        }
    }

    /// The stock behavior: apply, then emit when something changed.
    pub fn apply_default(&self) {
        let old = self.apply();
        self.emit_change(old);
    }
}

pub type ChangeHandler = Arc<dyn Fn(&ChangeCtx) + Send + Sync>;

// ─── Model type ───────────────────────────────────────────────────────────

/// A registered model type.
pub struct ModelType {
    /// Two-segment type prefix, e.g. `"chat.user"`.
    pub id: String,
    pub factory: ModelFactory,
    pub change_handler: Option<ChangeHandler>,
}

impl ModelType {
    pub fn new(id: impl Into<String>, factory: ModelFactory) -> Self {
        Self {
            id: id.into(),
            factory,
            change_handler: None,
        }
    }

    pub fn with_change_handler(mut self, handler: ChangeHandler) -> Self {
        self.change_handler = Some(handler);
        self
    }
}

/// Returns `true` for ids of the form `segment.segment`.
fn valid_type_id(id: &str) -> bool {
    match id.split_once('.') {
        Some((first, second)) => {
            !first.is_empty() && !second.is_empty() && !second.contains('.')
        }
        None => false,
    }
}

// ─── Registry ─────────────────────────────────────────────────────────────

pub(crate) struct TypeRegistry {
    types: HashMap<String, Arc<ModelType>>,
    default_type: Arc<ModelType>,
}

impl TypeRegistry {
    pub(crate) fn new() -> Self {
        Self {
            types: HashMap::new(),
            default_type: Arc::new(ModelType {
                id: String::new(),
                factory: Arc::new(ModelInit::build),
                change_handler: None,
            }),
        }
    }

    pub(crate) fn register(&mut self, model_type: ModelType) -> Result<()> {
        if !valid_type_id(&model_type.id) {
            return Err(Error::config(format!(
                "model type id '{}' must have the form 'segment.segment'",
                model_type.id
            )));
        }
        if self.types.contains_key(&model_type.id) {
            return Err(Error::config(format!(
                "model type '{}' is already registered",
                model_type.id
            )));
        }
        self.types
            .insert(model_type.id.clone(), Arc::new(model_type));
        Ok(())
    }

    pub(crate) fn unregister(&mut self, id: &str) -> Option<Arc<ModelType>> {
        self.types.remove(id)
    }

    /// Selects the model type whose id matches the rid's type prefix, or
    /// the default type.
    pub(crate) fn resolve(&self, rid: &str) -> Arc<ModelType> {
        self.types
            .get(resmux_proto::type_prefix(rid))
            .cloned()
            .unwrap_or_else(|| self.default_type.clone())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_factory() -> ModelFactory {
        Arc::new(ModelInit::build)
    }

    #[test]
    fn id_validation() {
        assert!(valid_type_id("svc.x"));
        assert!(!valid_type_id("svc"));
        assert!(!valid_type_id("svc.x.y"));
        assert!(!valid_type_id(".x"));
        assert!(!valid_type_id("svc."));
        assert!(!valid_type_id(""));
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut reg = TypeRegistry::new();
        reg.register(ModelType::new("svc.x", noop_factory())).unwrap();
        let err = reg
            .register(ModelType::new("svc.x", noop_factory()))
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn malformed_id_fails() {
        let mut reg = TypeRegistry::new();
        let err = reg
            .register(ModelType::new("toomany.dots.here", noop_factory()))
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn resolve_by_prefix_with_fallback() {
        let mut reg = TypeRegistry::new();
        reg.register(ModelType::new("chat.user", noop_factory()))
            .unwrap();

        assert_eq!(reg.resolve("chat.user.42").id, "chat.user");
        assert_eq!(reg.resolve("chat.user").id, "chat.user");
        assert_eq!(reg.resolve("chat.room.1").id, "");
        assert_eq!(reg.resolve("chat").id, "");
    }

    #[test]
    fn unregister_returns_type() {
        let mut reg = TypeRegistry::new();
        reg.register(ModelType::new("svc.x", noop_factory())).unwrap();
        assert!(reg.unregister("svc.x").is_some());
        assert!(reg.unregister("svc.x").is_none());
        // Re-registering after removal is allowed.
        reg.register(ModelType::new("svc.x", noop_factory())).unwrap();
    }
}
