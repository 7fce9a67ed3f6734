//! The resource value handed out by the cache: a model or a collection.

use crate::collection::Collection;
use crate::error::{Error, Result};
use crate::model::Model;

/// A live resource value.
#[derive(Debug, Clone)]
pub enum Resource {
    Model(Model),
    Collection(Collection),
}

impl Resource {
    pub fn rid(&self) -> &str {
        match self {
            Self::Model(m) => m.rid(),
            Self::Collection(c) => c.rid(),
        }
    }

    pub fn as_model(&self) -> Option<&Model> {
        match self {
            Self::Model(m) => Some(m),
            Self::Collection(_) => None,
        }
    }

    pub fn as_collection(&self) -> Option<&Collection> {
        match self {
            Self::Collection(c) => Some(c),
            Self::Model(_) => None,
        }
    }

    /// Unwraps a model, or fails with a protocol error naming the rid.
    pub fn into_model(self) -> Result<Model> {
        match self {
            Self::Model(m) => Ok(m),
            Self::Collection(c) => Err(Error::protocol(format!(
                "resource {} is a collection, expected a model",
                c.rid()
            ))),
        }
    }

    /// Unwraps a collection, or fails with a protocol error naming the rid.
    pub fn into_collection(self) -> Result<Collection> {
        match self {
            Self::Collection(c) => Ok(c),
            Self::Model(m) => Err(Error::protocol(format!(
                "resource {} is a model, expected a collection",
                m.rid()
            ))),
        }
    }
}

impl From<Model> for Resource {
    fn from(m: Model) -> Self {
        Self::Model(m)
    }
}

impl From<Collection> for Resource {
    fn from(c: Collection) -> Self {
        Self::Collection(c)
    }
}
