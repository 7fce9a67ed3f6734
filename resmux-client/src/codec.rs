//! Request correlation.
//!
//! Assigns monotonically increasing request ids, serializes outgoing
//! requests, and keeps a pending-request table so inbound responses can be
//! matched back to their continuation: either a caller's oneshot or an
//! internal subscribe/unsubscribe follow-up handled by the cache.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;

use resmux_proto::Request;

use crate::error::{Error, Result};

/// What to do with the response to a pending request.
pub(crate) enum Completion {
    /// Resolve a caller-held future.
    Call(oneshot::Sender<Result<Value>>),
    /// Initial fetch: bind the snapshot and wake the entry's waiters.
    Subscribe { rid: String },
    /// Resynchronization of a stale entry through the sync engine.
    Resubscribe { rid: String },
    /// Client-initiated unsubscribe; completion clears the flag either way.
    Unsubscribe { rid: String },
}

pub(crate) struct Pending {
    pub method: String,
    pub params: Option<Value>,
    pub completion: Completion,
}

pub(crate) struct Codec {
    next_id: u64,
    pending: HashMap<u64, Pending>,
}

impl Codec {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    /// Registers a pending request and returns its id and serialized
    /// frame. The caller removes the entry again if the write fails.
    pub(crate) fn prepare(
        &mut self,
        method: String,
        params: Option<Value>,
        completion: Completion,
    ) -> Result<(u64, String)> {
        let id = self.next_id;
        self.next_id += 1;

        let request = Request {
            id,
            method: method.clone(),
            params: params.clone(),
        };
        let frame = resmux_proto::serialize_request(&request)
            .map_err(|e| Error::protocol(format!("failed to serialize request: {e}")))?;

        self.pending.insert(
            id,
            Pending {
                method,
                params,
                completion,
            },
        );
        Ok((id, frame))
    }

    /// Removes and returns the pending request matching `id`.
    pub(crate) fn take(&mut self, id: u64) -> Option<Pending> {
        self.pending.remove(&id)
    }

    /// Removes every pending request, for failure on connection loss.
    pub(crate) fn drain(&mut self) -> Vec<Pending> {
        self.pending.drain().map(|(_, p)| p).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic() {
        let mut codec = Codec::new();
        let (id1, f1) = codec
            .prepare("call.a.b.x".into(), None, Completion::Subscribe { rid: "a.b".into() })
            .unwrap();
        let (id2, f2) = codec
            .prepare("call.a.b.y".into(), None, Completion::Subscribe { rid: "a.b".into() })
            .unwrap();
        assert!(id1 < id2);
        assert!(f1.contains("\"id\":1"));
        assert!(f2.contains("\"id\":2"));
    }

    #[test]
    fn take_matches_and_removes() {
        let mut codec = Codec::new();
        codec
            .prepare(
                "subscribe.a.b".into(),
                None,
                Completion::Subscribe { rid: "a.b".into() },
            )
            .unwrap();

        let pending = codec.take(1).unwrap();
        assert_eq!(pending.method, "subscribe.a.b");
        assert!(codec.take(1).is_none());
    }

    #[test]
    fn drain_empties_table() {
        let mut codec = Codec::new();
        for _ in 0..3 {
            codec
                .prepare(
                    "subscribe.a.b".into(),
                    None,
                    Completion::Subscribe { rid: "a.b".into() },
                )
                .unwrap();
        }
        assert_eq!(codec.drain().len(), 3);
        assert!(codec.take(1).is_none());
    }
}
