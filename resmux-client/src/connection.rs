//! Connection lifecycle.
//!
//! Owns the transport handle and drives connect, reconnect and teardown.
//! On open, an optional user hook runs before anything else, then every
//! stale directly-observed entry is resubscribed and the connect future
//! resolves. On close, all entries go stale, pending requests fail with a
//! transport error, and a reconnect is scheduled while `try_connect`
//! holds.
//!
//! Frames and closures from a superseded connection are fenced off with an
//! epoch counter: bumping the epoch orphans the old read pump.

use tokio::sync::{mpsc, oneshot};

use resmux_proto::{method, VERB_SUBSCRIBE};

use crate::bus::EventPayload;
use crate::client::{Client, ClientInner, ConnState, Effects, State};
use crate::codec::Completion;
use crate::error::{Error, Result};
use crate::transport::TransportConn;

impl ClientInner {
    /// Parks a waiter on the connect future, starting an attempt when the
    /// connection is idle.
    pub(crate) fn start_connect_locked(
        &self,
        st: &mut State,
    ) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        st.connect_waiters.push(tx);
        if matches!(st.conn, ConnState::Idle) {
            st.conn = ConnState::Connecting;
            st.connect_attempt += 1;
            let attempt = st.connect_attempt;
            if let Some(inner) = self.weak.upgrade() {
                self.rt.spawn(async move {
                    inner.run_connect(attempt).await;
                });
            }
        }
        rx
    }

    async fn run_connect(self: std::sync::Arc<Self>, attempt: u64) {
        match self.transport.connect(&self.url).await {
            Ok(conn) => self.finish_connect(attempt, conn).await,
            Err(err) => {
                tracing::warn!(error = %err, "connect failed");
                let (waiters, retry) = {
                    let mut st = self.state.lock().unwrap();
                    if st.connect_attempt != attempt
                        || !matches!(st.conn, ConnState::Connecting)
                    {
                        return;
                    }
                    st.conn = ConnState::Idle;
                    (std::mem::take(&mut st.connect_waiters), st.try_connect)
                };
                for waiter in waiters {
                    let _ = waiter.send(Err(err.clone()));
                }
                if retry {
                    self.schedule_reconnect();
                }
            }
        }
    }

    async fn finish_connect(self: std::sync::Arc<Self>, attempt: u64, conn: TransportConn) {
        let epoch = {
            let mut st = self.state.lock().unwrap();
            if st.connect_attempt != attempt
                || !matches!(st.conn, ConnState::Connecting)
                || !st.try_connect
            {
                // Superseded or cancelled; dropping the handles closes it.
                return;
            }
            st.epoch += 1;
            st.conn = ConnState::Opening {
                writer: conn.outgoing,
            };
            st.epoch
        };
        self.spawn_read_pump(epoch, conn.incoming);

        // The hook runs before resubscription and before the connect future
        // resolves; requests it issues (typically auth) use the writer that
        // is already in place.
        let hook = self.on_connect.lock().unwrap().clone();
        if let Some(hook) = hook {
            let client = Client::from_inner(self.clone());
            if let Err(err) = hook(client).await {
                tracing::warn!(error = %err, "on-connect hook failed, closing transport");
                self.abort_open(epoch, err);
                return;
            }
        }

        let (waiters, effects) = {
            let mut st = self.state.lock().unwrap();
            if st.epoch != epoch || !matches!(st.conn, ConnState::Opening { .. }) {
                return;
            }
            self.resubscribe_stale_locked(&mut st);
            let writer = match &st.conn {
                ConnState::Opening { writer } => writer.clone(),
                _ => unreachable!(),
            };
            st.conn = ConnState::Open { writer };
            (std::mem::take(&mut st.connect_waiters), Effects::new())
        };

        tracing::info!(url = %self.url, "connected");
        for waiter in waiters {
            let _ = waiter.send(Ok(()));
        }
        self.bus.emit("", "connect", &EventPayload::Connect);
        self.run_effects(effects);
    }

    /// Tears down a connection whose on-connect hook failed: the connect
    /// future rejects with the hook error, nothing resolves.
    fn abort_open(&self, epoch: u64, err: Error) {
        let (waiters, retry, effects) = {
            let mut st = self.state.lock().unwrap();
            if st.epoch != epoch {
                return;
            }
            st.epoch += 1; // orphan the read pump
            st.conn = ConnState::Idle; // dropping the writer closes the transport
            let mut effects = Effects::new();
            self.fail_pending_locked(&mut st, &mut effects);
            (
                std::mem::take(&mut st.connect_waiters),
                st.try_connect,
                effects,
            )
        };
        for waiter in waiters {
            let _ = waiter.send(Err(err.clone()));
        }
        self.run_effects(effects);
        if retry {
            self.schedule_reconnect();
        }
    }

    fn spawn_read_pump(&self, epoch: u64, mut incoming: mpsc::UnboundedReceiver<String>) {
        let Some(inner) = self.weak.upgrade() else {
            return;
        };
        self.rt.spawn(async move {
            while let Some(text) = incoming.recv().await {
                inner.handle_frame(epoch, &text);
            }
            inner.handle_disconnect(epoch);
        });
    }

    /// The transport closed underneath us: every entry goes stale, pending
    /// work fails, and a reconnect is scheduled while wanted.
    fn handle_disconnect(&self, epoch: u64) {
        let (waiters, retry, effects) = {
            let mut st = self.state.lock().unwrap();
            if st.epoch != epoch {
                return;
            }
            st.conn = ConnState::Idle;
            let mut effects = Effects::new();
            self.teardown_locked(&mut st, &mut effects);
            (
                std::mem::take(&mut st.connect_waiters),
                st.try_connect,
                effects,
            )
        };

        tracing::info!("connection closed");
        for waiter in waiters {
            let _ = waiter.send(Err(Error::transport("connection closed")));
        }
        self.bus.emit("", "close", &EventPayload::Close);
        self.run_effects(effects);
        if retry {
            self.schedule_reconnect();
        }
    }

    /// Shared teardown: fail pending requests, mark every entry
    /// unsubscribed, then sweep each through the release decision.
    pub(crate) fn teardown_locked(&self, st: &mut State, effects: &mut Effects) {
        self.fail_pending_locked(st, effects);
        let rids: Vec<String> = st.cache.keys().cloned().collect();
        for rid in &rids {
            if let Some(entry) = st.cache.get_mut(rid) {
                entry.subscribed = false;
            }
        }
        for rid in &rids {
            self.try_release(st, effects, rid);
        }
    }

    /// Fails every in-flight request with a transport error. Fetches wake
    /// their waiters; stale-subscription bookkeeping is settled so the
    /// affected entries can be released or resubscribed later.
    fn fail_pending_locked(&self, st: &mut State, effects: &mut Effects) {
        let err = Error::transport("connection closed");
        for pending in st.codec.drain() {
            match pending.completion {
                Completion::Call(tx) => {
                    let _ = tx.send(Err(err.clone()));
                }
                Completion::Subscribe { rid } => {
                    if let Some(entry) = st.cache.get_mut(&rid) {
                        entry.subscribed = false;
                        let waiters = std::mem::take(&mut entry.waiters);
                        for waiter in waiters {
                            let _ = waiter.send(Err(err.clone()));
                        }
                        self.try_release(st, effects, &rid);
                    }
                }
                Completion::Resubscribe { rid } | Completion::Unsubscribe { rid } => {
                    if let Some(entry) = st.cache.get_mut(&rid) {
                        entry.subscribed = false;
                        self.try_release(st, effects, &rid);
                    }
                }
            }
        }
    }

    /// On open: issue a subscribe for every entry that is directly observed
    /// and not already subscribed. Indirect-only entries refresh through
    /// their parents' resynchronization.
    fn resubscribe_stale_locked(&self, st: &mut State) {
        let stale: Vec<String> = st
            .cache
            .iter()
            .filter(|(_, e)| e.direct > 0 && !e.subscribed)
            .map(|(rid, _)| rid.clone())
            .collect();
        for rid in stale {
            tracing::debug!(rid, "resubscribing after reconnect");
            st.cache.get_mut(&rid).unwrap().subscribed = true;
            let completion = Completion::Resubscribe { rid: rid.clone() };
            if self
                .send_locked(st, method(VERB_SUBSCRIBE, &rid), None, completion)
                .is_err()
            {
                st.cache.get_mut(&rid).unwrap().subscribed = false;
            }
        }
    }

    /// Schedules one reconnect attempt after the configured delay, gated
    /// on `try_connect` still holding when the timer fires.
    fn schedule_reconnect(&self) {
        let Some(inner) = self.weak.upgrade() else {
            return;
        };
        let delay = self.cfg.reconnect_delay;
        self.rt.spawn(async move {
            tokio::time::sleep(delay).await;
            let attempt = {
                let mut st = inner.state.lock().unwrap();
                if !st.try_connect || !matches!(st.conn, ConnState::Idle) {
                    return;
                }
                st.conn = ConnState::Connecting;
                st.connect_attempt += 1;
                st.connect_attempt
            };
            tracing::info!("reconnecting");
            inner.clone().run_connect(attempt).await;
        });
    }
}
