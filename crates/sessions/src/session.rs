//! The per-connection session and its transaction protocol.
//!
//! Each side keeps a full copy of the context. A transaction runs against
//! the latest snapshot, and the resulting [`OutgoingContextUpdate`] is sent
//! to the peer over a dedicated Single call. The peer applies it only if
//! every expected revision still matches; otherwise the transaction is
//! retried from a fresh snapshot.
//!
//! When both sides change the same key at once each sees the other's
//! update while its own is in flight. The accepting side keeps its own
//! write and rejects the peer's; the connecting side yields.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use tether_rpc::{NodeRole, RpcTransport, SerializationFormat, SingleCallDescription};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tracing::{debug, instrument, warn};

use crate::config::SessionConfig;
use crate::context::Context;
use crate::error::{Result, SessionError};
use crate::key::Key;
use crate::mutator::{Mutator, OutgoingContextUpdate, UpdateOutcome};
use crate::plugin::{ModificationOrigin, SessionPlugin};

/// Service carrying context updates between peers.
pub const SESSION_SERVICE: &str = "tether.session";

pub(crate) fn update_call() -> SingleCallDescription<OutgoingContextUpdate, UpdateOutcome> {
    SingleCallDescription::new(SESSION_SERVICE, "update")
}

tokio::task_local! {
    static CURRENT: Session;
}

struct Inner {
    role: NodeRole,
    format: SerializationFormat,
    config: SessionConfig,
    plugins: Vec<Arc<dyn SessionPlugin>>,
    snapshot: ArcSwap<Context>,
    /// Serializes local transactions.
    writer: AsyncMutex<()>,
    /// Keys of the local update in flight. Snapshot stores happen under
    /// this lock.
    pending: Mutex<BTreeSet<String>>,
    in_flight: watch::Sender<bool>,
    transport: RwLock<Option<RpcTransport>>,
}

/// Replicated key-value state shared with the peer of one connection.
///
/// Cheap to clone; every clone is the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    pub(crate) fn new(
        role: NodeRole,
        format: SerializationFormat,
        config: SessionConfig,
        plugins: Vec<Arc<dyn SessionPlugin>>,
        transport: Option<RpcTransport>,
    ) -> Self {
        let (in_flight, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                role,
                format,
                config,
                plugins,
                snapshot: ArcSwap::from_pointee(Context::new()),
                writer: AsyncMutex::new(()),
                pending: Mutex::new(BTreeSet::new()),
                in_flight,
                transport: RwLock::new(transport),
            }),
        }
    }

    /// The session of the connection whose incoming call is running, if
    /// any. Set for the duration of a handler's future; streams it returns
    /// are polled outside of it.
    #[must_use]
    pub fn current() -> Option<Self> {
        CURRENT.try_with(Clone::clone).ok()
    }

    /// Which end of the connection this session is on.
    #[must_use]
    pub fn role(&self) -> NodeRole {
        self.inner.role
    }

    /// The last committed snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Context> {
        self.inner.snapshot.load_full()
    }

    /// Read `key` from the last committed snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Codec`] if the stored value is not a `V`.
    pub fn get<V: DeserializeOwned>(&self, key: &Key<V>) -> Result<Option<V>> {
        self.inner.snapshot.load().get(key)
    }

    /// Whether the session can still reach its peer.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.transport.read().is_some()
    }

    /// Whether a local update is waiting for the peer.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        *self.inner.in_flight.borrow()
    }

    /// Wait until no local update is in flight.
    pub async fn settled(&self) {
        let mut in_flight = self.inner.in_flight.subscribe();
        let _ = in_flight.wait_for(|busy| !*busy).await;
    }

    /// Run `body` against the current context and commit its changes on
    /// both sides.
    ///
    /// `body` runs again on a fresh snapshot whenever the peer rejects the
    /// update, so it should only read and write through the [`Mutator`].
    /// Transactions on one session run one at a time.
    ///
    /// # Errors
    ///
    /// Whatever `body` returns, [`SessionError::ConflictRetriesExhausted`]
    /// once the configured number of consecutive conflicts is reached,
    /// [`SessionError::Closed`] if the connection is gone, or
    /// [`SessionError::Rpc`] if the update could not be delivered.
    #[instrument(skip_all, fields(role = %self.inner.role))]
    pub async fn transaction<R, F>(&self, mut body: F) -> Result<R>
    where
        F: FnMut(&mut Mutator<'_>) -> Result<R>,
    {
        let _writer = self.inner.writer.lock().await;
        let mut conflicts = 0;

        loop {
            let base = self.inner.snapshot.load_full();
            let mut mutator = Mutator::new(&base, self.inner.format);
            let result = body(&mut mutator)?;
            let update = mutator.into_update();
            if update.is_empty() {
                return Ok(result);
            }

            let keys = match self.commit(update).await? {
                UpdateOutcome::Accepted => return Ok(result),
                UpdateOutcome::Conflict { keys } => keys,
            };

            conflicts += 1;
            if conflicts >= self.inner.config.max_conflict_retries {
                warn!("Giving up after {conflicts} conflicts on {keys:?}");
                return Err(SessionError::ConflictRetriesExhausted {
                    attempts: conflicts,
                    keys,
                });
            }
            debug!("Update conflicted on {keys:?}, retry {conflicts}");
            tokio::time::sleep(self.inner.config.conflict_backoff).await;
        }
    }

    async fn commit(&self, update: OutgoingContextUpdate) -> Result<UpdateOutcome> {
        let transport = self
            .inner
            .transport
            .read()
            .clone()
            .ok_or(SessionError::Closed)?;
        let keys = update.keys();

        let guard = {
            let mut pending = self.inner.pending.lock();
            let stale = self.inner.snapshot.load().stale_keys(&update);
            if !stale.is_empty() {
                return Ok(UpdateOutcome::Conflict { keys: stale });
            }
            pending.clone_from(&keys);
            self.inner.in_flight.send_replace(true);
            PendingGuard { inner: &self.inner }
        };

        let outcome = transport.single_call(&update_call(), update.clone()).await;
        let accepted = matches!(outcome, Ok(UpdateOutcome::Accepted));
        if accepted {
            // Peer updates to these keys were refused while ours was in
            // flight, so applying on top of the current snapshot is safe.
            let mut pending = self.inner.pending.lock();
            let next = self.inner.snapshot.load().apply(&update);
            self.inner.snapshot.store(Arc::new(next));
            pending.clear();
        }
        drop(guard);

        if accepted {
            debug!("Committed {} keys", keys.len());
            self.notify(&keys, ModificationOrigin::Local);
        }
        outcome.map_err(SessionError::from)
    }

    /// Apply an update the peer sent.
    pub(crate) fn apply_remote(&self, update: &OutgoingContextUpdate) -> UpdateOutcome {
        let keys = update.keys();
        {
            let pending = self.inner.pending.lock();
            let current = self.inner.snapshot.load();
            let mut conflicts = current.stale_keys(update);
            if conflicts.is_empty() && self.inner.role == NodeRole::Server {
                conflicts = keys.intersection(&pending).cloned().collect();
            }
            if !conflicts.is_empty() {
                debug!("Rejecting peer update on {conflicts:?}");
                return UpdateOutcome::Conflict { keys: conflicts };
            }
            self.inner.snapshot.store(Arc::new(current.apply(update)));
        }

        debug!("Applied peer update of {} keys", keys.len());
        self.notify(&keys, ModificationOrigin::Remote);
        UpdateOutcome::Accepted
    }

    /// Forget the peer and empty the context.
    pub(crate) fn clear(&self) {
        self.inner.transport.write().take();
        {
            let mut pending = self.inner.pending.lock();
            pending.clear();
            self.inner.snapshot.store(Arc::new(Context::new()));
        }
        self.inner.in_flight.send_replace(false);

        for plugin in &self.inner.plugins {
            plugin.on_cleared(self);
        }
        debug!("Session cleared");
    }

    /// Run `future` with this session as [`Session::current`].
    pub(crate) fn scope<F: Future>(&self, future: F) -> impl Future<Output = F::Output> {
        CURRENT.scope(self.clone(), future)
    }

    fn notify(&self, keys: &BTreeSet<String>, origin: ModificationOrigin) {
        for plugin in &self.inner.plugins {
            plugin.on_modified(self, keys, origin);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.inner.role)
            .field("entries", &self.inner.snapshot.load().len())
            .field("pending", &self.is_pending())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

/// Marks the local update as settled when the commit ends, however it ends.
struct PendingGuard<'a> {
    inner: &'a Inner,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending.lock().clear();
        self.inner.in_flight.send_replace(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Revision;
    use crate::mutator::Modification;
    use parking_lot::Mutex as SyncMutex;

    const COLOR: Key<String> = Key::new("color");

    fn session(role: NodeRole) -> Session {
        Session::new(
            role,
            SerializationFormat::CBOR,
            SessionConfig::default(),
            Vec::new(),
            None,
        )
    }

    fn set(old: u64, value: &str) -> OutgoingContextUpdate {
        let mut update = OutgoingContextUpdate::default();
        update.modifications.insert(
            "color".to_string(),
            Modification::Set {
                old_revision: Revision::new(old),
                new_revision: Revision::new(old + 1),
                new_value: SerializationFormat::CBOR.encode(value).unwrap(),
            },
        );
        update
    }

    #[test]
    fn test_peer_updates_advance_revisions() {
        let session = session(NodeRole::Client);

        assert_eq!(session.apply_remote(&set(0, "red")), UpdateOutcome::Accepted);
        assert_eq!(session.apply_remote(&set(1, "blue")), UpdateOutcome::Accepted);
        assert_eq!(session.get(&COLOR).unwrap().as_deref(), Some("blue"));
        assert_eq!(session.snapshot().revision("color"), Revision::new(2));
    }

    #[test]
    fn test_stale_peer_update_is_rejected() {
        let session = session(NodeRole::Server);
        session.apply_remote(&set(0, "red"));
        session.apply_remote(&set(1, "blue"));

        assert_eq!(
            session.apply_remote(&set(1, "green")),
            UpdateOutcome::Conflict {
                keys: vec!["color".to_string()]
            }
        );
        assert_eq!(session.get(&COLOR).unwrap().as_deref(), Some("blue"));
    }

    #[test]
    fn test_stale_update_after_remove_is_rejected() {
        let session = session(NodeRole::Client);
        let mut remove = OutgoingContextUpdate::default();
        remove.modifications.insert(
            "color".to_string(),
            Modification::Remove {
                old_revision: Revision::new(1),
            },
        );

        assert_eq!(session.apply_remote(&set(0, "red")), UpdateOutcome::Accepted);
        assert_eq!(session.apply_remote(&remove), UpdateOutcome::Accepted);
        assert_eq!(session.snapshot().revision("color"), Revision::new(2));

        // Based on a snapshot from before the key ever existed.
        assert!(matches!(
            session.apply_remote(&set(0, "blue")),
            UpdateOutcome::Conflict { .. }
        ));
        assert_eq!(session.apply_remote(&set(2, "blue")), UpdateOutcome::Accepted);
        assert_eq!(session.snapshot().revision("color"), Revision::new(3));

        // Based on the value that was removed.
        assert_eq!(
            session.apply_remote(&set(1, "green")),
            UpdateOutcome::Conflict {
                keys: vec!["color".to_string()]
            }
        );
        assert_eq!(session.get(&COLOR).unwrap().as_deref(), Some("blue"));
    }

    #[test]
    fn test_overlap_with_pending_update_depends_on_role() {
        for (role, expected_accept) in [(NodeRole::Server, false), (NodeRole::Client, true)] {
            let session = session(role);
            session.inner.pending.lock().insert("color".to_string());

            let outcome = session.apply_remote(&set(0, "red"));
            assert_eq!(outcome == UpdateOutcome::Accepted, expected_accept, "{role}");
        }
    }

    #[tokio::test]
    async fn test_transaction_without_peer_fails_closed() {
        let session = session(NodeRole::Client);
        let result = session
            .transaction(|m| m.set(&COLOR, &"red".to_string()))
            .await;

        assert!(matches!(result, Err(SessionError::Closed)));
        assert!(session.snapshot().is_empty());
        assert!(!session.is_pending());
    }

    #[tokio::test]
    async fn test_read_only_transaction_needs_no_peer() {
        let session = session(NodeRole::Client);
        session.apply_remote(&set(0, "red"));

        let color = session.transaction(|m| m.get(&COLOR)).await.unwrap();
        assert_eq!(color.as_deref(), Some("red"));
    }

    struct Recorder(SyncMutex<Vec<String>>);

    impl SessionPlugin for Recorder {
        fn on_modified(
            &self,
            _session: &Session,
            keys: &BTreeSet<String>,
            origin: ModificationOrigin,
        ) {
            self.0.lock().push(format!("{origin:?} {keys:?}"));
        }

        fn on_cleared(&self, _session: &Session) {
            self.0.lock().push("cleared".to_string());
        }
    }

    #[test]
    fn test_clear_empties_and_notifies() {
        let recorder = Arc::new(Recorder(SyncMutex::new(Vec::new())));
        let session = Session::new(
            NodeRole::Client,
            SerializationFormat::CBOR,
            SessionConfig::default(),
            vec![Arc::clone(&recorder) as Arc<dyn SessionPlugin>],
            None,
        );

        session.apply_remote(&set(0, "red"));
        session.clear();

        assert!(session.snapshot().is_empty());
        assert_eq!(
            *recorder.0.lock(),
            vec!["Remote {\"color\"}".to_string(), "cleared".to_string()]
        );
    }

    #[tokio::test]
    async fn test_current_is_bound_inside_scope() {
        assert!(Session::current().is_none());

        let session = session(NodeRole::Server);
        let role = session
            .scope(async { Session::current().map(|s| s.role()) })
            .await;
        assert_eq!(role, Some(NodeRole::Server));
    }
}
