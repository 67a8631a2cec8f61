//! Observers of session changes.

use std::collections::BTreeSet;

use crate::session::Session;

/// Where a committed change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModificationOrigin {
    /// A transaction on this side.
    Local,
    /// An update from the peer.
    Remote,
}

/// Told about every committed change of a session.
///
/// Callbacks run on the committing task after the new snapshot is visible;
/// they must not block.
pub trait SessionPlugin: Send + Sync + 'static {
    /// Keys in `keys` changed.
    fn on_modified(&self, session: &Session, keys: &BTreeSet<String>, origin: ModificationOrigin);

    /// The connection closed and the context was emptied.
    fn on_cleared(&self, _session: &Session) {}
}
