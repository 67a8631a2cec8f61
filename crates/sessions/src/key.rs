//! Typed keys and revisions.

use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

/// Names a context entry holding a `V`.
///
/// Keys are usually declared once as constants:
///
/// ```
/// use tether_sessions::Key;
///
/// const LOCALE: Key<String> = Key::new("locale");
/// ```
pub struct Key<V> {
    name: &'static str,
    _marker: PhantomData<fn() -> V>,
}

impl<V> Key<V> {
    /// A key named `name`.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    /// The key's name on the wire.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<V> Clone for Key<V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for Key<V> {}

impl<V> fmt::Debug for Key<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Key").field(&self.name).finish()
    }
}

/// Version of one context entry. Keys never written are at [`Revision::ZERO`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Revision(u64);

impl Revision {
    /// Revision of a key that was never written.
    pub const ZERO: Self = Self(0);

    /// Wrap a raw revision.
    #[must_use]
    pub const fn new(revision: u64) -> Self {
        Self(revision)
    }

    /// The raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The revision after this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}
