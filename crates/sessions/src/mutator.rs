//! Transaction-local changes and their wire form.

use std::collections::{BTreeMap, BTreeSet};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tether_rpc::{SerializationFormat, SerializedPayload};

use crate::context::{Context, decode, encode};
use crate::error::Result;
use crate::key::{Key, Revision};

/// A change to one entry, carrying the revision it was based on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modification {
    /// Store a value.
    Set {
        /// Revision the writer saw.
        old_revision: Revision,
        /// Revision the entry takes.
        new_revision: Revision,
        /// The encoded value.
        new_value: SerializedPayload,
    },
    /// Delete the entry.
    Remove {
        /// Revision the writer saw.
        old_revision: Revision,
    },
}

impl Modification {
    /// Revision the change expects to replace.
    #[must_use]
    pub const fn old_revision(&self) -> Revision {
        match self {
            Self::Set { old_revision, .. } | Self::Remove { old_revision } => *old_revision,
        }
    }
}

/// Everything one transaction changed, sent to the peer as a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingContextUpdate {
    /// Changes by key.
    pub modifications: BTreeMap<String, Modification>,
}

impl OutgoingContextUpdate {
    /// Whether the update changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modifications.is_empty()
    }

    /// Names of the changed keys.
    #[must_use]
    pub fn keys(&self) -> BTreeSet<String> {
        self.modifications.keys().cloned().collect()
    }
}

/// The receiver's verdict on an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOutcome {
    /// Applied.
    Accepted,
    /// Rejected; the sender should retry from a fresh snapshot.
    Conflict {
        /// Keys that caused the rejection.
        keys: Vec<String>,
    },
}

/// Records changes against a snapshot during a transaction.
///
/// Reads see the transaction's own writes first, then the snapshot.
#[derive(Debug)]
pub struct Mutator<'a> {
    base: &'a Context,
    format: SerializationFormat,
    changes: BTreeMap<String, Modification>,
}

impl<'a> Mutator<'a> {
    pub(crate) const fn new(base: &'a Context, format: SerializationFormat) -> Self {
        Self {
            base,
            format,
            changes: BTreeMap::new(),
        }
    }

    /// Current value of `key` within this transaction.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SessionError::Codec`] if the value is not a `V`.
    pub fn get<V: DeserializeOwned>(&self, key: &Key<V>) -> Result<Option<V>> {
        match self.changes.get(key.name()) {
            Some(Modification::Set { new_value, .. }) => decode(key.name(), new_value).map(Some),
            Some(Modification::Remove { .. }) => Ok(None),
            None => self.base.get(key),
        }
    }

    /// Store `value` under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SessionError::Codec`] if the value cannot be encoded.
    pub fn set<V: Serialize>(&mut self, key: &Key<V>, value: &V) -> Result<()> {
        let old_revision = self.base.revision(key.name());
        let new_value = encode(key.name(), self.format, value)?;
        self.changes.insert(
            key.name().to_string(),
            Modification::Set {
                old_revision,
                new_revision: old_revision.next(),
                new_value,
            },
        );
        Ok(())
    }

    /// Delete `key`. Removing a key the snapshot lacks only drops any
    /// pending write to it.
    pub fn remove<V>(&mut self, key: &Key<V>) {
        if self.base.contains(key.name()) {
            self.changes.insert(
                key.name().to_string(),
                Modification::Remove {
                    old_revision: self.base.revision(key.name()),
                },
            );
        } else {
            self.changes.remove(key.name());
        }
    }

    /// Whether nothing was changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub(crate) fn into_update(self) -> OutgoingContextUpdate {
        OutgoingContextUpdate {
            modifications: self.changes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NAME: Key<String> = Key::new("name");
    const VISITS: Key<u32> = Key::new("visits");

    #[test]
    fn test_reads_see_own_writes() {
        let base = Context::new();
        let mut mutator = Mutator::new(&base, SerializationFormat::CBOR);
        assert_eq!(mutator.get(&NAME).unwrap(), None);

        mutator.set(&NAME, &"ada".to_string()).unwrap();
        assert_eq!(mutator.get(&NAME).unwrap().as_deref(), Some("ada"));
        assert!(base.is_empty());
    }

    #[test]
    fn test_update_carries_revisions() {
        let base = Context::new();
        let mut mutator = Mutator::new(&base, SerializationFormat::JSON);
        mutator.set(&VISITS, &3).unwrap();
        let first = Context::new().apply(&mutator.into_update());

        let mut mutator = Mutator::new(&first, SerializationFormat::JSON);
        mutator.set(&VISITS, &4).unwrap();
        mutator.remove(&NAME);
        let update = mutator.into_update();

        assert_eq!(update.keys().into_iter().collect::<Vec<_>>(), vec!["visits"]);
        match &update.modifications["visits"] {
            Modification::Set {
                old_revision,
                new_revision,
                ..
            } => {
                assert_eq!(*old_revision, Revision::new(1));
                assert_eq!(*new_revision, Revision::new(2));
            }
            Modification::Remove { .. } => panic!("expected a set"),
        }
    }

    #[test]
    fn test_remove_existing_and_new_keys() {
        let empty = Context::new();
        let mut seed = Mutator::new(&empty, SerializationFormat::CBOR);
        seed.set(&NAME, &"ada".to_string()).unwrap();
        let base = empty.apply(&seed.into_update());

        let mut mutator = Mutator::new(&base, SerializationFormat::CBOR);
        mutator.set(&VISITS, &1).unwrap();
        mutator.remove(&VISITS);
        mutator.remove(&NAME);
        assert_eq!(mutator.get(&NAME).unwrap(), None);

        let update = mutator.into_update();
        assert_eq!(update.modifications.len(), 1);
        assert_eq!(
            update.modifications["name"],
            Modification::Remove {
                old_revision: Revision::new(1)
            }
        );
    }

    #[test]
    fn test_set_after_remove_continues_revisions() {
        let empty = Context::new();
        let mut seed = Mutator::new(&empty, SerializationFormat::CBOR);
        seed.set(&NAME, &"ada".to_string()).unwrap();
        let base = empty.apply(&seed.into_update());

        let mut removal = Mutator::new(&base, SerializationFormat::CBOR);
        removal.remove(&NAME);
        let removed = base.apply(&removal.into_update());

        let mut mutator = Mutator::new(&removed, SerializationFormat::CBOR);
        assert_eq!(mutator.get(&NAME).unwrap(), None);
        mutator.set(&NAME, &"grace".to_string()).unwrap();
        match &mutator.into_update().modifications["name"] {
            Modification::Set {
                old_revision,
                new_revision,
                ..
            } => {
                assert_eq!(*old_revision, Revision::new(2));
                assert_eq!(*new_revision, Revision::new(3));
            }
            Modification::Remove { .. } => panic!("expected a set"),
        }
    }
}
