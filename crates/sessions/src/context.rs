//! Committed session state.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tether_rpc::{SerializationFormat, SerializedPayload};

use crate::error::{Result, SessionError};
use crate::key::{Key, Revision};
use crate::mutator::{Modification, OutgoingContextUpdate};

/// One stored value and the revision it was written at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEntry {
    /// Revision of the write that produced `value`.
    pub revision: Revision,
    /// The encoded value.
    pub value: SerializedPayload,
}

/// An immutable snapshot of the session's key-value state.
///
/// Values stay encoded until read, so a snapshot can hold entries written
/// by a peer that uses another payload format.
///
/// Removed keys leave a tombstone behind: their revision keeps counting up
/// when they are written again.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    entries: HashMap<String, ContextEntry>,
    tombstones: HashMap<String, Revision>,
}

impl Context {
    /// An empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Codec`] if the stored value is not a `V`.
    pub fn get<V: DeserializeOwned>(&self, key: &Key<V>) -> Result<Option<V>> {
        self.entries
            .get(key.name())
            .map(|entry| decode(key.name(), &entry.value))
            .transpose()
    }

    /// Revision of `name`. A removed key reports the revision of its
    /// removal, a key never written [`Revision::ZERO`].
    #[must_use]
    pub fn revision(&self, name: &str) -> Revision {
        self.entries
            .get(name)
            .map(|entry| entry.revision)
            .or_else(|| self.tombstones.get(name).copied())
            .unwrap_or(Revision::ZERO)
    }

    /// The raw entry under `name`.
    #[must_use]
    pub fn entry(&self, name: &str) -> Option<&ContextEntry> {
        self.entries.get(name)
    }

    /// Whether `name` holds a value.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of every stored entry, in no particular order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Keys of `update` whose expected revision differs from the stored one.
    pub(crate) fn stale_keys(&self, update: &OutgoingContextUpdate) -> Vec<String> {
        update
            .modifications
            .iter()
            .filter(|(name, modification)| self.revision(name) != modification.old_revision())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// A copy with `update` applied. Revisions are not checked here.
    #[must_use]
    pub(crate) fn apply(&self, update: &OutgoingContextUpdate) -> Self {
        let mut entries = self.entries.clone();
        let mut tombstones = self.tombstones.clone();
        for (name, modification) in &update.modifications {
            match modification {
                Modification::Set {
                    new_revision,
                    new_value,
                    ..
                } => {
                    tombstones.remove(name);
                    entries.insert(
                        name.clone(),
                        ContextEntry {
                            revision: *new_revision,
                            value: new_value.clone(),
                        },
                    );
                }
                Modification::Remove { old_revision } => {
                    entries.remove(name);
                    tombstones.insert(name.clone(), old_revision.next());
                }
            }
        }
        Self {
            entries,
            tombstones,
        }
    }
}

pub(crate) fn encode<V: Serialize>(
    name: &str,
    format: SerializationFormat,
    value: &V,
) -> Result<SerializedPayload> {
    format.encode(value).map_err(|source| SessionError::Codec {
        key: name.to_string(),
        source,
    })
}

pub(crate) fn decode<V: DeserializeOwned>(name: &str, payload: &SerializedPayload) -> Result<V> {
    SerializationFormat::decode(payload).map_err(|source| SessionError::Codec {
        key: name.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    const COLOR: Key<String> = Key::new("color");

    fn set(old: u64, value: &str) -> Modification {
        Modification::Set {
            old_revision: Revision::new(old),
            new_revision: Revision::new(old + 1),
            new_value: SerializationFormat::CBOR.encode(value).unwrap(),
        }
    }

    fn update(
        modifications: impl IntoIterator<Item = (&'static str, Modification)>,
    ) -> OutgoingContextUpdate {
        OutgoingContextUpdate {
            modifications: modifications
                .into_iter()
                .map(|(name, m)| (name.to_string(), m))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn test_apply_set_then_remove() {
        let context = Context::new().apply(&update([("color", set(0, "red"))]));
        assert_eq!(context.get(&COLOR).unwrap().as_deref(), Some("red"));
        assert_eq!(context.revision("color"), Revision::new(1));

        let context = context.apply(&update([(
            "color",
            Modification::Remove {
                old_revision: Revision::new(1),
            },
        )]));
        assert!(context.is_empty());
        assert!(!context.contains("color"));
        assert_eq!(context.revision("color"), Revision::new(2));
    }

    #[test]
    fn test_revision_keeps_rising_after_remove() {
        let removed = Context::new()
            .apply(&update([("color", set(0, "red"))]))
            .apply(&update([(
                "color",
                Modification::Remove {
                    old_revision: Revision::new(1),
                },
            )]));

        // Writers that saw the key before it was removed, or never saw it.
        assert_eq!(
            removed.stale_keys(&update([("color", set(1, "green"))])),
            vec!["color".to_string()]
        );
        assert_eq!(
            removed.stale_keys(&update([("color", set(0, "blue"))])),
            vec!["color".to_string()]
        );

        let rewritten = removed.apply(&update([("color", set(2, "blue"))]));
        assert_eq!(rewritten.revision("color"), Revision::new(3));
        assert_eq!(rewritten.get(&COLOR).unwrap().as_deref(), Some("blue"));
        assert_eq!(rewritten.len(), 1);
    }

    #[test]
    fn test_stale_keys() {
        let context = Context::new().apply(&update([("color", set(0, "red"))]));

        assert!(context.stale_keys(&update([("color", set(1, "blue"))])).is_empty());
        assert_eq!(
            context.stale_keys(&update([("color", set(0, "blue")), ("size", set(0, "xl"))])),
            vec!["color".to_string()]
        );
    }

    #[test]
    fn test_wrong_type_is_a_codec_error() {
        let context = Context::new().apply(&update([("color", set(0, "red"))]));
        let as_number: Key<u64> = Key::new("color");
        assert!(matches!(
            context.get(&as_number),
            Err(SessionError::Codec { key, .. }) if key == "color"
        ));
    }
}
