//! Session context synchronized between the two ends of a connection.
//!
//! Installing [`SessionSync`] on both nodes gives every connection a
//! [`Session`]: a typed key-value context that both sides read locally and
//! change through transactions. Each entry carries a [`Revision`]; an
//! update only applies when the revisions it was based on are still
//! current, and conflicting transactions retry from a fresh snapshot.
//!
//! Outgoing calls wait for any update in flight, so the peer always sees a
//! context change before the calls that follow it.
//!
//! ```ignore
//! const LOCALE: Key<String> = Key::new("locale");
//!
//! let client = NodeBuilder::new().extension(SessionSync::new()).connect(connection).await?;
//! let session = client.extension::<SessionExtension>().map(|e| e.session().clone());
//! session.transaction(|m| m.set(&LOCALE, &"fr".to_string())).await?;
//! ```
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod config;
mod context;
pub mod error;
mod extension;
mod key;
mod mutator;
mod plugin;
mod session;

pub use config::SessionConfig;
pub use context::{Context, ContextEntry};
pub use error::{Result, SessionError};
pub use extension::{SESSION_EXTENSION, SessionExtension, SessionSync};
pub use key::{Key, Revision};
pub use mutator::{Modification, Mutator, OutgoingContextUpdate, UpdateOutcome};
pub use plugin::{ModificationOrigin, SessionPlugin};
pub use session::{SESSION_SERVICE, Session};
