//! Session fabric
//!
//! Everything that makes one call hang together: the authoritative
//! [`record::SessionRecord`], the shared [`store::SessionStore`] that
//! synchronizes records across workers, the [`router::TurnRouter`] that
//! serializes turns, and the [`conductor`] that owns the per-call task
//! topology and barge-in semantics.

pub mod conductor;
pub mod record;
pub mod redis;
pub mod router;
pub mod store;

pub use conductor::{ConductorDeps, SessionConductor, SessionHandle};
pub use record::{SessionRecord, SessionState, TerminalReason, TransportKind, TurnRecord};
pub use store::{MemoryStore, SessionStore, StoreError, StoreEvent};
