//! Persisted containers.
//!
//! - [`PersistedState`]: synchronous media; the stored value is available at
//!   construction
//! - [`AsyncPersistedState`]: the object store; the stored value arrives
//!   after hydration

mod hydrated;
mod persisted;

pub use hydrated::{AsyncPersistedState, Readiness};
pub use persisted::PersistedState;
