//! # persisted-state
//!
//! Reactive values persisted to browser storage media and kept consistent
//! across reloads and across tabs of the same origin.
//!
//! - **Synchronous media**: local storage, session storage and cookies, read
//!   at construction and written through on every mutation
//! - **Object store**: structured values, hydrated asynchronously with a
//!   readiness signal
//! - **Cross-tab sync**: storage change events for local storage, broadcast
//!   channels for the object store
//!
//! The browser is modelled by an [`Origin`] (media shared by all tabs) and
//! its [`Tab`]s (session storage, connection cache).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use persisted_state::{Origin, PersistOptions, PersistedState};
//!
//! #[tokio::main]
//! async fn main() {
//!     let origin = Origin::new("https://app.example");
//!     let tab = origin.open_tab();
//!
//!     let theme = PersistedState::new(&tab, "theme", "light".to_string(), PersistOptions::new());
//!     theme.set("dark".to_string());
//!
//!     // A reload sees the stored value immediately.
//!     let reloaded = PersistedState::new(&tab, "theme", "light".to_string(), PersistOptions::new());
//!     assert_eq!(reloaded.get(), "dark");
//! }
//! ```
//!
//! ## Object Store
//!
//! ```rust,no_run
//! use std::collections::HashSet;
//! use persisted_state::{AsyncPersistOptions, AsyncPersistedState, Origin};
//!
//! #[tokio::main]
//! async fn main() -> persisted_state::Result<()> {
//!     let origin = Origin::new("https://app.example");
//!     let tab = origin.open_tab();
//!
//!     let seen = AsyncPersistedState::new(
//!         &tab,
//!         "seen-ids",
//!         HashSet::<u32>::new(),
//!         AsyncPersistOptions::native(),
//!     );
//!     assert!(seen.is_loading());
//!
//!     let hydrated = seen.ready().await?;
//!     seen.update(|ids| {
//!         ids.insert(hydrated.len() as u32);
//!     });
//!     seen.flush().await;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod cookie;
pub mod error;
pub mod memory;
pub mod object_store;
pub mod options;
pub mod origin;
pub mod serializer;
pub mod state;
pub mod store;
pub mod structured;
pub mod watch;

// Re-export main types
pub use codec::{NativeCodec, TextCodec, ValueCodec};
pub use cookie::{CookieJar, CookieOptions, CookieStorage, SameSite, MAX_COOKIE_DAYS};
pub use error::{PersistError, Result};
pub use memory::{StorageArea, WebStorage};
pub use object_store::{
    Connection, ConnectionLease, ConnectionRegistry, DatabaseFactory, IndexedDbConfig,
    ObjectStoreBackend,
};
pub use options::{AsyncPersistConfig, AsyncPersistOptions, PersistConfig, PersistOptions};
pub use origin::{Origin, OriginConfig, Tab, TabId};
pub use serializer::{FnSerializer, JsonSerializer, Serializer};
pub use state::{AsyncPersistedState, PersistedState, Readiness};
pub use store::{AsyncStorageBackend, StorageBackend, StorageType};
pub use structured::{Pattern, StructuredClone, StructuredValue};
pub use watch::{
    AreaKind, BroadcastChannel, BroadcastHub, EchoGuard, Lagged, StorageEvent, StorageEventBus,
    StorageEventStream, SyncMessage,
};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::error::{PersistError, Result};
    pub use crate::options::{AsyncPersistOptions, PersistOptions};
    pub use crate::origin::{Origin, Tab};
    pub use crate::state::{AsyncPersistedState, PersistedState};
    pub use crate::store::{AsyncStorageBackend, StorageBackend, StorageType};
    pub use crate::structured::{StructuredClone, StructuredValue};
}
