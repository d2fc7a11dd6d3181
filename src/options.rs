//! Container configuration.
//!
//! The data half of the options ([`PersistConfig`], [`AsyncPersistConfig`])
//! is plain serde so it can come from a config file; serializers and hooks are
//! attached with builder methods.

use std::fmt;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{error, warn};

use crate::codec::{NativeCodec, TextCodec, ValueCodec};
use crate::cookie::CookieOptions;
use crate::error::PersistError;
use crate::object_store::IndexedDbConfig;
use crate::serializer::{JsonSerializer, Serializer};
use crate::store::StorageType;
use crate::structured::StructuredClone;

/// Callback receiving a recovered error.
pub type ErrorHook = Arc<dyn Fn(&PersistError) + Send + Sync>;

/// Value transform applied around reads or writes.
pub type Transform<T> = Arc<dyn Fn(T) -> T + Send + Sync>;

/// Callback receiving a value.
pub type ValueHook<T> = Arc<dyn Fn(&T) + Send + Sync>;

fn log_write_error() -> ErrorHook {
    Arc::new(|err: &PersistError| warn!(error = %err, "failed to persist value"))
}

fn log_parse_error() -> ErrorHook {
    Arc::new(|err: &PersistError| warn!(error = %err, "failed to parse stored value; using initial value"))
}

fn log_hydration_error() -> ErrorHook {
    Arc::new(|err: &PersistError| error!(error = %err, "hydration failed; value will not be persisted"))
}

/// Hooks shared by both container kinds.
pub(crate) struct Hooks<T> {
    pub on_write_error: ErrorHook,
    pub on_parse_error: ErrorHook,
    pub before_read: Option<Transform<T>>,
    pub before_write: Option<Transform<T>>,
}

impl<T> Default for Hooks<T> {
    fn default() -> Self {
        Self {
            on_write_error: log_write_error(),
            on_parse_error: log_parse_error(),
            before_read: None,
            before_write: None,
        }
    }
}

impl<T> Hooks<T> {
    pub fn read(&self, value: T) -> T {
        match &self.before_read {
            Some(transform) => transform(value),
            None => value,
        }
    }

    pub fn write(&self, value: T) -> T {
        match &self.before_write {
            Some(transform) => transform(value),
            None => value,
        }
    }
}

/// Serializable settings of a synchronous container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    pub storage: StorageType,
    /// Follow writes made by other tabs. Only local storage produces them.
    pub sync_tabs: bool,
    pub cookie: CookieOptions,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            storage: StorageType::Local,
            sync_tabs: true,
            cookie: CookieOptions::default(),
        }
    }
}

/// Options for a [`PersistedState`](crate::PersistedState).
pub struct PersistOptions<T> {
    pub(crate) config: PersistConfig,
    pub(crate) serializer: Arc<dyn Serializer<T>>,
    pub(crate) hooks: Hooks<T>,
}

impl<T> PersistOptions<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    /// Local storage, JSON text, cross-tab sync on.
    pub fn new() -> Self {
        Self::with_serializer(JsonSerializer)
    }

    pub fn from_config(config: PersistConfig) -> Self {
        Self::new().config(config)
    }
}

impl<T> Default for PersistOptions<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PersistOptions<T> {
    /// Options using a custom serializer, for types without serde support.
    pub fn with_serializer(serializer: impl Serializer<T> + 'static) -> Self {
        Self {
            config: PersistConfig::default(),
            serializer: Arc::new(serializer),
            hooks: Hooks::default(),
        }
    }

    pub fn config(mut self, config: PersistConfig) -> Self {
        self.config = config;
        self
    }

    pub fn storage(mut self, storage: StorageType) -> Self {
        self.config.storage = storage;
        self
    }

    pub fn sync_tabs(mut self, enabled: bool) -> Self {
        self.config.sync_tabs = enabled;
        self
    }

    pub fn cookie_options(mut self, options: CookieOptions) -> Self {
        self.config.cookie = options;
        self
    }

    pub fn serializer(mut self, serializer: impl Serializer<T> + 'static) -> Self {
        self.serializer = Arc::new(serializer);
        self
    }

    pub fn on_write_error(mut self, hook: impl Fn(&PersistError) + Send + Sync + 'static) -> Self {
        self.hooks.on_write_error = Arc::new(hook);
        self
    }

    pub fn on_parse_error(mut self, hook: impl Fn(&PersistError) + Send + Sync + 'static) -> Self {
        self.hooks.on_parse_error = Arc::new(hook);
        self
    }

    /// Transform values after they are read from storage or another tab.
    pub fn before_read(mut self, transform: impl Fn(T) -> T + Send + Sync + 'static) -> Self {
        self.hooks.before_read = Some(Arc::new(transform));
        self
    }

    /// Transform values before they are written to storage.
    pub fn before_write(mut self, transform: impl Fn(T) -> T + Send + Sync + 'static) -> Self {
        self.hooks.before_write = Some(Arc::new(transform));
        self
    }

    pub fn settings(&self) -> &PersistConfig {
        &self.config
    }
}

impl<T> fmt::Debug for PersistOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistOptions")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Serializable settings of an asynchronous container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AsyncPersistConfig {
    pub indexed_db: IndexedDbConfig,
    /// Follow writes made by other containers on the same database.
    pub sync_tabs: bool,
}

impl Default for AsyncPersistConfig {
    fn default() -> Self {
        Self {
            indexed_db: IndexedDbConfig::default(),
            sync_tabs: true,
        }
    }
}

/// Options for an [`AsyncPersistedState`](crate::AsyncPersistedState).
pub struct AsyncPersistOptions<T> {
    pub(crate) config: AsyncPersistConfig,
    pub(crate) codec: Arc<dyn ValueCodec<T>>,
    pub(crate) hooks: Hooks<T>,
    pub(crate) on_hydrated: Option<ValueHook<T>>,
    pub(crate) on_hydration_error: ErrorHook,
}

impl<T> AsyncPersistOptions<T>
where
    T: StructuredClone + 'static,
{
    /// Native structured storage, default database, sync on.
    pub fn native() -> Self {
        Self::with_codec(Arc::new(NativeCodec::<T>::new()))
    }
}

impl<T> Default for AsyncPersistOptions<T>
where
    T: StructuredClone + 'static,
{
    fn default() -> Self {
        Self::native()
    }
}

impl<T: 'static> AsyncPersistOptions<T> {
    /// Store values as serializer text instead of structured values.
    pub fn with_serializer(serializer: impl Serializer<T> + 'static) -> Self {
        Self::with_codec(Arc::new(TextCodec::new(Arc::new(serializer))))
    }

    fn with_codec(codec: Arc<dyn ValueCodec<T>>) -> Self {
        Self {
            config: AsyncPersistConfig::default(),
            codec,
            hooks: Hooks::default(),
            on_hydrated: None,
            on_hydration_error: log_hydration_error(),
        }
    }
}

impl<T> AsyncPersistOptions<T> {
    pub fn config(mut self, config: AsyncPersistConfig) -> Self {
        self.config = config;
        self
    }

    pub fn indexed_db(mut self, indexed_db: IndexedDbConfig) -> Self {
        self.config.indexed_db = indexed_db;
        self
    }

    pub fn sync_tabs(mut self, enabled: bool) -> Self {
        self.config.sync_tabs = enabled;
        self
    }

    pub fn on_write_error(mut self, hook: impl Fn(&PersistError) + Send + Sync + 'static) -> Self {
        self.hooks.on_write_error = Arc::new(hook);
        self
    }

    pub fn on_parse_error(mut self, hook: impl Fn(&PersistError) + Send + Sync + 'static) -> Self {
        self.hooks.on_parse_error = Arc::new(hook);
        self
    }

    pub fn on_hydrated(mut self, hook: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_hydrated = Some(Arc::new(hook));
        self
    }

    pub fn on_hydration_error(
        mut self,
        hook: impl Fn(&PersistError) + Send + Sync + 'static,
    ) -> Self {
        self.on_hydration_error = Arc::new(hook);
        self
    }

    pub fn before_read(mut self, transform: impl Fn(T) -> T + Send + Sync + 'static) -> Self {
        self.hooks.before_read = Some(Arc::new(transform));
        self
    }

    pub fn before_write(mut self, transform: impl Fn(T) -> T + Send + Sync + 'static) -> Self {
        self.hooks.before_write = Some(Arc::new(transform));
        self
    }

    pub fn settings(&self) -> &AsyncPersistConfig {
        &self.config
    }

    /// Whether values will be stored as text.
    pub fn is_textual(&self) -> bool {
        self.codec.is_textual()
    }
}

impl<T> fmt::Debug for AsyncPersistOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncPersistOptions")
            .field("config", &self.config)
            .field("textual", &self.codec.is_textual())
            .finish_non_exhaustive()
    }
}
