//! Text serializers for persisted values.
//!
//! Synchronous backends and cookies store text only, so every value passes
//! through a [`Serializer`]. The default is [`JsonSerializer`].

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{PersistError, Result};

/// Converts a value to and from its stored text form.
pub trait Serializer<T>: Send + Sync {
    /// Decode stored text.
    fn parse(&self, raw: &str) -> Result<T>;

    /// Encode a value as text.
    fn stringify(&self, value: &T) -> Result<String>;
}

/// JSON encoding through serde.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl<T> Serializer<T> for JsonSerializer
where
    T: Serialize + DeserializeOwned,
{
    fn parse(&self, raw: &str) -> Result<T> {
        serde_json::from_str(raw).map_err(Into::into)
    }

    fn stringify(&self, value: &T) -> Result<String> {
        serde_json::to_string(value).map_err(Into::into)
    }
}

type ParseFn<T> = dyn Fn(&str) -> std::result::Result<T, String> + Send + Sync;
type StringifyFn<T> = dyn Fn(&T) -> std::result::Result<String, String> + Send + Sync;

/// A serializer built from a pair of closures.
///
/// ```
/// use persisted_state::{FnSerializer, Serializer};
///
/// let s = FnSerializer::new(
///     |raw: &str| raw.parse::<u8>().map_err(|e| e.to_string()),
///     |v: &u8| Ok(v.to_string()),
/// );
/// assert_eq!(s.parse("7").unwrap(), 7);
/// ```
pub struct FnSerializer<T> {
    parse: Arc<ParseFn<T>>,
    stringify: Arc<StringifyFn<T>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> FnSerializer<T> {
    pub fn new<P, S>(parse: P, stringify: S) -> Self
    where
        P: Fn(&str) -> std::result::Result<T, String> + Send + Sync + 'static,
        S: Fn(&T) -> std::result::Result<String, String> + Send + Sync + 'static,
    {
        Self {
            parse: Arc::new(parse),
            stringify: Arc::new(stringify),
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for FnSerializer<T> {
    fn clone(&self) -> Self {
        Self {
            parse: Arc::clone(&self.parse),
            stringify: Arc::clone(&self.stringify),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for FnSerializer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnSerializer").finish_non_exhaustive()
    }
}

impl<T> Serializer<T> for FnSerializer<T> {
    fn parse(&self, raw: &str) -> Result<T> {
        (self.parse)(raw).map_err(PersistError::Serialization)
    }

    fn stringify(&self, value: &T) -> Result<String> {
        (self.stringify)(value).map_err(PersistError::Serialization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Prefs {
        theme: String,
        font_size: u16,
        pinned: Vec<String>,
    }

    #[test]
    fn test_json_stringify_is_plain_json() {
        let prefs = Prefs {
            theme: "dark".into(),
            font_size: 14,
            pinned: vec![],
        };
        let raw = JsonSerializer.stringify(&prefs).unwrap();
        assert_eq!(raw, r#"{"theme":"dark","font_size":14,"pinned":[]}"#);
    }

    #[test]
    fn test_json_parse_error() {
        let result: Result<Prefs> = JsonSerializer.parse("{not json");
        assert!(matches!(result, Err(PersistError::Serialization(_))));
    }

    #[test]
    fn test_fn_serializer_errors_are_mapped() {
        let s = FnSerializer::new(
            |raw: &str| raw.parse::<i32>().map_err(|e| e.to_string()),
            |v: &i32| Ok(format!("{v}")),
        );
        assert_eq!(s.stringify(&-4).unwrap(), "-4");
        assert!(matches!(s.parse("x"), Err(PersistError::Serialization(_))));
    }

    proptest! {
        #[test]
        fn json_round_trip(theme in "[a-z]{0,12}", font_size in any::<u16>(), pinned in proptest::collection::vec(".*", 0..4)) {
            let prefs = Prefs { theme, font_size, pinned };
            let raw = JsonSerializer.stringify(&prefs).unwrap();
            let back: Prefs = JsonSerializer.parse(&raw).unwrap();
            prop_assert_eq!(back, prefs);
        }
    }
}
