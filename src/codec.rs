//! How values reach the object store.
//!
//! Without a serializer, values go in as native structured values
//! ([`NativeCodec`]). Supplying a serializer forces text ([`TextCodec`]).

use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{PersistError, Result};
use crate::serializer::Serializer;
use crate::structured::{StructuredClone, StructuredValue};

/// Encodes values for, and decodes them from, the object store.
pub trait ValueCodec<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<StructuredValue>;

    fn decode(&self, stored: StructuredValue) -> Result<T>;

    /// Whether values are stored as text.
    fn is_textual(&self) -> bool;
}

/// Stores values in structured-clone form.
pub struct NativeCodec<T>(PhantomData<fn() -> T>);

impl<T> NativeCodec<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for NativeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: StructuredClone> ValueCodec<T> for NativeCodec<T> {
    fn encode(&self, value: &T) -> Result<StructuredValue> {
        Ok(value.to_structured())
    }

    fn decode(&self, stored: StructuredValue) -> Result<T> {
        T::from_structured(stored)
    }

    fn is_textual(&self) -> bool {
        false
    }
}

/// Stores values as serializer text.
pub struct TextCodec<T> {
    serializer: Arc<dyn Serializer<T>>,
}

impl<T> TextCodec<T> {
    pub fn new(serializer: Arc<dyn Serializer<T>>) -> Self {
        Self { serializer }
    }
}

impl<T> ValueCodec<T> for TextCodec<T> {
    fn encode(&self, value: &T) -> Result<StructuredValue> {
        self.serializer.stringify(value).map(StructuredValue::String)
    }

    fn decode(&self, stored: StructuredValue) -> Result<T> {
        match stored {
            StructuredValue::String(raw) => self.serializer.parse(&raw),
            other => Err(PersistError::Serialization(format!(
                "expected stored text, found {}",
                other.type_name()
            ))),
        }
    }

    fn is_textual(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::JsonSerializer;
    use std::collections::HashSet;

    #[test]
    fn test_native_keeps_structure() {
        let codec = NativeCodec::<HashSet<String>>::new();
        let value: HashSet<String> = ["a".to_string(), "b".to_string()].into();
        let stored = codec.encode(&value).unwrap();
        assert_eq!(stored.type_name(), "set");
        assert_eq!(codec.decode(stored).unwrap(), value);
        assert!(!codec.is_textual());
    }

    #[test]
    fn test_text_codec_stores_strings() {
        let codec = TextCodec::<Vec<u32>>::new(Arc::new(JsonSerializer));
        let stored = codec.encode(&vec![1, 2]).unwrap();
        assert_eq!(stored, StructuredValue::String("[1,2]".into()));
        assert_eq!(codec.decode(stored).unwrap(), vec![1, 2]);
        assert!(codec.is_textual());
    }

    #[test]
    fn test_text_codec_rejects_structured() {
        let codec = TextCodec::<Vec<u32>>::new(Arc::new(JsonSerializer));
        let err = codec.decode(StructuredValue::Number(1.0)).unwrap_err();
        assert!(err.to_string().contains("expected stored text"));
    }
}
