//! Value formats used to keep cached values as raw bytes.
//!
//! The store holds every entry as [`Raw`] bytes so that one store can serve
//! queries of different value types. A [`Format`] turns typed values into
//! bytes and back. It is object-safe (type erasure via `erased-serde`), so a
//! store can expose its format as `&dyn Format`; [`FormatExt`] adds the typed
//! helpers on top.

use querybox_core::Raw;
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

mod json;

pub use json::JsonFormat;

/// Error type for value (de)serialization.
#[derive(Error, Debug)]
pub enum FormatError {
    /// The value could not be serialized.
    #[error("failed to serialize value: {0}")]
    Serialize(Box<dyn std::error::Error + Send + Sync>),

    /// The stored bytes could not be deserialized into the requested type.
    #[error("failed to deserialize value: {0}")]
    Deserialize(Box<dyn std::error::Error + Send + Sync>),
}

/// Callback receiving an erased serializer.
pub type SerializeFn<'a> =
    dyn FnMut(&mut dyn erased_serde::Serializer) -> Result<(), FormatError> + 'a;

/// Callback receiving an erased deserializer.
pub type DeserializeFn<'a> =
    dyn for<'de> FnMut(&mut dyn erased_serde::Deserializer<'de>) -> Result<(), FormatError> + 'a;

/// Object-safe value format.
pub trait Format: std::fmt::Debug + Send + Sync {
    /// Runs `f` against a serializer writing into a fresh buffer and returns
    /// the buffer.
    fn with_serializer(&self, f: &mut SerializeFn<'_>) -> Result<Raw, FormatError>;

    /// Runs `f` against a deserializer reading `data`.
    fn with_deserializer(&self, data: &[u8], f: &mut DeserializeFn<'_>)
    -> Result<(), FormatError>;
}

/// Typed helpers over any [`Format`], including `&dyn Format`.
///
/// ```
/// use querybox_store::format::{FormatExt, JsonFormat};
///
/// let raw = JsonFormat.serialize(&vec![1, 2, 3]).unwrap();
/// assert_eq!(&raw[..], b"[1,2,3]");
/// let back: Vec<u32> = JsonFormat.deserialize(&raw).unwrap();
/// assert_eq!(back, vec![1, 2, 3]);
/// ```
pub trait FormatExt: Format {
    /// Serializes a value into raw bytes.
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Raw, FormatError> {
        self.with_serializer(&mut |serializer| {
            let erased = value as &dyn erased_serde::Serialize;
            erased
                .erased_serialize(serializer)
                .map_err(|e| FormatError::Serialize(Box::new(e)))
        })
    }

    /// Deserializes raw bytes into a value.
    fn deserialize<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, FormatError> {
        let mut value = None;
        self.with_deserializer(data, &mut |deserializer| {
            let decoded = erased_serde::deserialize::<T>(deserializer)
                .map_err(|e| FormatError::Deserialize(Box::new(e)))?;
            value = Some(decoded);
            Ok(())
        })?;
        value.ok_or_else(|| FormatError::Deserialize("format did not run the deserializer".into()))
    }
}

impl<F: Format + ?Sized> FormatExt for F {}
