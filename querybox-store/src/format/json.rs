use bytes::Bytes;
use querybox_core::Raw;

use super::{DeserializeFn, Format, FormatError, SerializeFn};

/// JSON format (default)
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormat;

impl Format for JsonFormat {
    fn with_serializer(&self, f: &mut SerializeFn<'_>) -> Result<Raw, FormatError> {
        let mut buf = Vec::new();
        let mut ser = serde_json::Serializer::new(&mut buf);
        let mut erased = <dyn erased_serde::Serializer>::erase(&mut ser);
        f(&mut erased)?;
        Ok(Bytes::from(buf))
    }

    fn with_deserializer(
        &self,
        data: &[u8],
        f: &mut DeserializeFn<'_>,
    ) -> Result<(), FormatError> {
        let mut deser = serde_json::Deserializer::from_slice(data);
        {
            let mut erased = <dyn erased_serde::Deserializer>::erase(&mut deser);
            f(&mut erased)?;
        }
        deser
            .end()
            .map_err(|e| FormatError::Deserialize(Box::new(e)))
    }
}
