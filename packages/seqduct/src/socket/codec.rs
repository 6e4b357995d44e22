//! Element encodings.

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;


/// Converts elements to and from the payload of an Element frame
///
/// Both ends of a connection must agree on the codec. Failures are reported through `anyhow` and
/// are fatal for the connection they occur on.
pub trait Codec<T>: Send + Sync {
    /// Encode one element
    fn encode(&self, item: &T) -> anyhow::Result<Vec<u8>>;

    /// Decode one element
    fn decode(&self, bytes: &[u8]) -> anyhow::Result<T>;
}

impl<T, C: Codec<T> + ?Sized> Codec<T> for Arc<C> {
    fn encode(&self, item: &T) -> anyhow::Result<Vec<u8>> {
        (**self).encode(item)
    }

    fn decode(&self, bytes: &[u8]) -> anyhow::Result<T> {
        (**self).decode(bytes)
    }
}

impl<T, C: Codec<T> + ?Sized> Codec<T> for &C {
    fn encode(&self, item: &T) -> anyhow::Result<Vec<u8>> {
        (**self).encode(item)
    }

    fn decode(&self, bytes: &[u8]) -> anyhow::Result<T> {
        (**self).decode(bytes)
    }
}

/// Default codec: bincode over serde
#[derive(Debug, Default, Copy, Clone)]
pub struct Bincode;

impl<T: Serialize + DeserializeOwned> Codec<T> for Bincode {
    fn encode(&self, item: &T) -> anyhow::Result<Vec<u8>> {
        Ok(bincode::serialize(item)?)
    }

    fn decode(&self, bytes: &[u8]) -> anyhow::Result<T> {
        Ok(bincode::deserialize(bytes)?)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Reading {
        sensor: String,
        values: Vec<i64>,
    }

    #[test]
    fn bincode_codec() {
        let reading = Reading { sensor: "north".into(), values: vec![3, -1, 4] };
        let bytes = Bincode.encode(&reading).unwrap();
        assert_eq!(Codec::<Reading>::decode(&Bincode, &bytes).unwrap(), reading);
    }

    #[test]
    fn bincode_rejects_garbage() {
        assert!(Codec::<String>::decode(&Bincode, &[0xff; 3]).is_err());
    }
}
