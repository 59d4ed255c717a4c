//! Payload codecs for the version log and the wire.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CResult;

/// Define a codec type and implement the Codec trait
pub trait Codec {
    fn codec_name(&self) -> String;
}

/// The codec used for delta payloads inside log frames. Compact binary
/// encoding; the frame header carries the length, so payloads are not
/// self-delimiting.
#[derive(Clone, Copy, Default)]
pub struct DeltaCodec;

impl DeltaCodec {
    pub fn new() -> Self {
        DeltaCodec
    }

    pub fn encode<T>(&self, value: &T) -> CResult<Vec<u8>>
    where
        T: ?Sized + Serialize,
    {
        Ok(bincode::serialize(value)?)
    }

    pub fn decode<T>(&self, bytes: &[u8]) -> CResult<T>
    where
        T: DeserializeOwned,
    {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl Codec for DeltaCodec {
    fn codec_name(&self) -> String {
        "DeltaCodec".to_string()
    }
}

#[cfg(test)]
mod test {
    use serde_derive::{Deserialize, Serialize};

    use super::*;
    use crate::object::VersionedObject;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Probe {
        name: String,
        weight: u32,
    }

    #[test]
    fn roundtrip_struct() {
        let codec = DeltaCodec::new();
        let probe = Probe { name: "p0".to_string(), weight: 7 };
        let bytes = codec.encode(&probe).unwrap();
        let back: Probe = codec.decode(&bytes).unwrap();
        assert_eq!(probe, back);
    }

    #[test]
    fn roundtrip_object() {
        let codec = DeltaCodec::new();
        let obj = VersionedObject::new("pool/obj/1".to_string(), b"payload");
        let bytes = codec.encode(&obj).unwrap();
        let back: VersionedObject<String> = codec.decode(&bytes).unwrap();
        assert_eq!(obj, back);
    }

    #[test]
    fn decode_garbage_is_parse_error() {
        let codec = DeltaCodec::new();
        let result: CResult<Probe> = codec.decode(&[0xff, 0xff, 0xff, 0xff, 0xff]);
        assert!(result.is_err());
    }
}
