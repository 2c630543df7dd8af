use serde::{Deserialize, Serialize};

use crate::store::SectorKey;

/// One sector record as it appears in an archive
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SectorRecord {
    pub offset: u64,
    pub length: u32,
    #[serde(with = "payload")]
    pub data: Vec<u8>,
}

impl SectorRecord {
    pub fn new(key: SectorKey, data: Vec<u8>) -> Self {
        Self {
            offset: key.offset,
            length: key.length,
            data,
        }
    }

    pub fn key(&self) -> SectorKey {
        SectorKey::new(self.offset, self.length)
    }
}

/// Hex string in human-readable formats (JSON), byte string otherwise (CBOR)
mod payload {
    use serde::de::{Error, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            hex::serde::serialize(data, serializer)
        } else {
            serializer.serialize_bytes(data)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        if deserializer.is_human_readable() {
            hex::serde::deserialize(deserializer)
        } else {
            deserializer.deserialize_byte_buf(BytesVisitor)
        }
    }

    struct BytesVisitor;

    impl<'de> Visitor<'de> for BytesVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a byte string")
        }

        fn visit_bytes<E: Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
            Ok(v)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cbor_payload_is_a_byte_string() {
        let record = SectorRecord::new(SectorKey::new(0, 512), vec![0xab; 512]);
        let mut encoded = Vec::new();
        ciborium::into_writer(&record, &mut encoded).unwrap();
        // raw bytes plus a small header, not twice the size as hex text would be
        assert!(encoded.len() < 600, "{} bytes", encoded.len());

        let value: ciborium::Value = ciborium::from_reader(encoded.as_slice()).unwrap();
        let data = value
            .as_map()
            .unwrap()
            .iter()
            .find(|(k, _)| k.as_text() == Some("data"))
            .map(|(_, v)| v.clone())
            .unwrap();
        assert_eq!(data, ciborium::Value::Bytes(vec![0xab; 512]));

        let decoded: SectorRecord = ciborium::from_reader(encoded.as_slice()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn json_payload_is_hex_text() {
        let record = SectorRecord::new(SectorKey::new(8, 2), vec![0x01, 0xff]);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"data\":\"01ff\""), "{}", json);
        assert_eq!(serde_json::from_str::<SectorRecord>(&json).unwrap(), record);
    }
}
