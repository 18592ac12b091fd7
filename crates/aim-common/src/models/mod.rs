//! Domain models shared across all AIM crates.
//!
//! Content and key material are opaque byte strings end-to-end. JSON carries
//! them base64-encoded (standard alphabet) via the [`b64`] serde helper; the
//! pipeline never re-encodes or UTF-8-validates payload bytes.

pub mod identity;
pub mod message;

pub use identity::{Contact, ContactCard, Device, DeviceRevocation, Identity};
pub use message::{
    ContentType, ConversationType, Direction, Message, MessageStatus, PendingMessage, Receipt,
    ReceiptStatus,
};

/// Serde adapter: `Vec<u8>` ⇄ base64 string (standard alphabet, padded).
pub mod b64 {
    use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&B64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        B64.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }

    /// Same adapter for `Option<Vec<u8>>` fields.
    pub mod opt {
        use super::*;

        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            ser: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(b) => ser.serialize_some(&B64.encode(b)),
                None => ser.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            de: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            let s = Option::<String>::deserialize(de)?;
            match s {
                Some(s) => B64
                    .decode(s.as_bytes())
                    .map(Some)
                    .map_err(serde::de::Error::custom),
                None => Ok(None),
            }
        }
    }
}
