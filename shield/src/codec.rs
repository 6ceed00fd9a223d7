//! Value encoding.
//!
//! Every cached value passes through a [`CodecRegistry`]. Types registered
//! explicitly use their own encode/decode pair; everything else goes through
//! the default structural codec, `serde_json` over the type's declared
//! fields.

use crate::error::{Error, Result};

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

const DEFAULT_TAG: &str = "json";
const STAMP_LEN: usize = 8;

type EncodeFn = Arc<dyn Fn(&dyn Any) -> Result<Vec<u8>> + Send + Sync>;
type DecodeFn = Arc<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send>> + Send + Sync>;

#[derive(Clone)]
struct Codec {
  tag: String,
  encode: EncodeFn,
  decode: DecodeFn,
}

/// Maps a value type to the encoder used to store it.
#[derive(Clone, Default)]
pub struct CodecRegistry {
  codecs: HashMap<TypeId, Codec>,
}

impl CodecRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers a custom codec for `T` under `tag`.
  pub fn register<T, Enc, Dec>(&mut self, tag: impl Into<String>, encode: Enc, decode: Dec)
  where
    T: Any + Send,
    Enc: Fn(&T) -> Result<Vec<u8>> + Send + Sync + 'static,
    Dec: Fn(&[u8]) -> Result<T> + Send + Sync + 'static,
  {
    let tag = tag.into();
    let encode_tag = tag.clone();
    let codec = Codec {
      tag: tag.clone(),
      encode: Arc::new(move |value: &dyn Any| match value.downcast_ref::<T>() {
        Some(value) => encode(value),
        None => Err(Error::codec(&encode_tag, "value of unexpected type")),
      }),
      decode: Arc::new(move |bytes: &[u8]| {
        decode(bytes).map(|value| Box::new(value) as Box<dyn Any + Send>)
      }),
    };
    self.codecs.insert(TypeId::of::<T>(), codec);
  }

  /// Returns the tag of the codec used for `T`.
  pub fn tag_of<T: Any>(&self) -> &str {
    self
      .codecs
      .get(&TypeId::of::<T>())
      .map(|c| c.tag.as_str())
      .unwrap_or(DEFAULT_TAG)
  }

  pub fn encode<T>(&self, value: &T) -> Result<Vec<u8>>
  where
    T: Serialize + Any,
  {
    match self.codecs.get(&TypeId::of::<T>()) {
      Some(codec) => (codec.encode)(value),
      None => serde_json::to_vec(value).map_err(|e| Error::codec(DEFAULT_TAG, e)),
    }
  }

  pub fn decode<T>(&self, bytes: &[u8]) -> Result<T>
  where
    T: DeserializeOwned + Any,
  {
    match self.codecs.get(&TypeId::of::<T>()) {
      Some(codec) => {
        let value = (codec.decode)(bytes)?;
        value
          .downcast::<T>()
          .map(|boxed| *boxed)
          .map_err(|_| Error::codec(&codec.tag, "decoder produced a value of another type"))
      }
      None => serde_json::from_slice(bytes).map_err(|e| Error::codec(DEFAULT_TAG, e)),
    }
  }
}

impl fmt::Debug for CodecRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let tags: Vec<_> = self.codecs.values().map(|c| c.tag.as_str()).collect();
    f.debug_struct("CodecRegistry").field("custom", &tags).finish()
  }
}

/// Prefixes `payload` with the time it was computed.
pub(crate) fn stamp(at: DateTime<Utc>, payload: Vec<u8>) -> Vec<u8> {
  let mut out = Vec::with_capacity(STAMP_LEN + payload.len());
  out.extend_from_slice(&at.timestamp_millis().to_be_bytes());
  out.extend(payload);
  out
}

/// Splits a stamped envelope into its timestamp and payload.
pub(crate) fn unstamp(bytes: &[u8]) -> Result<(DateTime<Utc>, &[u8])> {
  if bytes.len() < STAMP_LEN {
    return Err(Error::codec("stamp", "envelope too short"));
  }
  let (head, payload) = bytes.split_at(STAMP_LEN);
  let mut millis = [0u8; STAMP_LEN];
  millis.copy_from_slice(head);
  let at = Utc
    .timestamp_millis_opt(i64::from_be_bytes(millis))
    .single()
    .ok_or_else(|| Error::codec("stamp", "timestamp out of range"))?;
  Ok((at, payload))
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::Deserialize;

  #[derive(Debug, PartialEq, Serialize, Deserialize)]
  struct User {
    id: u64,
    name: String,
  }

  #[test]
  fn default_codec_is_structural() {
    let registry = CodecRegistry::new();
    let user = User {
      id: 1,
      name: "ada".into(),
    };
    let bytes = registry.encode(&user).unwrap();
    assert_eq!(bytes, br#"{"id":1,"name":"ada"}"#.to_vec());
    assert_eq!(registry.decode::<User>(&bytes).unwrap(), user);
    assert_eq!(registry.tag_of::<User>(), "json");
  }

  #[test]
  fn custom_codec_takes_precedence() {
    let mut registry = CodecRegistry::new();
    registry.register::<u32, _, _>(
      "be32",
      |v| Ok(v.to_be_bytes().to_vec()),
      |b| {
        let arr: [u8; 4] = b.try_into().map_err(|_| Error::codec("be32", "bad length"))?;
        Ok(u32::from_be_bytes(arr))
      },
    );
    let bytes = registry.encode(&7u32).unwrap();
    assert_eq!(bytes, vec![0, 0, 0, 7]);
    assert_eq!(registry.decode::<u32>(&bytes).unwrap(), 7);
    assert!(matches!(
      registry.decode::<u32>(&[1]),
      Err(Error::Codec { tag, .. }) if tag == "be32"
    ));
  }

  #[test]
  fn stamped_envelope_keeps_time_and_payload() {
    let at = Utc.timestamp_millis_opt(1_700_000_000_123).single().unwrap();
    let bytes = stamp(at, b"payload".to_vec());
    let (read_at, payload) = unstamp(&bytes).unwrap();
    assert_eq!(read_at, at);
    assert_eq!(payload, b"payload");
    assert!(unstamp(&[0, 1]).is_err());
  }
}
