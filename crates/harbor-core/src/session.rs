//! Session container shared between the runtime and application code.
//!
//! A [`SessionRecord`] never crosses the runtime/application boundary by
//! reference. Each side holds its own copy and exchanges it as bytes via
//! [`SessionRecord::to_bytes`] and [`SessionRecord::from_bytes`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::HarborError;

/// Per-user state bag with an absolute expiration time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    values: BTreeMap<String, serde_json::Value>,
    expires_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(expires_at: DateTime<Utc>) -> Self {
        Self {
            values: BTreeMap::new(),
            expires_at,
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Move the expiration to a new absolute time.
    pub fn extend_to(&mut self, expires_at: DateTime<Utc>) {
        self.expires_at = expires_at;
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Store any serializable value under `key`, replacing the previous one.
    ///
    /// Values holding a NaN or infinite float are refused with
    /// [`HarborError::Codec`]; JSON cannot carry them.
    pub fn set<T: Serialize + ?Sized>(&mut self, key: &str, value: &T) -> Result<(), HarborError> {
        value
            .serialize(finite::FiniteFloats)
            .map_err(|e| HarborError::Codec(format!("session value {key}: {e}")))?;
        let value = serde_json::to_value(value)?;
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    /// Read the value under `key` as `T`. `Ok(None)` when absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, HarborError> {
        self.values
            .get(key)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(HarborError::from)
    }

    pub fn get_raw(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, HarborError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HarborError> {
        serde_json::from_slice(bytes)
            .map_err(|e| HarborError::Codec(format!("invalid session record: {e}")))
    }
}

/// A serializer that produces nothing and fails on the first non-finite
/// float. serde_json would silently write those as `null`.
mod finite {
    use std::fmt;

    use serde::ser::{self, Serialize};

    #[derive(Debug)]
    pub struct NonFinite(String);

    impl fmt::Display for NonFinite {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.0)
        }
    }

    impl std::error::Error for NonFinite {}

    impl ser::Error for NonFinite {
        fn custom<T: fmt::Display>(msg: T) -> Self {
            NonFinite(msg.to_string())
        }
    }

    pub struct FiniteFloats;

    type Checked = Result<(), NonFinite>;

    fn check(v: f64) -> Checked {
        if v.is_finite() {
            Ok(())
        } else {
            Err(NonFinite(format!("non-finite float {v}")))
        }
    }

    macro_rules! accept {
        ($($method:ident: $ty:ty),* $(,)?) => {
            $(fn $method(self, _v: $ty) -> Checked { Ok(()) })*
        };
    }

    impl ser::Serializer for FiniteFloats {
        type Ok = ();
        type Error = NonFinite;
        type SerializeSeq = Self;
        type SerializeTuple = Self;
        type SerializeTupleStruct = Self;
        type SerializeTupleVariant = Self;
        type SerializeMap = Self;
        type SerializeStruct = Self;
        type SerializeStructVariant = Self;

        accept! {
            serialize_bool: bool,
            serialize_i8: i8, serialize_i16: i16, serialize_i32: i32,
            serialize_i64: i64, serialize_i128: i128,
            serialize_u8: u8, serialize_u16: u16, serialize_u32: u32,
            serialize_u64: u64, serialize_u128: u128,
            serialize_char: char, serialize_str: &str, serialize_bytes: &[u8],
            serialize_unit_struct: &'static str,
        }

        fn serialize_f32(self, v: f32) -> Checked {
            check(f64::from(v))
        }

        fn serialize_f64(self, v: f64) -> Checked {
            check(v)
        }

        fn serialize_none(self) -> Checked {
            Ok(())
        }

        fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Checked {
            value.serialize(self)
        }

        fn serialize_unit(self) -> Checked {
            Ok(())
        }

        fn serialize_unit_variant(self, _: &'static str, _: u32, _: &'static str) -> Checked {
            Ok(())
        }

        fn serialize_newtype_struct<T: ?Sized + Serialize>(
            self,
            _: &'static str,
            value: &T,
        ) -> Checked {
            value.serialize(self)
        }

        fn serialize_newtype_variant<T: ?Sized + Serialize>(
            self,
            _: &'static str,
            _: u32,
            _: &'static str,
            value: &T,
        ) -> Checked {
            value.serialize(self)
        }

        fn serialize_seq(self, _: Option<usize>) -> Result<Self, NonFinite> {
            Ok(self)
        }

        fn serialize_tuple(self, _: usize) -> Result<Self, NonFinite> {
            Ok(self)
        }

        fn serialize_tuple_struct(self, _: &'static str, _: usize) -> Result<Self, NonFinite> {
            Ok(self)
        }

        fn serialize_tuple_variant(
            self,
            _: &'static str,
            _: u32,
            _: &'static str,
            _: usize,
        ) -> Result<Self, NonFinite> {
            Ok(self)
        }

        fn serialize_map(self, _: Option<usize>) -> Result<Self, NonFinite> {
            Ok(self)
        }

        fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self, NonFinite> {
            Ok(self)
        }

        fn serialize_struct_variant(
            self,
            _: &'static str,
            _: u32,
            _: &'static str,
            _: usize,
        ) -> Result<Self, NonFinite> {
            Ok(self)
        }
    }

    impl ser::SerializeSeq for FiniteFloats {
        type Ok = ();
        type Error = NonFinite;
        fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Checked {
            value.serialize(FiniteFloats)
        }
        fn end(self) -> Checked {
            Ok(())
        }
    }

    impl ser::SerializeTuple for FiniteFloats {
        type Ok = ();
        type Error = NonFinite;
        fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Checked {
            value.serialize(FiniteFloats)
        }
        fn end(self) -> Checked {
            Ok(())
        }
    }

    impl ser::SerializeTupleStruct for FiniteFloats {
        type Ok = ();
        type Error = NonFinite;
        fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Checked {
            value.serialize(FiniteFloats)
        }
        fn end(self) -> Checked {
            Ok(())
        }
    }

    impl ser::SerializeTupleVariant for FiniteFloats {
        type Ok = ();
        type Error = NonFinite;
        fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Checked {
            value.serialize(FiniteFloats)
        }
        fn end(self) -> Checked {
            Ok(())
        }
    }

    impl ser::SerializeMap for FiniteFloats {
        type Ok = ();
        type Error = NonFinite;
        fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Checked {
            key.serialize(FiniteFloats)
        }
        fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Checked {
            value.serialize(FiniteFloats)
        }
        fn end(self) -> Checked {
            Ok(())
        }
    }

    impl ser::SerializeStruct for FiniteFloats {
        type Ok = ();
        type Error = NonFinite;
        fn serialize_field<T: ?Sized + Serialize>(&mut self, _: &'static str, value: &T) -> Checked {
            value.serialize(FiniteFloats)
        }
        fn end(self) -> Checked {
            Ok(())
        }
    }

    impl ser::SerializeStructVariant for FiniteFloats {
        type Ok = ();
        type Error = NonFinite;
        fn serialize_field<T: ?Sized + Serialize>(&mut self, _: &'static str, value: &T) -> Checked {
            value.serialize(FiniteFloats)
        }
        fn end(self) -> Checked {
            Ok(())
        }
    }
}
