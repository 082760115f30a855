//! ValueSet property bag: the typed key/value payload language of the
//! application layer.
//!
//! Entries keep their insertion order on the wire; consumers look values up
//! by key and the order carries no meaning. The tag set is closed: parsing
//! fails on tags outside it.

use crate::wire::{Reader, WireError, Writer};

/// Value tags on the wire
mod tag {
    pub const U32: u8 = 1;
    pub const U64: u8 = 2;
    pub const STRING: u8 = 3;
    pub const BYTES: u8 = 4;
    pub const LIST: u8 = 5;
}

/// A single typed value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Unsigned 32-bit integer
    U32(u32),
    /// Unsigned 64-bit integer
    U64(u64),
    /// UTF-16LE string
    String(String),
    /// Raw byte array
    Bytes(Vec<u8>),
    /// Homogeneous list of scalar values (lists do not nest)
    List(Vec<Value>),
}

impl Value {
    fn tag(&self) -> u8 {
        match self {
            Value::U32(_) => tag::U32,
            Value::U64(_) => tag::U64,
            Value::String(_) => tag::STRING,
            Value::Bytes(_) => tag::BYTES,
            Value::List(_) => tag::LIST,
        }
    }

    fn parse_scalar(element_tag: u8, reader: &mut Reader<'_>) -> Result<Self, WireError> {
        match element_tag {
            tag::U32 => Ok(Value::U32(reader.read_u32()?)),
            tag::U64 => Ok(Value::U64(reader.read_u64()?)),
            tag::STRING => Ok(Value::String(reader.read_utf16()?)),
            tag::BYTES => Ok(Value::Bytes(reader.read_payload()?.to_vec())),
            other => Err(WireError::InvalidTag(other)),
        }
    }

    fn parse(value_tag: u8, reader: &mut Reader<'_>) -> Result<Self, WireError> {
        if value_tag != tag::LIST {
            return Self::parse_scalar(value_tag, reader);
        }

        let element_tag = reader.read_u8()?;
        if element_tag == tag::LIST {
            return Err(WireError::InvalidTag(element_tag));
        }
        let count = reader.read_u32()?;
        let mut items = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            items.push(Self::parse_scalar(element_tag, reader)?);
        }
        Ok(Value::List(items))
    }

    fn write_scalar(&self, w: &mut Writer) {
        match self {
            Value::U32(v) => w.write_u32(*v),
            Value::U64(v) => w.write_u64(*v),
            Value::String(s) => w.write_utf16(s),
            Value::Bytes(b) => w.write_payload(b),
            Value::List(_) => unreachable!("lists do not nest"),
        }
    }

    fn write(&self, w: &mut Writer) -> Result<(), WireError> {
        w.write_u8(self.tag());
        if let Value::List(items) = self {
            let element_tag = items.first().map_or(tag::U32, Value::tag);
            if element_tag == tag::LIST {
                return Err(WireError::InvalidTag(element_tag));
            }
            if items.iter().any(|item| item.tag() != element_tag) {
                return Err(WireError::InvalidTag(tag::LIST));
            }
            w.write_u8(element_tag);
            w.write_u32(items.len() as u32);
            for item in items {
                item.write_scalar(w);
            }
        } else {
            self.write_scalar(w);
        }
        Ok(())
    }
}

/// Ordered string-keyed property bag
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValueSet {
    entries: Vec<(String, Value)>,
}

impl ValueSet {
    /// Empty property bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert a value, replacing in place if the key already exists.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    /// Look a value up by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    fn require(&self, key: &str) -> Result<&Value, WireError> {
        self.get(key)
            .ok_or_else(|| WireError::MissingKey(key.to_string()))
    }

    /// Typed projection: u32.
    pub fn get_u32(&self, key: &str) -> Result<u32, WireError> {
        match self.require(key)? {
            Value::U32(v) => Ok(*v),
            _ => Err(WireError::WrongTag(key.to_string())),
        }
    }

    /// Typed projection: u64.
    pub fn get_u64(&self, key: &str) -> Result<u64, WireError> {
        match self.require(key)? {
            Value::U64(v) => Ok(*v),
            _ => Err(WireError::WrongTag(key.to_string())),
        }
    }

    /// Typed projection: string.
    pub fn get_string(&self, key: &str) -> Result<&str, WireError> {
        match self.require(key)? {
            Value::String(s) => Ok(s),
            _ => Err(WireError::WrongTag(key.to_string())),
        }
    }

    /// Typed projection: byte array.
    pub fn get_bytes(&self, key: &str) -> Result<&[u8], WireError> {
        match self.require(key)? {
            Value::Bytes(b) => Ok(b),
            _ => Err(WireError::WrongTag(key.to_string())),
        }
    }

    /// Typed projection: list of strings.
    pub fn get_string_list(&self, key: &str) -> Result<Vec<&str>, WireError> {
        match self.require(key)? {
            Value::List(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.as_str()),
                    _ => Err(WireError::WrongTag(key.to_string())),
                })
                .collect(),
            _ => Err(WireError::WrongTag(key.to_string())),
        }
    }

    /// Parse a property bag.
    ///
    /// # Errors
    ///
    /// Returns `WireError` on truncation or any tag outside the closed set.
    pub fn parse(reader: &mut Reader<'_>) -> Result<Self, WireError> {
        let count = reader.read_u32()?;
        let mut entries = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let key = reader.read_utf16()?;
            let value_tag = reader.read_u8()?;
            let value = Value::parse(value_tag, reader)?;
            entries.push((key, value));
        }
        Ok(Self { entries })
    }

    /// Serialize the property bag, preserving entry order.
    ///
    /// # Errors
    ///
    /// Returns `WireError::InvalidTag` if a list is heterogeneous or nested.
    pub fn write(&self, w: &mut Writer) -> Result<(), WireError> {
        w.write_u32(self.entries.len() as u32);
        for (key, value) in &self.entries {
            w.write_utf16(key);
            value.write(w)?;
        }
        Ok(())
    }

    /// Serialize into a fresh buffer.
    ///
    /// # Errors
    ///
    /// See [`ValueSet::write`].
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        let mut w = Writer::new();
        self.write(&mut w)?;
        Ok(w.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ValueSet {
        let mut vs = ValueSet::new();
        vs.insert("ControlMessage", Value::U32(0));
        vs.insert("DataKind", Value::U32(1));
        vs.insert(
            "FileNames",
            Value::List(vec![Value::String("a.bin".to_string())]),
        );
        vs.insert("BytesToSend", Value::U64(250_000));
        vs.insert("DataBlob", Value::Bytes(vec![1, 2, 3]));
        vs
    }

    #[test]
    fn test_roundtrip_preserves_order_and_bytes() {
        let vs = sample();
        let bytes = vs.to_bytes().unwrap();
        let parsed = ValueSet::parse(&mut Reader::new(&bytes)).unwrap();
        assert_eq!(parsed, vs);
        assert_eq!(parsed.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_typed_accessors() {
        let vs = sample();
        assert_eq!(vs.get_u32("ControlMessage").unwrap(), 0);
        assert_eq!(vs.get_u64("BytesToSend").unwrap(), 250_000);
        assert_eq!(vs.get_bytes("DataBlob").unwrap(), &[1, 2, 3]);
        assert_eq!(vs.get_string_list("FileNames").unwrap(), vec!["a.bin"]);
    }

    #[test]
    fn test_missing_key_fails() {
        let vs = sample();
        assert!(matches!(
            vs.get_u32("Uri"),
            Err(WireError::MissingKey(_))
        ));
    }

    #[test]
    fn test_tag_mismatch_fails() {
        let vs = sample();
        assert!(matches!(
            vs.get_u64("ControlMessage"),
            Err(WireError::WrongTag(_))
        ));
        assert!(matches!(
            vs.get_string("DataBlob"),
            Err(WireError::WrongTag(_))
        ));
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut vs = sample();
        vs.insert("ControlMessage", Value::U32(4));
        assert_eq!(vs.get_u32("ControlMessage").unwrap(), 4);
        assert_eq!(vs.len(), 5);
        // Still the first entry
        let bytes = vs.to_bytes().unwrap();
        let parsed = ValueSet::parse(&mut Reader::new(&bytes)).unwrap();
        assert_eq!(parsed.entries[0].0, "ControlMessage");
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut w = Writer::new();
        w.write_u32(1);
        w.write_utf16("Key");
        w.write_u8(99);
        let buf = w.into_bytes();
        assert_eq!(
            ValueSet::parse(&mut Reader::new(&buf)),
            Err(WireError::InvalidTag(99))
        );
    }

    #[test]
    fn test_nested_list_rejected_on_write() {
        let mut vs = ValueSet::new();
        vs.insert("L", Value::List(vec![Value::List(vec![])]));
        assert!(vs.to_bytes().is_err());
    }

    #[test]
    fn test_mixed_list_rejected_on_write() {
        let mut vs = ValueSet::new();
        vs.insert(
            "L",
            Value::List(vec![Value::U32(1), Value::U64(2)]),
        );
        assert!(vs.to_bytes().is_err());
    }

    #[test]
    fn test_empty_set_roundtrip() {
        let vs = ValueSet::new();
        let bytes = vs.to_bytes().unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 0]);
        assert_eq!(ValueSet::parse(&mut Reader::new(&bytes)).unwrap(), vs);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn arb_scalar() -> impl Strategy<Value = Value> {
            prop_oneof![
                any::<u32>().prop_map(Value::U32),
                any::<u64>().prop_map(Value::U64),
                "\\PC{0,32}".prop_map(Value::String),
                prop::collection::vec(any::<u8>(), 0..64).prop_map(Value::Bytes),
            ]
        }

        fn arb_value() -> impl Strategy<Value = Value> {
            prop_oneof![
                arb_scalar(),
                prop::collection::vec(any::<u32>(), 0..8)
                    .prop_map(|v| Value::List(v.into_iter().map(Value::U32).collect())),
                prop::collection::vec("\\PC{0,16}", 0..8)
                    .prop_map(|v| Value::List(v.into_iter().map(Value::String).collect())),
            ]
        }

        proptest! {
            #[test]
            fn prop_roundtrip(entries in prop::collection::vec(("\\PC{1,16}", arb_value()), 0..8)) {
                let mut vs = ValueSet::new();
                for (k, v) in entries {
                    vs.insert(k, v);
                }
                let bytes = vs.to_bytes().unwrap();
                let parsed = ValueSet::parse(&mut Reader::new(&bytes)).unwrap();
                prop_assert_eq!(&parsed, &vs);
                prop_assert_eq!(parsed.to_bytes().unwrap(), bytes);
            }

            #[test]
            fn prop_parse_never_panics(data in prop::collection::vec(any::<u8>(), 0..512)) {
                let _ = ValueSet::parse(&mut Reader::new(&data));
            }
        }
    }
}
