use std::{
    cmp::Ordering,
    collections::BTreeMap,
    sync::{atomic::AtomicU32, OnceLock},
};

use base64::Engine;
use rand::{rngs::OsRng, TryRngCore};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use uuid::Uuid;

use crate::{Result, SoloError};

/// Enum representing a type of value
///
/// Variants:
/// - Sentinels: MinValue, MaxValue (index bounds, never stored in documents)
/// - Primitive types: Null, Bool, Int32, Int64, Float64, String, Binary
/// - Date/Time: DateTime
/// - Identifiers: Uuid, ObjectId
/// - Collection types: Array, Object (document)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    MinValue,
    Null,
    Bool,
    Int32,
    Int64,
    Float64,
    String,
    Binary,
    DateTime,
    Uuid,
    ObjectId,
    Array,
    Object,
    MaxValue,
}

impl ValueType {
    /// Check if this type is a numeric type.
    pub fn is_numeric(&self) -> bool {
        matches!(self, ValueType::Int32 | ValueType::Int64 | ValueType::Float64)
    }

    /// Returns a user-friendly display name for this type.
    pub fn display_name(&self) -> &'static str {
        match self {
            ValueType::MinValue => "MinValue",
            ValueType::Null => "Null",
            ValueType::Bool => "Bool",
            ValueType::Int32 => "Int32",
            ValueType::Int64 => "Int64",
            ValueType::Float64 => "Float64",
            ValueType::String => "String",
            ValueType::Binary => "Binary",
            ValueType::DateTime => "DateTime",
            ValueType::Uuid => "Uuid",
            ValueType::ObjectId => "ObjectId",
            ValueType::Array => "Array",
            ValueType::Object => "Object",
            ValueType::MaxValue => "MaxValue",
        }
    }
}

/// Universal value type for SoloDB
///
/// Every value that can appear in a document field or as an index key.
/// `MinValue` and `MaxValue` exist for the index sentinel nodes: they
/// compare before and after every other value and never appear inside a
/// stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    MinValue,
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
    Binary(Vec<u8>),
    DateTime(chrono::DateTime<chrono::FixedOffset>),
    Uuid(uuid::Uuid),
    ObjectId(ObjectId),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    MaxValue,
}

impl Value {
    /// Get the corresponding ValueType for this Value
    pub fn data_type(&self) -> ValueType {
        match self {
            Value::MinValue => ValueType::MinValue,
            Value::Null => ValueType::Null,
            Value::Bool(_) => ValueType::Bool,
            Value::Int32(_) => ValueType::Int32,
            Value::Int64(_) => ValueType::Int64,
            Value::Float64(_) => ValueType::Float64,
            Value::String(_) => ValueType::String,
            Value::Binary(_) => ValueType::Binary,
            Value::DateTime(_) => ValueType::DateTime,
            Value::Uuid(_) => ValueType::Uuid,
            Value::ObjectId(_) => ValueType::ObjectId,
            Value::Array(_) => ValueType::Array,
            Value::Object(_) => ValueType::Object,
            Value::MaxValue => ValueType::MaxValue,
        }
    }

    /// Rank used to order values of different types against each other.
    /// Numeric types share one rank so 1, 1i64 and 1.0 compare as equal.
    fn type_order(&self) -> u8 {
        match self {
            Value::MinValue => 0,
            Value::Null => 1,
            Value::Int32(_) | Value::Int64(_) | Value::Float64(_) => 2,
            Value::String(_) => 3,
            Value::Object(_) => 4,
            Value::Array(_) => 5,
            Value::Binary(_) => 6,
            Value::ObjectId(_) => 7,
            Value::Uuid(_) => 8,
            Value::Bool(_) => 9,
            Value::DateTime(_) => 10,
            Value::MaxValue => 11,
        }
    }

    /// Total order over all values, used for index key comparison.
    ///
    /// Values of different types order by type rank; numeric values compare
    /// across Int32/Int64/Float64. Float comparison uses `total_cmp`, so
    /// NaN has a stable position instead of poisoning the skip list.
    pub fn compare(&self, other: &Value) -> Ordering {
        let (ta, tb) = (self.type_order(), other.type_order());
        if ta != tb {
            return ta.cmp(&tb);
        }

        match (self, other) {
            (Value::MinValue, Value::MinValue) => Ordering::Equal,
            (Value::MaxValue, Value::MaxValue) => Ordering::Equal,
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int32(a), Value::Int32(b)) => a.cmp(b),
            (Value::Int64(a), Value::Int64(b)) => a.cmp(b),
            (Value::Int32(a), Value::Int64(b)) => (*a as i64).cmp(b),
            (Value::Int64(a), Value::Int32(b)) => a.cmp(&(*b as i64)),
            (Value::Float64(a), Value::Float64(b)) => a.total_cmp(b),
            (a, b) if a.data_type().is_numeric() && b.data_type().is_numeric() => {
                // Mixed int/float: promote both sides to f64
                a.as_f64_lossy().total_cmp(&b.as_f64_lossy())
            }
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Binary(a), Value::Binary(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (Value::Uuid(a), Value::Uuid(b)) => a.cmp(b),
            (Value::ObjectId(a), Value::ObjectId(b)) => a.0.cmp(&b.0),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.compare(y) {
                        Ordering::Equal => {}
                        ord => return ord,
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Object(a), Value::Object(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    match ka.cmp(kb) {
                        Ordering::Equal => {}
                        ord => return ord,
                    }
                    match va.compare(vb) {
                        Ordering::Equal => {}
                        ord => return ord,
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => Ordering::Equal,
        }
    }

    fn as_f64_lossy(&self) -> f64 {
        match self {
            Value::Int32(i) => *i as f64,
            Value::Int64(i) => *i as f64,
            Value::Float64(f) => *f,
            _ => f64::NAN,
        }
    }

    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Check if the value is one of the MinValue/MaxValue sentinels
    pub fn is_sentinel(&self) -> bool {
        matches!(self, Value::MinValue | Value::MaxValue)
    }

    /// Extract the string from Value::String, returning None if not a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Extract the integer from Value::Int32, returning None if not an int
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(i) => Some(*i),
            _ => None,
        }
    }

    /// Extract an integer from Value::Int32/Int64, widening as needed
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(i) => Some(*i as i64),
            Value::Int64(i) => Some(*i),
            _ => None,
        }
    }

    /// Extract the float from Value::Float64, returning None if not a float
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float64(f) => Some(*f),
            _ => None,
        }
    }

    /// Extract the boolean from Value::Bool, returning None if not a boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Extract the object from Value::Object, returning None if not an object
    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Extract the array from Value::Array, returning None if not an array
    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Convert Value to JSON representation
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::MinValue => serde_json::Value::String("$minValue".into()),
            Value::MaxValue => serde_json::Value::String("$maxValue".into()),
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int32(i) => serde_json::Value::Number((*i).into()),
            Value::Int64(i) => serde_json::Value::Number((*i).into()),
            Value::Float64(f) => serde_json::Number::from_f64(*f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Binary(b) => serde_json::Value::String(format!(
                "b64:{}",
                base64::engine::general_purpose::STANDARD.encode(b)
            )),
            Value::DateTime(dt) => serde_json::Value::String(dt.to_rfc3339()),
            Value::Uuid(u) => serde_json::Value::String(u.to_string()),
            Value::ObjectId(oid) => serde_json::Value::String(oid.to_string()),
            Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(|v| v.to_json()).collect())
            }
            Value::Object(obj) => {
                let map: serde_json::Map<String, serde_json::Value> =
                    obj.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
                serde_json::Value::Object(map)
            }
        }
    }

    /// Convert from JSON representation
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    if i >= i32::MIN as i64 && i <= i32::MAX as i64 {
                        Value::Int32(i as i32)
                    } else {
                        Value::Int64(i)
                    }
                } else if let Some(f) = n.as_f64() {
                    Value::Float64(f)
                } else {
                    Value::Null
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(arr) => {
                Value::Array(arr.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                let obj: BTreeMap<String, Value> = map
                    .into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect();
                Value::Object(obj)
            }
        }
    }

    #[inline]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.write_to(&mut out);

        out
    }

    #[inline]
    pub fn from_bytes(buf: &[u8]) -> Result<(Value, usize)> {
        if buf.is_empty() {
            return Err(SoloError::Parse("Empty buffer".into()));
        }

        let kind = buf[0];
        let mut offset = 1;

        macro_rules! need {
            ($n:expr) => {
                if buf.len() < offset + $n {
                    return Err(SoloError::Parse("Unexpected EOF".into()));
                }
            };
        }

        macro_rules! read_u32 {
            () => {{
                need!(4);
                let v = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
                offset += 4;
                v
            }};
        }

        macro_rules! read_i32 {
            () => {{
                need!(4);
                let v = i32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap());
                offset += 4;
                v
            }};
        }

        macro_rules! read_i64 {
            () => {{
                need!(8);
                let v = i64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap());
                offset += 8;
                v
            }};
        }

        macro_rules! read_string {
            () => {{
                let len = read_u32!() as usize;
                need!(len);
                let s = std::str::from_utf8(&buf[offset..offset + len])
                    .map_err(|e| SoloError::Parse(format!("utf8 error: {e}")))?;
                offset += len;
                s.to_owned()
            }};
        }

        macro_rules! read_bytes {
            () => {{
                let len = read_u32!() as usize;
                need!(len);
                let v = buf[offset..offset + len].to_vec();
                offset += len;
                v
            }};
        }

        let value = match kind {
            0 => Value::Null,

            1 => {
                need!(1);
                let b = buf[offset] != 0;
                offset += 1;
                Value::Bool(b)
            }

            2 => Value::Int32(read_i32!()),

            3 => Value::Int64(read_i64!()),

            5 => {
                let bits = read_i64!() as u64;
                Value::Float64(f64::from_bits(bits))
            }

            6 => Value::String(read_string!()),

            7 => Value::Binary(read_bytes!()),

            8 => {
                let micros = read_i64!();
                let offset_minutes = read_i32!();
                let secs = micros.div_euclid(1_000_000);
                let nsecs = (micros.rem_euclid(1_000_000) * 1000) as u32;
                let tz = chrono::FixedOffset::east_opt(offset_minutes * 60)
                    .ok_or_else(|| SoloError::Parse("Invalid offset".into()))?;
                let dt = chrono::DateTime::from_timestamp(secs, nsecs)
                    .ok_or_else(|| SoloError::Parse("Invalid timestamp".into()))?
                    .with_timezone(&tz);
                Value::DateTime(dt)
            }

            11 => {
                need!(16);
                let mut b = [0u8; 16];
                b.copy_from_slice(&buf[offset..offset + 16]);
                offset += 16;
                Value::Uuid(uuid::Uuid::from_bytes(b))
            }

            12 => {
                need!(12);
                let mut b = [0u8; 12];
                b.copy_from_slice(&buf[offset..offset + 12]);
                offset += 12;
                Value::ObjectId(ObjectId::from_bytes(b))
            }

            13 => {
                let len = read_u32!() as usize;
                let mut v = Vec::with_capacity(len.min(4096));

                for _ in 0..len {
                    let (item, used) = Value::from_bytes(&buf[offset..])?;
                    offset += used;
                    v.push(item);
                }

                Value::Array(v)
            }

            14 => {
                let len = read_u32!() as usize;
                let mut map = BTreeMap::new();

                for _ in 0..len {
                    let key = read_string!();
                    let (val, used) = Value::from_bytes(&buf[offset..])?;
                    offset += used;
                    map.insert(key, val);
                }

                Value::Object(map)
            }

            254 => Value::MinValue,

            255 => Value::MaxValue,

            _ => {
                return Err(SoloError::Parse(format!("Unknown Value tag: {kind}")));
            }
        };

        Ok((value, offset))
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Value::Null => out.push(0),

            Value::Bool(b) => {
                out.push(1);
                out.push(*b as u8);
            }

            Value::Int32(i) => {
                out.push(2);
                out.extend_from_slice(&i.to_le_bytes());
            }

            Value::Int64(i) => {
                out.push(3);
                out.extend_from_slice(&i.to_le_bytes());
            }

            Value::Float64(f) => {
                out.push(5);
                out.extend_from_slice(&f.to_bits().to_le_bytes());
            }

            Value::String(s) => {
                out.push(6);
                let b = s.as_bytes();
                out.extend_from_slice(&(b.len() as u32).to_le_bytes());
                out.extend_from_slice(b);
            }

            Value::Binary(b) => {
                out.push(7);
                out.extend_from_slice(&(b.len() as u32).to_le_bytes());
                out.extend_from_slice(b);
            }

            Value::DateTime(dt) => {
                out.push(8);
                let unix_micros = dt.timestamp_micros();
                let offset_minutes = dt.offset().local_minus_utc() / 60;
                out.extend_from_slice(&unix_micros.to_le_bytes());
                out.extend_from_slice(&offset_minutes.to_le_bytes());
            }

            Value::Uuid(u) => {
                out.push(11);
                out.extend_from_slice(u.as_bytes());
            }

            Value::ObjectId(oid) => {
                out.push(12);
                out.extend_from_slice(&oid.bytes());
            }

            Value::Array(arr) => {
                out.push(13);
                out.extend_from_slice(&(arr.len() as u32).to_le_bytes());
                for v in arr {
                    v.write_to(out);
                }
            }

            Value::Object(map) => {
                out.push(14);
                out.extend_from_slice(&(map.len() as u32).to_le_bytes());
                for (k, v) in map {
                    let kb = k.as_bytes();
                    out.extend_from_slice(&(kb.len() as u32).to_le_bytes());
                    out.extend_from_slice(kb);
                    v.write_to(out);
                }
            }

            Value::MinValue => out.push(254),

            Value::MaxValue => out.push(255),
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Value::MinValue | Value::MaxValue | Value::Null => 1,
            Value::Bool(_) => 2,

            Value::Int32(_) => 5, // 1 + 4
            Value::Int64(_) => 9, // 1 + 8

            Value::Float64(_) => 9, // 1 + 8

            Value::String(s) => 1 + 4 + s.len(),
            Value::Binary(b) => 1 + 4 + b.len(),

            Value::DateTime(_) => 13, // 1 + 8 + 4

            Value::Uuid(_) => 17,     // 1 + 16
            Value::ObjectId(_) => 13, // 1 + 12

            Value::Array(arr) => 1 + 4 + arr.iter().map(|v| v.encoded_len()).sum::<usize>(),

            Value::Object(map) => {
                1 + 4
                    + map
                        .iter()
                        .map(|(k, v)| 4 + k.len() + v.encoded_len())
                        .sum::<usize>()
            }
        }
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int32(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int64(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float64(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Binary(value)
    }
}

impl From<Uuid> for Value {
    fn from(value: Uuid) -> Self {
        Value::Uuid(value)
    }
}

impl From<ObjectId> for Value {
    fn from(value: ObjectId) -> Self {
        Value::ObjectId(value)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::MinValue => write!(f, "$minValue"),
            Value::MaxValue => write!(f, "$maxValue"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int32(i) => write!(f, "{}", i),
            Value::Int64(i) => write!(f, "{}", i),
            Value::Float64(fl) => write!(f, "{}", fl),
            Value::String(s) => write!(f, "\"{}\"", s),
            Value::Binary(b) => write!(f, "0x{}", hex::encode(b)),
            Value::DateTime(dt) => write!(f, "{}", dt.to_rfc3339()),
            Value::Uuid(u) => write!(f, "{}", u),
            Value::ObjectId(oid) => write!(f, "{}", oid),
            Value::Array(arr) => {
                let items: Vec<String> = arr.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", items.join(", "))
            }
            Value::Object(obj) => {
                let items: Vec<String> = obj
                    .iter()
                    .map(|(k, v)| format!("\"{}\": {}", k, v))
                    .collect();
                write!(f, "{{{}}}", items.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub(crate) [u8; 12]);

impl ObjectId {
    /// Generate a new ObjectId
    ///
    /// Layout: 4-byte big-endian timestamp, 3-byte machine hash, 2-byte
    /// process id, 3-byte counter seeded from OS entropy.
    pub fn new() -> Result<Self> {
        static MACHINE_BYTES: OnceLock<[u8; 3]> = OnceLock::new();
        static PROCESS_BYTES: OnceLock<[u8; 2]> = OnceLock::new();
        static COUNTER: OnceLock<AtomicU32> = OnceLock::new();

        let mut bytes = [0u8; 12];

        // 4-byte timestamp (big-endian)
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|e| SoloError::Io(format!("System time error: {e}")))?
            .as_secs() as u32;
        bytes[0..4].copy_from_slice(&timestamp.to_be_bytes());

        // 3-byte machine identifier
        let machine_bytes = MACHINE_BYTES.get_or_init(|| {
            let mut hasher = Sha1::new();

            if let Ok(hostname) = std::env::var("HOSTNAME") {
                hasher.update(hostname.as_bytes());
            } else if let Ok(hostname) = std::env::var("COMPUTERNAME") {
                hasher.update(hostname.as_bytes());
            } else {
                hasher.update(std::process::id().to_be_bytes());
                hasher.update(b"solodb_fallback_id");
            }

            let hash = hasher.finalize();
            [hash[0], hash[1], hash[2]]
        });
        bytes[4..7].copy_from_slice(machine_bytes);

        // 2-byte process identifier
        let process_bytes = PROCESS_BYTES.get_or_init(|| {
            let pid = std::process::id();
            [((pid >> 8) & 0xFF) as u8, (pid & 0xFF) as u8]
        });
        bytes[7..9].copy_from_slice(process_bytes);

        // 3-byte counter
        let counter_atomic = COUNTER.get_or_init(|| {
            let mut rng = OsRng;
            let mut random_bytes = [0u8; 4];

            if rng.try_fill_bytes(&mut random_bytes).is_ok() {
                let initial = u32::from_be_bytes(random_bytes) & 0xFFFFFF;
                AtomicU32::new(initial)
            } else {
                let fallback = (std::process::id() ^ 0xDEADBEEF) & 0xFFFFFF;
                AtomicU32::new(fallback)
            }
        });

        let counter = counter_atomic.fetch_add(1, std::sync::atomic::Ordering::SeqCst) & 0xFFFFFF;
        bytes[9] = ((counter >> 16) & 0xFF) as u8;
        bytes[10] = ((counter >> 8) & 0xFF) as u8;
        bytes[11] = (counter & 0xFF) as u8;

        Ok(Self(bytes))
    }

    pub fn bytes(&self) -> [u8; 12] {
        self.0
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != 24 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(SoloError::Parse("Invalid ObjectId hex string".into()));
        }
        let mut bytes = [0u8; 12];
        for i in 0..12 {
            let byte_str = &s[i * 2..i * 2 + 2];
            bytes[i] = u8::from_str_radix(byte_str, 16)
                .map_err(|_| SoloError::Parse("Invalid ObjectId hex string".into()))?;
        }
        Ok(Self(bytes))
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}
