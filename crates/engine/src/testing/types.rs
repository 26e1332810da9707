//! A small built-in type set
//!
//! | type | id | binary | category |
//! |---|---|---|---|
//! | int4 | 23 | yes | integer |
//! | int8 | 20 | yes | integer |
//! | text | 25 | no | scalar |
//! | record | 2249 | no | untyped record |

use parking_lot::Mutex;
use shardcall_core::{
    CodecError, ProxyResult, Stamp, TypeCategory, TypeCodec, TypeDefinition, TypeId, TypeProvider,
    Value,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Integer codec of a fixed byte width, big-endian on the wire
struct IntCodec {
    width: usize,
}

impl IntCodec {
    fn check(&self, n: i64) -> Result<i64, CodecError> {
        let fits = match self.width {
            4 => i32::try_from(n).is_ok(),
            _ => true,
        };
        if fits {
            Ok(n)
        } else {
            Err(CodecError::new(format!("{} out of range", n)))
        }
    }
}

impl TypeCodec for IntCodec {
    fn supports_binary(&self) -> bool {
        true
    }

    fn encode_binary(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        let n = value
            .as_int()
            .ok_or_else(|| CodecError::new(format!("expected integer, got {}", value.type_name())))?;
        let n = self.check(n)?;
        Ok(n.to_be_bytes()[8 - self.width..].to_vec())
    }

    fn encode_text(&self, value: &Value) -> Result<String, CodecError> {
        let n = value
            .as_int()
            .ok_or_else(|| CodecError::new(format!("expected integer, got {}", value.type_name())))?;
        Ok(self.check(n)?.to_string())
    }

    fn decode_binary(&self, bytes: &[u8], _io_param: u32, _typmod: i32) -> Result<Value, CodecError> {
        if bytes.len() != self.width {
            return Err(CodecError::new(format!(
                "expected {} bytes, got {}",
                self.width,
                bytes.len()
            )));
        }
        let n = match self.width {
            4 => i64::from(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            _ => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(bytes);
                i64::from_be_bytes(buf)
            }
        };
        Ok(Value::Int(n))
    }

    fn decode_text(&self, text: &str, _io_param: u32, _typmod: i32) -> Result<Value, CodecError> {
        let n = text
            .trim()
            .parse::<i64>()
            .map_err(|_| CodecError::new(format!("invalid integer '{}'", text)))?;
        self.check(n).map(Value::Int)
    }
}

/// Text codec; text transfer only
struct TextCodec;

impl TypeCodec for TextCodec {
    fn supports_binary(&self) -> bool {
        false
    }

    fn encode_binary(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        self.encode_text(value).map(String::into_bytes)
    }

    fn encode_text(&self, value: &Value) -> Result<String, CodecError> {
        match value {
            Value::Text(s) => Ok(s.clone()),
            Value::Int(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            other => Err(CodecError::new(format!(
                "cannot send {} as text",
                other.type_name()
            ))),
        }
    }

    fn decode_binary(&self, bytes: &[u8], _io_param: u32, _typmod: i32) -> Result<Value, CodecError> {
        String::from_utf8(bytes.to_vec())
            .map(Value::Text)
            .map_err(|_| CodecError::new("invalid utf-8"))
    }

    fn decode_text(&self, text: &str, _io_param: u32, _typmod: i32) -> Result<Value, CodecError> {
        Ok(Value::Text(text.to_string()))
    }
}

/// Anonymous record; columns are decoded one by one with their own codecs,
/// so this codec only ever sees whole-record text
struct RecordCodec;

impl TypeCodec for RecordCodec {
    fn supports_binary(&self) -> bool {
        false
    }

    fn encode_binary(&self, _value: &Value) -> Result<Vec<u8>, CodecError> {
        Err(CodecError::new("record has no binary form"))
    }

    fn encode_text(&self, _value: &Value) -> Result<String, CodecError> {
        Err(CodecError::new("cannot send an anonymous record"))
    }

    fn decode_binary(&self, _bytes: &[u8], _io_param: u32, _typmod: i32) -> Result<Value, CodecError> {
        Err(CodecError::new("record has no binary form"))
    }

    fn decode_text(&self, text: &str, _io_param: u32, _typmod: i32) -> Result<Value, CodecError> {
        Ok(Value::Text(text.to_string()))
    }
}

/// [`TypeProvider`] serving int4, int8, text and record
pub struct BuiltinTypes {
    types: Mutex<HashMap<TypeId, TypeDefinition>>,
    loads: AtomicUsize,
}

impl BuiltinTypes {
    /// `int4`
    pub const INT4: TypeId = TypeId(23);
    /// `int8`
    pub const INT8: TypeId = TypeId(20);
    /// `text`
    pub const TEXT: TypeId = TypeId(25);
    /// `record`
    pub const RECORD: TypeId = TypeId(2249);

    /// The four built-in types
    pub fn new() -> Self {
        let defs: [(TypeId, &str, Arc<dyn TypeCodec>, TypeCategory); 4] = [
            (Self::INT4, "int4", Arc::new(IntCodec { width: 4 }), TypeCategory::Integer),
            (Self::INT8, "int8", Arc::new(IntCodec { width: 8 }), TypeCategory::Integer),
            (Self::TEXT, "text", Arc::new(TextCodec), TypeCategory::Scalar),
            (Self::RECORD, "record", Arc::new(RecordCodec), TypeCategory::UntypedRecord),
        ];
        let types = defs
            .into_iter()
            .map(|(id, name, codec, category)| {
                let def = TypeDefinition {
                    id,
                    name: name.to_string(),
                    codec,
                    io_param: id.0,
                    category,
                    stamp: Stamp::new(1, u64::from(id.0)),
                };
                (id, def)
            })
            .collect();
        BuiltinTypes {
            types: Mutex::new(types),
            loads: AtomicUsize::new(0),
        }
    }

    /// Advance a type's stamp, as an `ALTER TYPE` would
    pub fn touch(&self, id: TypeId) {
        if let Some(def) = self.types.lock().get_mut(&id) {
            def.stamp = def.stamp.next();
        }
    }

    /// How many times `load_type` ran
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl Default for BuiltinTypes {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeProvider for BuiltinTypes {
    fn load_type(&self, id: TypeId) -> ProxyResult<Option<TypeDefinition>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.types.lock().get(&id).cloned())
    }

    fn type_stamp(&self, id: TypeId) -> ProxyResult<Option<Stamp>> {
        Ok(self.types.lock().get(&id).map(|d| d.stamp))
    }
}
