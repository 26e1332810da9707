//! Type codec cache
//!
//! Memoizes the codec handle for each type id. Every lookup compares the
//! cached stamp against the provider's current one and reloads on mismatch,
//! so an `ALTER TYPE` in the host is picked up by the next call.

use shardcall_core::{
    DefinitionKind, ProxyError, ProxyResult, Stamp, TypeCategory, TypeDefinition, TypeId,
    TypeProvider, Value, WireFormat, WireValue,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A loaded type with its codec
#[derive(Debug)]
pub struct CachedType {
    def: TypeDefinition,
}

impl CachedType {
    /// Wrap a definition from the provider
    pub fn new(def: TypeDefinition) -> Self {
        CachedType { def }
    }

    /// Type id
    pub fn id(&self) -> TypeId {
        self.def.id
    }

    /// SQL name
    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Category
    pub fn category(&self) -> TypeCategory {
        self.def.category
    }

    /// Version this codec was loaded from
    pub fn stamp(&self) -> Stamp {
        self.def.stamp
    }

    /// Whether the codec can transfer values in binary
    pub fn supports_binary(&self) -> bool {
        self.def.codec.supports_binary()
    }

    /// Encode a value for the wire; `Null` becomes an absent field.
    pub fn encode(&self, value: &Value, format: WireFormat) -> ProxyResult<Option<WireValue>> {
        if value.is_null() {
            return Ok(None);
        }
        self.def
            .codec
            .encode(value, format)
            .map(Some)
            .map_err(|e| self.codec_error(e.to_string()))
    }

    /// Decode a wire field; an absent field is `Null`.
    pub fn decode(&self, field: Option<&WireValue>, typmod: i32) -> ProxyResult<Value> {
        match field {
            None => Ok(Value::Null),
            Some(field) => self
                .def
                .codec
                .decode(field, self.def.io_param, typmod)
                .map_err(|e| self.codec_error(e.to_string())),
        }
    }

    fn codec_error(&self, reason: String) -> ProxyError {
        ProxyError::parse(format!("value of type {}", self.def.name), reason)
    }
}

/// One column of an anonymous record, resolved to its codec
#[derive(Debug, Clone)]
pub struct RecordField {
    /// Column name
    pub name: String,
    /// Column type
    pub ty: Arc<CachedType>,
}

/// Cache of type codecs by type id
#[derive(Default)]
pub struct TypeCodecCache {
    types: HashMap<TypeId, Arc<CachedType>>,
}

impl TypeCodecCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a fresh codec for `id`, loading or reloading as needed.
    ///
    /// # Errors
    ///
    /// `DefinitionNotFound` if the provider does not know the type.
    pub fn get(&mut self, id: TypeId, provider: &dyn TypeProvider) -> ProxyResult<Arc<CachedType>> {
        let current = provider
            .type_stamp(id)?
            .ok_or_else(|| ProxyError::not_found(DefinitionKind::Type, id.to_string()))?;
        if let Some(cached) = self.types.get(&id) {
            if cached.stamp().matches(&current) {
                return Ok(Arc::clone(cached));
            }
            debug!(target: "shardcall::function", type_id = %id, "Type changed, reloading codec");
        }
        let def = provider
            .load_type(id)?
            .ok_or_else(|| ProxyError::not_found(DefinitionKind::Type, id.to_string()))?;
        let cached = Arc::new(CachedType::new(def));
        self.types.insert(id, Arc::clone(&cached));
        Ok(cached)
    }

    /// True when `ty` still matches the provider's current version
    pub fn is_fresh(ty: &CachedType, provider: &dyn TypeProvider) -> ProxyResult<bool> {
        Ok(provider
            .type_stamp(ty.id())?
            .map_or(false, |s| ty.stamp().matches(&s)))
    }

    /// Drop every cached codec
    pub fn clear(&mut self) {
        self.types.clear();
    }

    /// Number of cached codecs
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// True when nothing is cached
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
