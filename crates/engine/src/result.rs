//! Result delivery
//!
//! ```text
//! PendingResult ──into_single──▶ SingleValueReady ──▶ (value taken)
//!    │
//!    └──into_stream──▶ Streaming ──next_row──▶ RowReady ──▶ ... ──▶ Exhausted
//! ```
//!
//! A [`PendingResult`] pairs the descriptor of one call with the raw result
//! its node returned. It is consumed exactly once, either as a single value
//! or as a [`RowStream`]. A stream yields one converted row per resumption;
//! once exhausted it keeps reporting end-of-sequence.

use crate::codec::{CachedType, RecordField};
use crate::function::RoutingDescriptor;
use shardcall_core::{CallId, ProxyError, ProxyResult, RawResult, Value, WireRow};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Where a consumed result is in its lifecycle. An unconsumed result is a
/// [`PendingResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Being converted to the call's single value
    SingleValueReady,
    /// Set result started, no row delivered yet
    Streaming,
    /// At least one row delivered, more may follow
    RowReady,
    /// Every row delivered
    Exhausted,
}

/// How remote rows become values
#[derive(Debug, Clone)]
pub enum RowDecoder {
    /// First column through the return codec
    Typed {
        /// Return codec
        ty: Arc<CachedType>,
        /// Return type modifier
        typmod: i32,
    },
    /// Every column through its own codec, into a record
    Record {
        /// Expected columns
        fields: Vec<RecordField>,
    },
}

impl RowDecoder {
    /// Decoder for a descriptor; anonymous records use the call's columns.
    pub fn for_call(descriptor: &RoutingDescriptor, fields: Option<Vec<RecordField>>) -> Self {
        match fields {
            Some(fields) if descriptor.is_untyped_record() => RowDecoder::Record { fields },
            _ => RowDecoder::Typed {
                ty: Arc::clone(descriptor.return_type()),
                typmod: descriptor.return_typmod(),
            },
        }
    }

    fn decode(&self, row: WireRow) -> Result<Value, String> {
        match self {
            RowDecoder::Typed { ty, typmod } => {
                let field = row
                    .into_iter()
                    .next()
                    .ok_or_else(|| "remote row has no columns".to_string())?;
                ty.decode(field.as_ref(), *typmod).map_err(|e| e.to_string())
            }
            RowDecoder::Record { fields } => {
                if row.len() != fields.len() {
                    return Err(format!(
                        "remote row has {} columns, expected {}",
                        row.len(),
                        fields.len()
                    ));
                }
                row.iter()
                    .zip(fields)
                    .map(|(field, column)| column.ty.decode(field.as_ref(), -1))
                    .collect::<ProxyResult<Vec<_>>>()
                    .map(Value::Record)
                    .map_err(|e| e.to_string())
            }
        }
    }
}

/// Node a result came from, for error context
#[derive(Debug, Clone)]
pub struct ResultOrigin {
    /// Cluster name
    pub cluster: String,
    /// Node index
    pub node: usize,
}

/// One call's raw result, not yet delivered
pub struct PendingResult {
    descriptor: Arc<RoutingDescriptor>,
    raw: RawResult,
    decoder: RowDecoder,
    origin: ResultOrigin,
}

impl PendingResult {
    /// Pair a raw result with the call that produced it
    pub fn new(
        descriptor: Arc<RoutingDescriptor>,
        raw: RawResult,
        decoder: RowDecoder,
        origin: ResultOrigin,
    ) -> Self {
        PendingResult {
            descriptor,
            raw,
            decoder,
            origin,
        }
    }

    /// True when the call is set-returning
    pub fn returns_set(&self) -> bool {
        self.descriptor.returns_set()
    }

    /// Rows not yet delivered
    pub fn remaining(&self) -> usize {
        self.raw.remaining()
    }

    /// Convert to the call's single value.
    ///
    /// # Errors
    ///
    /// `RemoteQueryError` unless the node returned exactly one row, or if
    /// the row does not decode.
    pub fn into_single(mut self) -> ProxyResult<Value> {
        let rows = self.raw.remaining();
        if rows != 1 {
            return Err(self.error(format!("expected exactly one row, got {}", rows)));
        }
        debug!(
            target: "shardcall::result",
            function = %self.descriptor.name(),
            state = ?DeliveryState::SingleValueReady,
            "Delivering single value"
        );
        let row = self
            .raw
            .fetch_row()
            .ok_or_else(|| self.error("result ended early"))?;
        self.decoder.decode(row).map_err(|e| self.error(e))
    }

    /// Start delivering rows one at a time
    pub fn into_stream(self) -> RowStream {
        debug!(
            target: "shardcall::result",
            function = %self.descriptor.name(),
            rows = self.raw.remaining(),
            "Streaming result"
        );
        RowStream {
            pending: Some(self),
            state: DeliveryState::Streaming,
        }
    }

    fn error(&self, message: impl Into<String>) -> ProxyError {
        ProxyError::RemoteQueryError {
            function: self.descriptor.name().to_string(),
            cluster: self.origin.cluster.clone(),
            node: self.origin.node,
            message: message.into(),
        }
    }
}

/// Resumable row sequence for a set-returning call
pub struct RowStream {
    pending: Option<PendingResult>,
    state: DeliveryState,
}

impl RowStream {
    /// Current state
    pub fn state(&self) -> DeliveryState {
        self.state
    }

    /// Next converted row, or `None` once exhausted (and on every later
    /// call). The raw result is released as soon as the last row is taken.
    ///
    /// # Errors
    ///
    /// `RemoteQueryError` if a row does not decode; the stream is then
    /// exhausted.
    pub fn next_row(&mut self) -> ProxyResult<Option<Value>> {
        let pending = match self.pending.as_mut() {
            Some(pending) => pending,
            None => {
                self.state = DeliveryState::Exhausted;
                return Ok(None);
            }
        };
        let row = match pending.raw.fetch_row() {
            Some(row) => row,
            None => {
                self.finish();
                return Ok(None);
            }
        };
        match pending.decoder.decode(row) {
            Ok(value) => {
                self.state = DeliveryState::RowReady;
                if pending.raw.remaining() == 0 {
                    // Release the raw result with its last row.
                    self.pending = None;
                }
                Ok(Some(value))
            }
            Err(message) => {
                let err = pending.error(message);
                self.finish();
                Err(err)
            }
        }
    }

    /// True once every row has been delivered
    pub fn is_exhausted(&self) -> bool {
        self.pending.is_none()
    }

    fn finish(&mut self) {
        self.pending = None;
        self.state = DeliveryState::Exhausted;
    }
}

/// Streams of set-returning calls still being resumed, by call
#[derive(Default)]
pub struct ResultCache {
    streams: HashMap<CallId, RowStream>,
}

impl ResultCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the stream of a call's first invocation, replacing any
    /// leftover stream under the same id
    pub fn start(&mut self, call: CallId, stream: RowStream) {
        if self.streams.insert(call, stream).is_some() {
            debug!(target: "shardcall::result", %call, "Replaced unfinished stream");
        }
    }

    /// Take a call's stream out for resumption
    pub fn take(&mut self, call: CallId) -> Option<RowStream> {
        self.streams.remove(&call)
    }

    /// Put a stream back after a resumption that left rows behind
    pub fn put_back(&mut self, call: CallId, stream: RowStream) {
        self.streams.insert(call, stream);
    }

    /// Drop a call's stream; returns whether there was one
    pub fn abandon(&mut self, call: CallId) -> bool {
        self.streams.remove(&call).is_some()
    }

    /// Number of streams in progress
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// True when no call is streaming
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
