//! Checkpoint data codec
//!
//! Step logic hands the engine arbitrary values to keep across restarts:
//! persistent user data, reader/writer checkpoints, and the failure that ended
//! a step. [`CheckpointData`] holds such a value in one of two forms:
//!
//! - **live**: primitive-like values ([`Primitive`]) and raw byte payloads are
//!   kept as they are, with no serialization and nothing to resolve on read;
//! - **encoded**: every other value is turned into bytes at write time by the
//!   active [`SerializationProvider`], tagged with the name of its type.
//!
//! The provider is chosen once at startup through [`PayloadCodec::select`] and
//! the resulting codec is handed to every context that reads or writes
//! checkpoint data.
//!
//! # Example
//!
//! ```
//! use jobline_core::checkpoint::{Checkpoint, PayloadCodec};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct Position {
//!     file: String,
//!     line: u64,
//! }
//!
//! impl Checkpoint for Position {}
//!
//! let codec = PayloadCodec::default();
//! let data = codec
//!     .encode(Position { file: "orders.csv".into(), line: 120 })
//!     .unwrap();
//! assert!(data.is_serialized());
//!
//! let restored: Position = codec.decode(&data).unwrap();
//! assert_eq!(restored.line, 120);
//! ```

use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, warn};

/// Type tag recorded for raw byte payloads
pub const BYTES_TYPE: &str = "bytes";

/// Errors raised while moving checkpoint data in or out of its stored form
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("Failed to encode checkpoint data of type {type_name}: {reason}")]
    Encode { type_name: String, reason: String },

    #[error("Failed to decode checkpoint data as {type_name}: {reason}")]
    Decode { type_name: String, reason: String },
}

/// Values that are stored live, without serialization.
///
/// Floating-point values compare by bit pattern, so `0.0` and `-0.0` differ
/// and `NaN` equals itself. This keeps equality consistent with [`Hash`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Primitive {
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    BigInt(i128),
    Float(f32),
    Double(f64),
    Text(String),
    Decimal(Decimal),
}

impl Primitive {
    /// Name of the Rust type this primitive was built from
    pub fn type_name(&self) -> &'static str {
        match self {
            Primitive::Byte(_) => "i8",
            Primitive::Short(_) => "i16",
            Primitive::Int(_) => "i32",
            Primitive::Long(_) => "i64",
            Primitive::BigInt(_) => "i128",
            Primitive::Float(_) => "f32",
            Primitive::Double(_) => "f64",
            Primitive::Text(_) => "String",
            Primitive::Decimal(_) => "Decimal",
        }
    }
}

impl PartialEq for Primitive {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Primitive::Byte(a), Primitive::Byte(b)) => a == b,
            (Primitive::Short(a), Primitive::Short(b)) => a == b,
            (Primitive::Int(a), Primitive::Int(b)) => a == b,
            (Primitive::Long(a), Primitive::Long(b)) => a == b,
            (Primitive::BigInt(a), Primitive::BigInt(b)) => a == b,
            (Primitive::Float(a), Primitive::Float(b)) => a.to_bits() == b.to_bits(),
            (Primitive::Double(a), Primitive::Double(b)) => a.to_bits() == b.to_bits(),
            (Primitive::Text(a), Primitive::Text(b)) => a == b,
            (Primitive::Decimal(a), Primitive::Decimal(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Primitive {}

impl Hash for Primitive {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Primitive::Byte(v) => v.hash(state),
            Primitive::Short(v) => v.hash(state),
            Primitive::Int(v) => v.hash(state),
            Primitive::Long(v) => v.hash(state),
            Primitive::BigInt(v) => v.hash(state),
            Primitive::Float(v) => v.to_bits().hash(state),
            Primitive::Double(v) => v.to_bits().hash(state),
            Primitive::Text(v) => v.hash(state),
            Primitive::Decimal(v) => v.hash(state),
        }
    }
}

/// Message and cause chain of a failure, in a form that always encodes.
///
/// Used as the exception data of failed steps and as the substitute when a
/// failure-like value cannot be encoded itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stack_trace: Vec<String>,
}

impl BatchFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack_trace: Vec::new(),
        }
    }

    /// Capture an error's message and its source chain
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            message: err.to_string(),
            stack_trace: err.chain().skip(1).map(|cause| cause.to_string()).collect(),
        }
    }
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        for cause in &self.stack_trace {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

/// A value that can be stored as checkpoint data.
///
/// User types opt in with an empty impl; serde does the encoding.
/// Primitive-like types override [`Checkpoint::into_primitive`] so they are
/// kept live, and failure types override [`Checkpoint::as_failure`] so a
/// substitute can be stored when they cannot be encoded.
pub trait Checkpoint: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Hand the value back as a [`Primitive`] if it is stored live
    fn into_primitive(self) -> Result<Primitive, Self>
    where
        Self: Sized,
    {
        Err(self)
    }

    /// Rebuild the value from a live [`Primitive`]
    fn from_primitive(_primitive: &Primitive) -> Option<Self>
    where
        Self: Sized,
    {
        None
    }

    /// Failure details to store in place of this value if it cannot be encoded
    fn as_failure(&self) -> Option<BatchFailure> {
        None
    }
}

macro_rules! primitive_checkpoint {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl Checkpoint for $ty {
                fn into_primitive(self) -> Result<Primitive, Self> {
                    Ok(Primitive::$variant(self))
                }

                fn from_primitive(primitive: &Primitive) -> Option<Self> {
                    match primitive {
                        Primitive::$variant(value) => Some(value.clone()),
                        _ => None,
                    }
                }
            }
        )*
    };
}

primitive_checkpoint! {
    i8 => Byte,
    i16 => Short,
    i32 => Int,
    i64 => Long,
    i128 => BigInt,
    f32 => Float,
    f64 => Double,
    String => Text,
    Decimal => Decimal,
}

impl Checkpoint for BatchFailure {
    fn as_failure(&self) -> Option<BatchFailure> {
        Some(self.clone())
    }
}

impl Checkpoint for serde_json::Value {}

/// Checkpoint data as held by execution records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    raw: Option<Primitive>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    serialized: Option<Vec<u8>>,
    type_name: String,
}

impl CheckpointData {
    fn live(primitive: Primitive) -> Self {
        Self {
            type_name: primitive.type_name().to_string(),
            raw: Some(primitive),
            serialized: None,
        }
    }

    fn encoded(bytes: Vec<u8>, type_name: &str) -> Self {
        Self {
            raw: None,
            serialized: Some(bytes),
            type_name: type_name.to_string(),
        }
    }

    /// Wrap a raw byte payload; it is stored exactly as given
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self::encoded(bytes, BYTES_TYPE)
    }

    /// The live value, when this data was never serialized
    pub fn primitive(&self) -> Option<&Primitive> {
        self.raw.as_ref()
    }

    /// The payload of data created with [`CheckpointData::from_bytes`]
    pub fn bytes(&self) -> Option<&[u8]> {
        if self.type_name == BYTES_TYPE {
            self.serialized.as_deref()
        } else {
            None
        }
    }

    /// The encoded form, if any
    pub fn serialized(&self) -> Option<&[u8]> {
        self.serialized.as_deref()
    }

    pub fn is_serialized(&self) -> bool {
        self.raw.is_none() && self.type_name != BYTES_TYPE
    }

    /// Type recorded when the data was written
    pub fn type_name(&self) -> &str {
        &self.type_name
    }
}

impl PartialEq for CheckpointData {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw && self.serialized == other.serialized
    }
}

impl Eq for CheckpointData {}

impl Hash for CheckpointData {
    fn hash<H: Hasher>(&self, state: &mut H) {
        if let Some(raw) = &self.raw {
            raw.hash(state);
        }
        if let Some(serialized) = &self.serialized {
            serialized.hash(state);
        }
    }
}

/// Encoding strategy used for non-primitive checkpoint data.
///
/// Values reach the provider as a serde document; the provider decides the
/// byte layout.
pub trait SerializationProvider: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn object_to_bytes(&self, document: &serde_json::Value) -> anyhow::Result<Vec<u8>>;

    fn bytes_to_object(&self, bytes: &[u8]) -> anyhow::Result<serde_json::Value>;
}

/// Default provider: compact JSON
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonProvider;

impl SerializationProvider for JsonProvider {
    fn name(&self) -> &str {
        "json"
    }

    fn object_to_bytes(&self, document: &serde_json::Value) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(document)?)
    }

    fn bytes_to_object(&self, bytes: &[u8]) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// The process-wide checkpoint codec.
///
/// Cheap to clone; every clone shares the provider selected at startup.
#[derive(Clone)]
pub struct PayloadCodec {
    provider: Arc<dyn SerializationProvider>,
}

impl fmt::Debug for PayloadCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadCodec")
            .field("provider", &self.provider.name())
            .finish()
    }
}

impl Default for PayloadCodec {
    fn default() -> Self {
        Self::new(Arc::new(JsonProvider))
    }
}

impl PayloadCodec {
    pub fn new(provider: Arc<dyn SerializationProvider>) -> Self {
        Self { provider }
    }

    /// Pick the provider for this process: a discovered override, else JSON
    pub fn select(discovered: Option<Arc<dyn SerializationProvider>>) -> Self {
        let codec = match discovered {
            Some(provider) => Self::new(provider),
            None => Self::default(),
        };
        debug!(provider = %codec.provider_name(), "Checkpoint codec selected");
        codec
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Store a value as checkpoint data.
    ///
    /// Primitives are kept live. Anything else is encoded now; if that fails
    /// and the value describes a failure, a [`BatchFailure`] carrying its
    /// message and trace is encoded instead.
    pub fn encode<T: Checkpoint>(&self, value: T) -> Result<CheckpointData, CodecError> {
        let value = match value.into_primitive() {
            Ok(primitive) => return Ok(CheckpointData::live(primitive)),
            Err(value) => value,
        };

        let type_name = std::any::type_name::<T>();
        match self.serialize(&value) {
            Ok(bytes) => Ok(CheckpointData::encoded(bytes, type_name)),
            Err(reason) => {
                let Some(failure) = value.as_failure() else {
                    return Err(CodecError::Encode {
                        type_name: type_name.to_string(),
                        reason,
                    });
                };

                warn!(
                    type_name = %type_name,
                    error = %reason,
                    message = %failure.message,
                    "Failed to encode failure data, storing substitute"
                );
                let substitute_type = std::any::type_name::<BatchFailure>();
                let bytes = self
                    .serialize(&failure)
                    .map_err(|reason| CodecError::Encode {
                        type_name: substitute_type.to_string(),
                        reason,
                    })?;
                Ok(CheckpointData::encoded(bytes, substitute_type))
            }
        }
    }

    /// Read checkpoint data back as `T`
    pub fn decode<T: Checkpoint>(&self, data: &CheckpointData) -> Result<T, CodecError> {
        let type_name = std::any::type_name::<T>();

        if let Some(primitive) = data.primitive() {
            return T::from_primitive(primitive).ok_or_else(|| CodecError::Decode {
                type_name: type_name.to_string(),
                reason: format!("stored value is a live {}", primitive.type_name()),
            });
        }

        let document = self.to_document(data)?;
        serde_json::from_value(document).map_err(|e| CodecError::Decode {
            type_name: type_name.to_string(),
            reason: e.to_string(),
        })
    }

    /// Read checkpoint data without a target type.
    ///
    /// Used when the reader has no type to resolve the data against, e.g.
    /// diagnostics or a process that never linked the writer's type.
    pub fn to_document(&self, data: &CheckpointData) -> Result<serde_json::Value, CodecError> {
        if let Some(primitive) = data.primitive() {
            return serde_json::to_value(primitive).map_err(|e| CodecError::Decode {
                type_name: primitive.type_name().to_string(),
                reason: e.to_string(),
            });
        }

        if data.bytes().is_some() {
            return Err(CodecError::Decode {
                type_name: data.type_name().to_string(),
                reason: "raw byte payloads are read with CheckpointData::bytes".to_string(),
            });
        }

        let bytes = data.serialized().ok_or_else(|| CodecError::Decode {
            type_name: data.type_name().to_string(),
            reason: "no stored value".to_string(),
        })?;

        self.provider
            .bytes_to_object(bytes)
            .map_err(|e| CodecError::Decode {
                type_name: data.type_name().to_string(),
                reason: format!("{:#}", e),
            })
    }

    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, String> {
        let document = serde_json::to_value(value).map_err(|e| e.to_string())?;
        self.provider
            .object_to_bytes(&document)
            .map_err(|e| format!("{:#}", e))
    }
}
