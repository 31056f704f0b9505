//! Dynamic values as they cross the wire boundary.

use bytes::Bytes;

/// A value attached to a parameter or read back from the server.
///
/// This is the engine's dynamic value representation: rich enough for the
/// describe-parameter-encryption result sets, return values and scalar
/// results, and deliberately nothing more. Full row materialization
/// belongs to the result-reader collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    /// SQL NULL.
    Null,
    /// BIT.
    Bool(bool),
    /// TINYINT.
    TinyInt(u8),
    /// SMALLINT.
    SmallInt(i16),
    /// INT.
    Int(i32),
    /// BIGINT.
    BigInt(i64),
    /// REAL/FLOAT.
    Double(f64),
    /// DECIMAL/NUMERIC carried with its precision and scale.
    Decimal {
        /// Unscaled two's-complement value.
        unscaled: i128,
        /// Total digits.
        precision: u8,
        /// Digits right of the point.
        scale: u8,
    },
    /// Character data (any collation, already decoded).
    String(String),
    /// Raw binary data, including encrypted cells and UDT payloads.
    Bytes(Bytes),
    /// An XML fragment buffered by the wire layer.
    ///
    /// Kept separate from [`WireValue::String`] so the output binder knows
    /// to materialize the cached buffer into a string.
    Xml(Bytes),
    /// UNIQUEIDENTIFIER in wire byte order.
    Guid([u8; 16]),
}

impl WireValue {
    /// Whether this is SQL NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// View as a string slice, when the value is character data.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// View as raw bytes, when the value is binary data.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Narrow to `i32`, widening smaller integers.
    #[must_use]
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::TinyInt(v) => Some(i32::from(*v)),
            Self::SmallInt(v) => Some(i32::from(*v)),
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Narrow to `bool`.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }
}
