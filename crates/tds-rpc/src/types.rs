//! The closed enumeration of server data types.
//!
//! Every parameter declares one of these types. The enumeration fixes the
//! rules the signature generator and the record builder need: which types
//! are variable-length, which can spill into partially-length-prefixed
//! (PLP) streams, which carry precision/scale, and what each type is
//! called in a parameter declaration.

/// A server-side data type as declared on a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlType {
    /// BIT.
    Bit,
    /// TINYINT.
    TinyInt,
    /// SMALLINT.
    SmallInt,
    /// INT.
    Int,
    /// BIGINT.
    BigInt,
    /// REAL (4-byte float).
    Real,
    /// FLOAT (8-byte float).
    Float,
    /// SMALLMONEY.
    SmallMoney,
    /// MONEY.
    Money,
    /// DECIMAL/NUMERIC with precision and scale.
    Decimal,
    /// CHAR (fixed single-byte characters).
    Char,
    /// VARCHAR.
    VarChar,
    /// NCHAR (fixed UTF-16 characters).
    NChar,
    /// NVARCHAR.
    NVarChar,
    /// BINARY.
    Binary,
    /// VARBINARY.
    VarBinary,
    /// UNIQUEIDENTIFIER.
    UniqueIdentifier,
    /// DATE.
    Date,
    /// TIME with fractional-second scale.
    Time,
    /// SMALLDATETIME.
    SmallDateTime,
    /// DATETIME.
    DateTime,
    /// DATETIME2 with fractional-second scale.
    DateTime2,
    /// DATETIMEOFFSET with fractional-second scale.
    DateTimeOffset,
    /// XML documents.
    Xml,
    /// JSON documents.
    Json,
    /// SQL_VARIANT.
    Variant,
    /// A CLR user-defined type; materialized through the connection's UDT factory.
    Udt,
    /// A table-valued parameter.
    Structured,
}

/// How a type's modifiers appear in a parameter-list signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureModifier {
    /// `(precision, scale)`.
    PrecisionScale,
    /// `(scale)` — temporal types with fractional seconds.
    Scale,
    /// `(length)` — non-PLP variable-length declarations.
    Length,
    /// `(max)` — PLP declarations.
    Max,
    /// No modifier.
    None,
}

impl SqlType {
    /// The type name as it appears in parameter declarations.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bit => "bit",
            Self::TinyInt => "tinyint",
            Self::SmallInt => "smallint",
            Self::Int => "int",
            Self::BigInt => "bigint",
            Self::Real => "real",
            Self::Float => "float",
            Self::SmallMoney => "smallmoney",
            Self::Money => "money",
            Self::Decimal => "decimal",
            Self::Char => "char",
            Self::VarChar => "varchar",
            Self::NChar => "nchar",
            Self::NVarChar => "nvarchar",
            Self::Binary => "binary",
            Self::VarBinary => "varbinary",
            Self::UniqueIdentifier => "uniqueidentifier",
            Self::Date => "date",
            Self::Time => "time",
            Self::SmallDateTime => "smalldatetime",
            Self::DateTime => "datetime",
            Self::DateTime2 => "datetime2",
            Self::DateTimeOffset => "datetimeoffset",
            Self::Xml => "xml",
            Self::Json => "json",
            Self::Variant => "sql_variant",
            Self::Udt => "udt",
            Self::Structured => "structured",
        }
    }

    /// Whether the declared size participates in the wire declaration.
    #[must_use]
    pub fn is_variable_length(&self) -> bool {
        matches!(
            self,
            Self::Char
                | Self::VarChar
                | Self::NChar
                | Self::NVarChar
                | Self::Binary
                | Self::VarBinary
        )
    }

    /// Whether this type can be declared as a PLP (`max`) stream.
    #[must_use]
    pub fn is_plp_capable(&self) -> bool {
        matches!(
            self,
            Self::VarChar | Self::NVarChar | Self::VarBinary | Self::Xml | Self::Json | Self::Udt
        )
    }

    /// Whether values are single-byte (ANSI) character data.
    ///
    /// ANSI declarations are sized in bytes, so values whose encoded form
    /// exceeds the declared size force the size to be recomputed from the
    /// encoded length.
    #[must_use]
    pub fn is_ansi_character(&self) -> bool {
        matches!(self, Self::Char | Self::VarChar)
    }

    /// Whether values are UTF-16 character data.
    #[must_use]
    pub fn is_unicode_character(&self) -> bool {
        matches!(self, Self::NChar | Self::NVarChar)
    }

    /// The largest non-PLP declaration size for this type, in its own units.
    ///
    /// Character UTF-16 types count code units, everything else counts bytes.
    #[must_use]
    pub fn max_non_plp_size(&self) -> Option<usize> {
        match self {
            Self::NChar | Self::NVarChar => Some(4000),
            Self::Char | Self::VarChar | Self::Binary | Self::VarBinary => Some(8000),
            _ => None,
        }
    }

    /// Whether this is a temporal type carrying a fractional-second scale.
    #[must_use]
    pub fn has_fractional_scale(&self) -> bool {
        matches!(self, Self::Time | Self::DateTime2 | Self::DateTimeOffset)
    }

    /// How this type's modifiers appear in a parameter-list signature.
    ///
    /// `size` is the declared size; `0` on a PLP-capable type means `max`.
    /// Structured, UDT, XML and JSON never take a `(max)` modifier even
    /// though their values travel as PLP streams.
    #[must_use]
    pub fn signature_modifier(&self, size: usize) -> SignatureModifier {
        if *self == Self::Decimal {
            return SignatureModifier::PrecisionScale;
        }
        if self.has_fractional_scale() {
            return SignatureModifier::Scale;
        }
        if matches!(self, Self::Structured | Self::Udt | Self::Xml | Self::Json) {
            return SignatureModifier::None;
        }
        if self.is_variable_length() {
            let plp = self.is_plp_capable()
                && (size == 0 || self.max_non_plp_size().is_some_and(|max| size > max));
            if plp {
                return SignatureModifier::Max;
            }
            return SignatureModifier::Length;
        }
        SignatureModifier::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_names() {
        assert_eq!(SqlType::NVarChar.type_name(), "nvarchar");
        assert_eq!(SqlType::Decimal.type_name(), "decimal");
        assert_eq!(SqlType::Variant.type_name(), "sql_variant");
    }

    #[test]
    fn test_decimal_modifier() {
        assert_eq!(
            SqlType::Decimal.signature_modifier(17),
            SignatureModifier::PrecisionScale
        );
    }

    #[test]
    fn test_temporal_modifier() {
        assert_eq!(SqlType::Time.signature_modifier(0), SignatureModifier::Scale);
        assert_eq!(
            SqlType::DateTime2.signature_modifier(0),
            SignatureModifier::Scale
        );
        // Plain DATETIME has no fractional scale knob.
        assert_eq!(
            SqlType::DateTime.signature_modifier(0),
            SignatureModifier::None
        );
    }

    #[test]
    fn test_variable_length_modifier() {
        assert_eq!(
            SqlType::NVarChar.signature_modifier(100),
            SignatureModifier::Length
        );
        assert_eq!(
            SqlType::VarBinary.signature_modifier(8000),
            SignatureModifier::Length
        );
    }

    #[test]
    fn test_plp_modifier() {
        assert_eq!(SqlType::NVarChar.signature_modifier(0), SignatureModifier::Max);
        assert_eq!(
            SqlType::NVarChar.signature_modifier(4001),
            SignatureModifier::Max
        );
        assert_eq!(
            SqlType::VarBinary.signature_modifier(8001),
            SignatureModifier::Max
        );
    }

    #[test]
    fn test_plp_exempt_types_take_no_max() {
        // PLP-valued but never declared with (max).
        assert_eq!(SqlType::Xml.signature_modifier(0), SignatureModifier::None);
        assert_eq!(SqlType::Json.signature_modifier(0), SignatureModifier::None);
        assert_eq!(SqlType::Udt.signature_modifier(0), SignatureModifier::None);
        assert_eq!(
            SqlType::Structured.signature_modifier(0),
            SignatureModifier::None
        );
    }

    #[test]
    fn test_ansi_classification() {
        assert!(SqlType::VarChar.is_ansi_character());
        assert!(!SqlType::NVarChar.is_ansi_character());
        assert!(SqlType::NVarChar.is_unicode_character());
    }

    #[test]
    fn test_max_non_plp_size() {
        assert_eq!(SqlType::NVarChar.max_non_plp_size(), Some(4000));
        assert_eq!(SqlType::VarBinary.max_non_plp_size(), Some(8000));
        assert_eq!(SqlType::Int.max_non_plp_size(), None);
    }
}
