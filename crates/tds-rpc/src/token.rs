//! Typed events produced by the wire parser while a response is read.
//!
//! The command engine never sees raw token bytes; the wire layer yields
//! [`TokenEvent`]s which the execution driver dispatches to the output
//! binder and batch accounting. This module also fixes the bit-exact row
//! layouts of the three describe-parameter-encryption result sets.

use bytes::Bytes;

use crate::types::SqlType;
use crate::value::WireValue;
use crate::{Result, RpcError};

/// Column metadata for a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaColumn {
    /// Column name.
    pub name: String,
    /// Declared type.
    pub sql_type: SqlType,
    /// Whether NULLs may appear.
    pub nullable: bool,
}

/// Completion summary carried by the done-family tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DoneToken {
    /// More results follow in this response.
    pub more: bool,
    /// The statement terminated with an error.
    pub error: bool,
    /// `row_count` is meaningful.
    pub count_valid: bool,
    /// Rows affected, when `count_valid`.
    pub row_count: u64,
    /// This done acknowledges an attention request.
    pub attention_ack: bool,
}

/// A server error or informational message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFault {
    /// Server error number.
    pub number: i32,
    /// Severity class (0-25; 10 and below is informational).
    pub class: u8,
    /// Error state.
    pub state: u8,
    /// Message text.
    pub message: String,
    /// Reporting server name, when present.
    pub server: Option<String>,
    /// Originating procedure, when present.
    pub procedure: Option<String>,
    /// Line number within the batch or procedure.
    pub line: u32,
}

impl ServerFault {
    /// Whether this fault is informational rather than an error.
    #[must_use]
    pub fn is_informational(&self) -> bool {
        self.class <= 10
    }
}

/// A return-value token: an output parameter or prepare handle coming back.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnValueToken {
    /// Parameter name; empty for unnamed (positional) return values.
    pub name: String,
    /// Ordinal assigned by the server.
    pub ordinal: u16,
    /// Raw status byte from the token.
    pub status: u8,
    /// Declared type of the value.
    pub sql_type: SqlType,
    /// Precision, for decimal values.
    pub precision: Option<u8>,
    /// Scale, for decimal and fractional temporal values.
    pub scale: Option<u8>,
    /// Collation bytes, for character values.
    pub collation: Option<[u8; 5]>,
    /// The value itself.
    pub value: WireValue,
}

/// One typed event in a response stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenEvent {
    /// A new result set begins with this column metadata.
    ResultMetadata(Vec<MetaColumn>),
    /// One data row of the current result set.
    Row(Vec<WireValue>),
    /// An output parameter or prepare handle.
    ReturnValue(ReturnValueToken),
    /// A procedure's return status.
    ReturnStatus(i32),
    /// A statement in a batch finished.
    Done(DoneToken),
    /// A procedure invocation finished.
    DoneProc(DoneToken),
    /// A statement inside a procedure finished.
    DoneInProc(DoneToken),
    /// A server error (class above 10).
    Error(ServerFault),
    /// A server informational message (class 10 or below).
    Info(ServerFault),
}

fn column<'a>(
    values: &'a [WireValue],
    index: usize,
    result_set: &'static str,
    what: &str,
) -> Result<&'a WireValue> {
    values.get(index).ok_or_else(|| RpcError::MalformedRow {
        result_set,
        detail: format!("missing column {index} ({what})"),
    })
}

fn int_column(
    values: &[WireValue],
    index: usize,
    result_set: &'static str,
    what: &str,
) -> Result<i32> {
    column(values, index, result_set, what)?
        .as_i32()
        .ok_or_else(|| RpcError::MalformedRow {
            result_set,
            detail: format!("column {index} ({what}) is not an integer"),
        })
}

fn string_column(
    values: &[WireValue],
    index: usize,
    result_set: &'static str,
    what: &str,
) -> Result<String> {
    column(values, index, result_set, what)?
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| RpcError::MalformedRow {
            result_set,
            detail: format!("column {index} ({what}) is not a string"),
        })
}

fn bytes_column(
    values: &[WireValue],
    index: usize,
    result_set: &'static str,
    what: &str,
) -> Result<Bytes> {
    column(values, index, result_set, what)?
        .as_bytes()
        .cloned()
        .ok_or_else(|| RpcError::MalformedRow {
            result_set,
            detail: format!("column {index} ({what}) is not binary"),
        })
}

/// One row of describe-parameter-encryption result set 1.
///
/// Column order is fixed by the wire format: `KeyOrdinal, DbId, KeyId,
/// KeyVersion, KeyMdVersion, EncryptedKey, ProviderName, KeyPath,
/// KeyEncryptionAlgorithm, IsRequestedByEnclave, KeySignature`. The last
/// two columns only appear on servers that support enclave computations.
#[derive(Debug, Clone, PartialEq)]
pub struct CipherKeyRow {
    /// Ordinal the per-parameter rows refer to.
    pub key_ordinal: u16,
    /// Database id of the column-encryption key.
    pub database_id: i32,
    /// Key id within the database.
    pub key_id: i32,
    /// Key version, advanced by rotation.
    pub key_version: i32,
    /// 8-byte metadata version.
    pub key_metadata_version: [u8; 8],
    /// The encrypted column-encryption key.
    pub encrypted_key: Bytes,
    /// Key-store provider that can unwrap it.
    pub provider_name: String,
    /// Master-key path within that provider.
    pub key_path: String,
    /// Asymmetric wrap algorithm, e.g. `RSA_OAEP`.
    pub key_encryption_algorithm: String,
    /// Whether the enclave asked for this key.
    pub is_requested_by_enclave: bool,
    /// Master-key signature, delivered for enclave-requested keys.
    pub key_signature: Option<Bytes>,
}

impl CipherKeyRow {
    const RS: &'static str = "cipher-key result set";

    /// Decode a row from its fixed column order.
    pub fn decode(values: &[WireValue]) -> Result<Self> {
        let key_ordinal =
            u16::try_from(int_column(values, 0, Self::RS, "KeyOrdinal")?).map_err(|_| {
                RpcError::MalformedRow {
                    result_set: Self::RS,
                    detail: "KeyOrdinal out of range".into(),
                }
            })?;
        let md = bytes_column(values, 4, Self::RS, "KeyMdVersion")?;
        let key_metadata_version: [u8; 8] =
            md.as_ref().try_into().map_err(|_| RpcError::MalformedRow {
                result_set: Self::RS,
                detail: format!("KeyMdVersion is {} bytes, expected 8", md.len()),
            })?;
        let is_requested_by_enclave = match values.get(9) {
            Some(v) => v.as_bool().unwrap_or(false),
            None => false,
        };
        let key_signature = match values.get(10) {
            Some(WireValue::Bytes(b)) => Some(b.clone()),
            _ => None,
        };
        Ok(Self {
            key_ordinal,
            database_id: int_column(values, 1, Self::RS, "DbId")?,
            key_id: int_column(values, 2, Self::RS, "KeyId")?,
            key_version: int_column(values, 3, Self::RS, "KeyVersion")?,
            key_metadata_version,
            encrypted_key: bytes_column(values, 5, Self::RS, "EncryptedKey")?,
            provider_name: string_column(values, 6, Self::RS, "ProviderName")?,
            key_path: string_column(values, 7, Self::RS, "KeyPath")?,
            key_encryption_algorithm: string_column(values, 8, Self::RS, "KeyEncryptionAlgorithm")?,
            is_requested_by_enclave,
            key_signature,
        })
    }
}

/// One row of describe-parameter-encryption result set 2.
///
/// Column order: `ParameterName, ColumnEncryptionAlgorithm,
/// ColumnEncryptionType, ColumnEncryptionKeyOrdinal,
/// NormalizationRuleVersion`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterCipherRow {
    /// Name of the parameter this row describes.
    pub parameter_name: String,
    /// Cipher algorithm id (2 is the AEAD cell cipher).
    pub algorithm_id: u8,
    /// Encryption type: 1 deterministic, 2 randomized.
    pub encryption_type: u8,
    /// Which key ordinal of result set 1 encrypts this parameter.
    pub key_ordinal: u16,
    /// Opaque normalization rule version.
    pub normalization_rule_version: u8,
}

impl ParameterCipherRow {
    const RS: &'static str = "parameter-cipher result set";

    /// Decode a row from its fixed column order.
    pub fn decode(values: &[WireValue]) -> Result<Self> {
        let narrow = |index: usize, what: &str| -> Result<u8> {
            u8::try_from(int_column(values, index, Self::RS, what)?).map_err(|_| {
                RpcError::MalformedRow {
                    result_set: Self::RS,
                    detail: format!("{what} out of range"),
                }
            })
        };
        let key_ordinal = u16::try_from(int_column(
            values,
            3,
            Self::RS,
            "ColumnEncryptionKeyOrdinal",
        )?)
        .map_err(|_| RpcError::MalformedRow {
            result_set: Self::RS,
            detail: "ColumnEncryptionKeyOrdinal out of range".into(),
        })?;
        Ok(Self {
            parameter_name: string_column(values, 0, Self::RS, "ParameterName")?,
            algorithm_id: narrow(1, "ColumnEncryptionAlgorithm")?,
            encryption_type: narrow(2, "ColumnEncryptionType")?,
            key_ordinal,
            normalization_rule_version: narrow(4, "NormalizationRuleVersion")?,
        })
    }
}

/// The single row of describe-parameter-encryption result set 3.
#[derive(Debug, Clone, PartialEq)]
pub struct AttestationInfoRow {
    /// Opaque attestation information for the enclave handshake.
    pub attestation_info: Bytes,
}

impl AttestationInfoRow {
    const RS: &'static str = "attestation-info result set";

    /// Decode a row from its fixed column order.
    pub fn decode(values: &[WireValue]) -> Result<Self> {
        Ok(Self {
            attestation_info: bytes_column(values, 0, Self::RS, "AttestationInfo")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher_key_values(with_enclave_columns: bool) -> Vec<WireValue> {
        let mut values = vec![
            WireValue::Int(1),
            WireValue::Int(5),
            WireValue::Int(12),
            WireValue::Int(3),
            WireValue::Bytes(Bytes::from_static(&[0, 1, 2, 3, 4, 5, 6, 7])),
            WireValue::Bytes(Bytes::from_static(b"wrapped-key")),
            WireValue::String("AZURE_KEY_VAULT".into()),
            WireValue::String("https://vault/keys/cmk/1".into()),
            WireValue::String("RSA_OAEP".into()),
        ];
        if with_enclave_columns {
            values.push(WireValue::Bool(true));
            values.push(WireValue::Bytes(Bytes::from_static(b"signature")));
        }
        values
    }

    #[test]
    fn test_cipher_key_row_decode() {
        let row = CipherKeyRow::decode(&cipher_key_values(true)).unwrap();
        assert_eq!(row.key_ordinal, 1);
        assert_eq!(row.database_id, 5);
        assert_eq!(row.key_id, 12);
        assert_eq!(row.key_version, 3);
        assert_eq!(row.key_metadata_version, [0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(row.provider_name, "AZURE_KEY_VAULT");
        assert!(row.is_requested_by_enclave);
        assert!(row.key_signature.is_some());
    }

    #[test]
    fn test_cipher_key_row_without_enclave_columns() {
        // Pre-enclave servers send nine columns.
        let row = CipherKeyRow::decode(&cipher_key_values(false)).unwrap();
        assert!(!row.is_requested_by_enclave);
        assert!(row.key_signature.is_none());
    }

    #[test]
    fn test_cipher_key_row_bad_md_version() {
        let mut values = cipher_key_values(false);
        values[4] = WireValue::Bytes(Bytes::from_static(&[0, 1]));
        assert!(CipherKeyRow::decode(&values).is_err());
    }

    #[test]
    fn test_cipher_key_row_truncated() {
        let values = cipher_key_values(false);
        assert!(CipherKeyRow::decode(&values[..5]).is_err());
    }

    #[test]
    fn test_parameter_cipher_row_decode() {
        let values = vec![
            WireValue::String("@ssn".into()),
            WireValue::TinyInt(2),
            WireValue::TinyInt(1),
            WireValue::Int(1),
            WireValue::TinyInt(1),
        ];
        let row = ParameterCipherRow::decode(&values).unwrap();
        assert_eq!(row.parameter_name, "@ssn");
        assert_eq!(row.algorithm_id, 2);
        assert_eq!(row.encryption_type, 1);
        assert_eq!(row.key_ordinal, 1);
        assert_eq!(row.normalization_rule_version, 1);
    }

    #[test]
    fn test_attestation_info_row_decode() {
        let values = vec![WireValue::Bytes(Bytes::from_static(b"evidence"))];
        let row = AttestationInfoRow::decode(&values).unwrap();
        assert_eq!(row.attestation_info.as_ref(), b"evidence");
    }

    #[test]
    fn test_server_fault_informational() {
        let fault = ServerFault {
            number: 5701,
            class: 10,
            state: 1,
            message: "changed database context".into(),
            server: None,
            procedure: None,
            line: 1,
        };
        assert!(fault.is_informational());
    }
}
