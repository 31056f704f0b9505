//! Canned token streams for scripting mock sessions.

use bytes::Bytes;

use mssql_keys::{CellCipher, EncryptionKind};
use tds_rpc::{
    DoneToken, MetaColumn, ReturnValueToken, ServerFault, SqlType, TokenEvent, WireValue,
};

fn column(name: &str, sql_type: SqlType) -> MetaColumn {
    MetaColumn {
        name: name.to_owned(),
        sql_type,
        nullable: true,
    }
}

/// A final done with a valid rows-affected count.
#[must_use]
pub fn done(rows_affected: u64) -> Vec<TokenEvent> {
    vec![TokenEvent::Done(DoneToken {
        count_valid: true,
        row_count: rows_affected,
        ..DoneToken::default()
    })]
}

/// One single-column INT result set holding one row.
#[must_use]
pub fn scalar_int(value: i32) -> Vec<TokenEvent> {
    vec![
        TokenEvent::ResultMetadata(vec![column("value", SqlType::Int)]),
        TokenEvent::Row(vec![WireValue::Int(value)]),
        TokenEvent::Done(DoneToken {
            count_valid: true,
            row_count: 1,
            ..DoneToken::default()
        }),
    ]
}

/// A server error followed by a done.
#[must_use]
pub fn server_error(number: i32, message: &str) -> Vec<TokenEvent> {
    vec![
        TokenEvent::Error(ServerFault {
            number,
            class: 16,
            state: 1,
            message: message.to_owned(),
            server: None,
            procedure: None,
            line: 1,
        }),
        TokenEvent::Done(DoneToken {
            error: true,
            ..DoneToken::default()
        }),
    ]
}

/// A return-value token for an integer output parameter.
#[must_use]
pub fn int_return_value(name: &str, value: i32) -> TokenEvent {
    TokenEvent::ReturnValue(ReturnValueToken {
        name: name.to_owned(),
        ordinal: 0,
        status: 0,
        sql_type: SqlType::Int,
        precision: None,
        scale: None,
        collation: None,
        value: WireValue::Int(value),
    })
}

/// The prepare-handle return value leading a prepare-execute response.
#[must_use]
pub fn prepare_handle(handle: i32) -> TokenEvent {
    int_return_value("", handle)
}

/// A return-status token plus the trailing done of a procedure call.
#[must_use]
pub fn return_status(status: i32) -> Vec<TokenEvent> {
    vec![
        TokenEvent::ReturnStatus(status),
        TokenEvent::DoneProc(DoneToken {
            count_valid: true,
            row_count: 0,
            ..DoneToken::default()
        }),
    ]
}

/// Encrypt a plaintext cell the way a server-side encrypted column would
/// deliver it, using the test key store's fixed key.
#[must_use]
pub fn encrypted_cell(key: &[u8; 32], kind: EncryptionKind, plaintext: &[u8]) -> Bytes {
    let cipher = CellCipher::new(key).unwrap_or_else(|_| unreachable!("fixed key is 32 bytes"));
    Bytes::from(
        cipher
            .encrypt(plaintext, kind)
            .unwrap_or_else(|_| unreachable!("cell encryption of test data")),
    )
}

/// Builder for describe-parameter-encryption responses.
#[derive(Default)]
pub struct DescribeResponse {
    key_rows: Vec<Vec<WireValue>>,
    param_rows: Vec<Vec<WireValue>>,
    attestation_info: Option<Bytes>,
}

impl DescribeResponse {
    /// Start an empty response.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a column-encryption-key row.
    #[must_use]
    pub fn key(self, ordinal: u16, wrapped: &[u8], provider: &str, path: &str) -> Self {
        self.key_row(ordinal, wrapped, provider, path, false, None)
    }

    /// Add an enclave-requested key row carrying a master-key signature.
    #[must_use]
    pub fn enclave_key(
        self,
        ordinal: u16,
        wrapped: &[u8],
        provider: &str,
        path: &str,
        signature: &[u8],
    ) -> Self {
        self.key_row(
            ordinal,
            wrapped,
            provider,
            path,
            true,
            Some(Bytes::copy_from_slice(signature)),
        )
    }

    fn key_row(
        mut self,
        ordinal: u16,
        wrapped: &[u8],
        provider: &str,
        path: &str,
        enclave: bool,
        signature: Option<Bytes>,
    ) -> Self {
        // Distinct (provider, path) pairs get distinct database ids so
        // concurrent tests never share a decrypted-key cache slot.
        let database_id = {
            use std::hash::{Hash, Hasher};
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            provider.hash(&mut hasher);
            path.hash(&mut hasher);
            (hasher.finish() & 0x7FFF_FFFF) as i32
        };
        self.key_rows.push(vec![
            WireValue::Int(i32::from(ordinal)),
            WireValue::Int(database_id),
            WireValue::Int(i32::from(ordinal)),
            WireValue::Int(1),
            WireValue::Bytes(Bytes::from_static(&[0, 0, 0, 0, 0, 0, 0, 1])),
            WireValue::Bytes(Bytes::copy_from_slice(wrapped)),
            WireValue::String(provider.to_owned()),
            WireValue::String(path.to_owned()),
            WireValue::String("RSA_OAEP".to_owned()),
            WireValue::Bool(enclave),
            signature.map_or(WireValue::Null, WireValue::Bytes),
        ]);
        self
    }

    /// Add a per-parameter cipher row (`encryption_type` 1 deterministic,
    /// 2 randomized).
    #[must_use]
    pub fn param(mut self, name: &str, encryption_type: u8, key_ordinal: u16) -> Self {
        self.param_rows.push(vec![
            WireValue::String(name.to_owned()),
            WireValue::TinyInt(2),
            WireValue::TinyInt(encryption_type),
            WireValue::Int(i32::from(key_ordinal)),
            WireValue::TinyInt(1),
        ]);
        self
    }

    /// Add a plaintext (unencrypted) parameter row.
    #[must_use]
    pub fn plaintext_param(mut self, name: &str) -> Self {
        self.param_rows.push(vec![
            WireValue::String(name.to_owned()),
            WireValue::TinyInt(0),
            WireValue::TinyInt(0),
            WireValue::Int(0),
            WireValue::TinyInt(0),
        ]);
        self
    }

    /// Add the single attestation-info row.
    #[must_use]
    pub fn attestation(mut self, info: &[u8]) -> Self {
        self.attestation_info = Some(Bytes::copy_from_slice(info));
        self
    }

    /// Render the response as token events.
    #[must_use]
    pub fn events(self) -> Vec<TokenEvent> {
        let mut events = Vec::new();
        events.push(TokenEvent::ResultMetadata(vec![
            column("key_ordinal", SqlType::Int),
            column("encrypted_key", SqlType::VarBinary),
        ]));
        events.extend(self.key_rows.into_iter().map(TokenEvent::Row));
        events.push(TokenEvent::ResultMetadata(vec![
            column("parameter_name", SqlType::NVarChar),
            column("column_encryption_type", SqlType::TinyInt),
        ]));
        events.extend(self.param_rows.into_iter().map(TokenEvent::Row));
        if let Some(info) = self.attestation_info {
            events.push(TokenEvent::ResultMetadata(vec![column(
                "attestation_info",
                SqlType::VarBinary,
            )]));
            events.push(TokenEvent::Row(vec![WireValue::Bytes(info)]));
        }
        events.push(TokenEvent::DoneProc(DoneToken {
            count_valid: false,
            ..DoneToken::default()
        }));
        events
    }
}
