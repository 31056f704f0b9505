//! RPC invocation descriptors.
//!
//! An [`RpcRecord`] is the in-memory descriptor the wire layer turns into
//! the server's remote-procedure-call token stream. The command engine
//! assembles records in one of four shapes (raw batch text never becomes a
//! record; it goes through the batch write path):
//!
//! - `sp_executesql(text, paramlist, params…)`
//! - `sp_prepexec(handle, paramlist, text, params…)`
//! - `sp_execute(handle, params…)`
//! - a direct call on a named stored procedure
//!
//! Records also carry the per-execution accounting the engine maintains
//! while the response is read: cumulative rows affected and the ranges of
//! the session's diagnostic buffers that belong to this invocation.

use bytes::Bytes;

use crate::types::SqlType;
use crate::value::WireValue;
use crate::{Result, RpcError};

/// Maximum procedure name length in bytes of UTF-16 (523 code units).
pub const MAX_RPC_NAME_BYTES: usize = 1046;

/// Well-known system procedure ids the server resolves without a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ProcId {
    /// sp_executesql (0x000A) — parameterized text execution.
    ExecuteSql = 0x000A,
    /// sp_prepare (0x000B).
    Prepare = 0x000B,
    /// sp_execute (0x000C) — execute a prepared handle.
    Execute = 0x000C,
    /// sp_prepexec (0x000D) — prepare and execute in one round trip.
    PrepExec = 0x000D,
    /// sp_unprepare (0x000F) — release a prepared handle.
    Unprepare = 0x000F,
}

/// Procedure identity: a well-known id or a (validated) name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcIdent {
    /// A well-known system procedure.
    Id(ProcId),
    /// A named procedure; the name has passed length validation.
    Name(String),
}

impl ProcIdent {
    /// Build a named identity, enforcing the wire-format name cap.
    pub fn named(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let encoded = name.encode_utf16().count() * 2;
        if encoded > MAX_RPC_NAME_BYTES {
            return Err(RpcError::InvalidArgumentLength {
                argument: "procedure name",
                actual: encoded,
                limit: MAX_RPC_NAME_BYTES,
            });
        }
        Ok(Self::Name(name))
    }

    /// The procedure name, when this is a named identity.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Name(n) => Some(n),
            Self::Id(_) => None,
        }
    }
}

/// RPC header option flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RpcOptionFlags {
    /// Recompile the plan before executing.
    pub with_recompile: bool,
    /// Suppress metadata in the response.
    pub no_metadata: bool,
    /// Reuse metadata from the previous invocation.
    pub reuse_metadata: bool,
}

impl RpcOptionFlags {
    /// Encode to the 2-byte wire representation.
    #[must_use]
    pub fn encode(&self) -> u16 {
        let mut flags = 0u16;
        if self.with_recompile {
            flags |= 0x0001;
        }
        if self.no_metadata {
            flags |= 0x0002;
        }
        if self.reuse_metadata {
            flags |= 0x0004;
        }
        flags
    }
}

/// Per-parameter status options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParamOptions {
    /// Parameter is passed by reference (output or input/output).
    pub by_ref: bool,
    /// Value is elided; the server applies the declared default.
    pub default_value: bool,
    /// Value travels encrypted under the parameter's cipher metadata.
    pub encrypted: bool,
}

impl ParamOptions {
    /// Encode to the wire option bits.
    #[must_use]
    pub fn encode(&self) -> u32 {
        let mut bits = 0u32;
        if self.by_ref {
            bits |= 0x01;
        }
        if self.default_value {
            bits |= 0x02;
        }
        if self.encrypted {
            bits |= 0x08;
        }
        bits
    }

    /// Pack options with a parameter index into one map entry.
    #[must_use]
    pub fn pack(&self, index: usize) -> u64 {
        (u64::from(self.encode()) << 32) | (index as u64 & 0xFFFF_FFFF)
    }

    /// Recover `(options_bits, index)` from a packed entry.
    #[must_use]
    pub fn unpack(entry: u64) -> (u32, usize) {
        ((entry >> 32) as u32, (entry & 0xFFFF_FFFF) as usize)
    }
}

/// A system parameter in the shape-fixed leading slice of a record.
#[derive(Debug, Clone, PartialEq)]
pub enum SystemParam {
    /// An integer input, e.g. a prepared handle passed to `sp_execute`.
    Int {
        /// Parameter name.
        name: &'static str,
        /// Value.
        value: i32,
    },
    /// An integer passed by reference, e.g. the `sp_prepexec` handle.
    IntByRef {
        /// Parameter name.
        name: &'static str,
        /// Value on the way in; `-1` conventionally means "no handle yet".
        value: i32,
    },
    /// Character input, e.g. statement text or a parameter-list signature.
    NVarChar {
        /// Parameter name.
        name: &'static str,
        /// Value.
        value: String,
    },
    /// Binary input, e.g. a serialized attestation blob.
    VarBinary {
        /// Parameter name.
        name: &'static str,
        /// Value.
        value: Bytes,
    },
}

impl SystemParam {
    /// The parameter's name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Int { name, .. }
            | Self::IntByRef { name, .. }
            | Self::NVarChar { name, .. }
            | Self::VarBinary { name, .. } => name,
        }
    }
}

/// A materialized user parameter as the wire layer will serialize it.
#[derive(Debug, Clone, PartialEq)]
pub struct WireParam {
    /// Parameter name including the `@` prefix; empty for positional.
    pub name: String,
    /// Declared type.
    pub sql_type: SqlType,
    /// Declared size in the type's own units; `0` means PLP/max.
    pub size: usize,
    /// Precision for decimal declarations.
    pub precision: Option<u8>,
    /// Scale for decimal and fractional temporal declarations.
    pub scale: Option<u8>,
    /// Per-parameter options.
    pub options: ParamOptions,
    /// The value to serialize. Encrypted parameters carry ciphertext here.
    pub value: WireValue,
}

/// The in-memory descriptor for one RPC invocation.
#[derive(Debug, Clone)]
pub struct RpcRecord {
    /// Which procedure to invoke.
    pub procedure: ProcIdent,
    /// Header options.
    pub options: RpcOptionFlags,
    /// Shape-fixed system parameters, in wire order.
    pub system_params: Vec<SystemParam>,
    /// Materialized user parameters, in wire order after the system slice.
    pub user_params: Vec<WireParam>,
    /// Packed `(options << 32) | index` map over `user_params`.
    pub user_param_options: Vec<u64>,
    /// Rows affected by this invocation alone, once known.
    pub records_affected: Option<u64>,
    /// Rows affected up to and including this invocation in a batch.
    pub cumulative_records_affected: u64,
    /// `[start, end)` range of the session's error buffer for this invocation.
    pub errors_range: (usize, usize),
    /// `[start, end)` range of the session's warning buffer for this invocation.
    pub warnings_range: (usize, usize),
    /// Set when the server signalled that cipher metadata for this
    /// invocation was never delivered by the describe round trip.
    pub needs_fetch_parameter_encryption_metadata: bool,
    /// Enclave package transmitted alongside the invocation, when the
    /// statement needs enclave computations.
    pub enclave_package: Option<Bytes>,
}

impl RpcRecord {
    /// Start a record for a well-known system procedure.
    #[must_use]
    pub fn system(proc_id: ProcId) -> Self {
        Self::new(ProcIdent::Id(proc_id))
    }

    /// Start a record for a named procedure, validating the name length.
    pub fn named(name: impl Into<String>) -> Result<Self> {
        Ok(Self::new(ProcIdent::named(name)?))
    }

    fn new(procedure: ProcIdent) -> Self {
        Self {
            procedure,
            options: RpcOptionFlags::default(),
            system_params: Vec::new(),
            user_params: Vec::new(),
            user_param_options: Vec::new(),
            records_affected: None,
            cumulative_records_affected: 0,
            errors_range: (0, 0),
            warnings_range: (0, 0),
            needs_fetch_parameter_encryption_metadata: false,
            enclave_package: None,
        }
    }

    /// Append a system parameter.
    pub fn push_system(&mut self, param: SystemParam) {
        self.system_params.push(param);
    }

    /// Append a user parameter, maintaining the packed option map.
    pub fn push_user(&mut self, param: WireParam) {
        let index = self.user_params.len();
        self.user_param_options.push(param.options.pack(index));
        self.user_params.push(param);
    }

    /// The well-known procedure id, when this is a system invocation.
    #[must_use]
    pub fn proc_id(&self) -> Option<ProcId> {
        match self.procedure {
            ProcIdent::Id(id) => Some(id),
            ProcIdent::Name(_) => None,
        }
    }

    /// Record the diagnostic buffer positions at which this invocation starts.
    pub fn begin_diagnostics(&mut self, errors_len: usize, warnings_len: usize) {
        self.errors_range = (errors_len, errors_len);
        self.warnings_range = (warnings_len, warnings_len);
    }

    /// Record the diagnostic buffer positions at which this invocation ends.
    pub fn end_diagnostics(&mut self, errors_len: usize, warnings_len: usize) {
        self.errors_range.1 = errors_len;
        self.warnings_range.1 = warnings_len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proc_id_values() {
        assert_eq!(ProcId::ExecuteSql as u16, 0x000A);
        assert_eq!(ProcId::Prepare as u16, 0x000B);
        assert_eq!(ProcId::Execute as u16, 0x000C);
        assert_eq!(ProcId::PrepExec as u16, 0x000D);
        assert_eq!(ProcId::Unprepare as u16, 0x000F);
    }

    #[test]
    fn test_named_ident_within_cap() {
        let ident = ProcIdent::named("dbo.usp_orders").unwrap();
        assert_eq!(ident.name(), Some("dbo.usp_orders"));
    }

    #[test]
    fn test_named_ident_over_cap() {
        // 524 UTF-16 code units = 1048 bytes, two over the cap.
        let long = "p".repeat(524);
        let err = ProcIdent::named(long).unwrap_err();
        match err {
            RpcError::InvalidArgumentLength { actual, limit, .. } => {
                assert_eq!(actual, 1048);
                assert_eq!(limit, MAX_RPC_NAME_BYTES);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_named_ident_cap_counts_utf16_units() {
        // Each '€' is one UTF-16 unit but three UTF-8 bytes; 523 of them fit.
        let name = "€".repeat(523);
        assert!(ProcIdent::named(name).is_ok());
    }

    #[test]
    fn test_option_flags_encode() {
        let flags = RpcOptionFlags {
            with_recompile: true,
            ..Default::default()
        };
        assert_eq!(flags.encode(), 0x0001);
    }

    #[test]
    fn test_param_options_encode() {
        let opts = ParamOptions {
            by_ref: true,
            default_value: false,
            encrypted: true,
        };
        assert_eq!(opts.encode(), 0x09);
    }

    #[test]
    fn test_param_options_pack_unpack() {
        let opts = ParamOptions {
            by_ref: true,
            ..Default::default()
        };
        let packed = opts.pack(5);
        assert_eq!(packed, (0x01u64 << 32) | 5);
        assert_eq!(ParamOptions::unpack(packed), (0x01, 5));
    }

    #[test]
    fn test_push_user_maintains_option_map() {
        let mut record = RpcRecord::system(ProcId::ExecuteSql);
        record.push_user(WireParam {
            name: "@a".into(),
            sql_type: SqlType::Int,
            size: 0,
            precision: None,
            scale: None,
            options: ParamOptions::default(),
            value: WireValue::Int(1),
        });
        record.push_user(WireParam {
            name: "@b".into(),
            sql_type: SqlType::Int,
            size: 0,
            precision: None,
            scale: None,
            options: ParamOptions {
                by_ref: true,
                ..Default::default()
            },
            value: WireValue::Null,
        });
        assert_eq!(record.user_param_options.len(), 2);
        assert_eq!(ParamOptions::unpack(record.user_param_options[1]), (0x01, 1));
    }

    #[test]
    fn test_diagnostic_ranges() {
        let mut record = RpcRecord::system(ProcId::Execute);
        record.begin_diagnostics(2, 1);
        record.end_diagnostics(5, 1);
        assert_eq!(record.errors_range, (2, 5));
        assert_eq!(record.warnings_range, (1, 1));
    }
}
