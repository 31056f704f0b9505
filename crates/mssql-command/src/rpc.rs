//! RPC record building: shape selection, system-parameter slices, the
//! parameter-list signature, and the stored-procedure preview used by the
//! describe round trip.

use bytes::{BufMut, Bytes, BytesMut};

use tds_rpc::ident::quote_multipart_identifier;
use tds_rpc::{
    ParamOptions, ProcId, RpcRecord, SignatureModifier, SqlType, SystemParam, WireParam, WireValue,
};

use crate::command::CommandKind;
use crate::encryption::CipherRuntime;
use crate::error::{Error, Result};
use crate::param::{ParamDirection, Parameter, ParameterCollection};
use crate::prepare::PrepareState;

/// Which wire shape an execution uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteShape {
    /// Iterate the batch RPC list.
    Batch,
    /// Raw SQL batch text, no RPC.
    RawText,
    /// `sp_execute(handle, params…)`.
    Execute {
        /// The live prepared handle.
        handle: i32,
    },
    /// `sp_prepexec(handle, paramlist, text, params…)`.
    PrepExec {
        /// A reusable handle, when the prior one is still valid.
        handle: Option<i32>,
    },
    /// `sp_executesql(text, paramlist, params…)`.
    ExecuteSql,
    /// Direct RPC on the named procedure.
    StoredProc,
}

/// Choose the wire shape for the current command state.
///
/// Mirrors the dispatch table: batch mode wins, then raw text for
/// parameterless non-enclave text, then the prepare lifecycle shapes,
/// then `sp_executesql`, with stored procedures always direct.
#[must_use]
pub fn choose_shape(
    kind: CommandKind,
    prepare: &PrepareState,
    batch_active: bool,
    sendable_params: usize,
    requires_enclave: bool,
    close_count: u32,
    reconnect_count: u32,
) -> ExecuteShape {
    if batch_active {
        return ExecuteShape::Batch;
    }
    if kind == CommandKind::StoredProcedure {
        return ExecuteShape::StoredProc;
    }
    if sendable_params == 0 && !requires_enclave && !matches!(prepare, PrepareState::PreparePending { .. }) {
        return ExecuteShape::RawText;
    }
    match prepare {
        PrepareState::Prepared { .. } => match prepare.reusable_handle(close_count, reconnect_count)
        {
            Some(handle) => ExecuteShape::Execute { handle },
            // Handle invalidated by a close/reconnect: re-prepare inline.
            None => ExecuteShape::PrepExec { handle: None },
        },
        PrepareState::PreparePending { .. } => ExecuteShape::PrepExec {
            handle: prepare.reusable_handle(close_count, reconnect_count),
        },
        PrepareState::Unprepared => ExecuteShape::ExecuteSql,
    }
}

/// Builds [`RpcRecord`]s from a command's parameters.
pub(crate) struct RecordBuilder<'a> {
    params: &'a ParameterCollection,
    ciphers: Option<&'a CipherRuntime>,
}

impl<'a> RecordBuilder<'a> {
    pub(crate) fn new(params: &'a ParameterCollection, ciphers: Option<&'a CipherRuntime>) -> Self {
        Self { params, ciphers }
    }

    /// `sp_executesql(text, paramlist, params…)`.
    pub(crate) fn execute_sql(&self, text: &str) -> Result<RpcRecord> {
        let mut record = RpcRecord::system(ProcId::ExecuteSql);
        record.push_system(SystemParam::NVarChar {
            name: "",
            value: text.to_owned(),
        });
        if !self.params.is_empty() {
            record.push_system(SystemParam::NVarChar {
                name: "",
                value: self.param_list_signature(),
            });
        }
        self.push_user_params(&mut record)?;
        Ok(record)
    }

    /// `sp_prepexec(handle, paramlist, text, params…)`.
    pub(crate) fn prepexec(&self, handle: Option<i32>, text: &str) -> Result<RpcRecord> {
        let mut record = RpcRecord::system(ProcId::PrepExec);
        record.push_system(SystemParam::IntByRef {
            name: "@handle",
            value: handle.unwrap_or(-1),
        });
        record.push_system(SystemParam::NVarChar {
            name: "",
            value: self.param_list_signature(),
        });
        record.push_system(SystemParam::NVarChar {
            name: "",
            value: text.to_owned(),
        });
        self.push_user_params(&mut record)?;
        Ok(record)
    }

    /// `sp_execute(handle, params…)`.
    pub(crate) fn execute(&self, handle: i32) -> Result<RpcRecord> {
        let mut record = RpcRecord::system(ProcId::Execute);
        record.push_system(SystemParam::Int {
            name: "@handle",
            value: handle,
        });
        self.push_user_params(&mut record)?;
        Ok(record)
    }

    /// Direct RPC on a named procedure. Validates the name cap.
    pub(crate) fn stored_proc(&self, name: &str) -> Result<RpcRecord> {
        let mut record = RpcRecord::named(name)?;
        self.push_user_params(&mut record)?;
        Ok(record)
    }

    /// The describe-parameter-encryption request.
    pub(crate) fn describe_parameter_encryption(
        &self,
        statement: &str,
        attestation: Option<Bytes>,
    ) -> Result<RpcRecord> {
        let mut record = RpcRecord::named("sp_describe_parameter_encryption")?;
        record.push_system(SystemParam::NVarChar {
            name: "@tsql",
            value: statement.to_owned(),
        });
        record.push_system(SystemParam::NVarChar {
            name: "@params",
            value: self.param_list_signature(),
        });
        if let Some(blob) = attestation {
            record.push_system(SystemParam::VarBinary {
                name: "@attestation_parameters",
                value: blob,
            });
        }
        Ok(record)
    }

    /// The `EXEC` preview of a stored-procedure call, used as the describe
    /// round trip's statement text.
    pub(crate) fn exec_preview(&self, proc_name: &str) -> Result<String> {
        let quoted = quote_multipart_identifier(proc_name, 4).map_err(Error::Rpc)?;
        let mut out = String::from("EXEC ");
        if self.params.first_return_value().is_some() {
            out.push_str("@return=");
        }
        out.push_str(&quoted);
        out.push(' ');
        let mut first = true;
        for p in self.params.sendable() {
            if !first {
                out.push_str(", ");
            }
            first = false;
            let name = at_name(&p.name);
            out.push_str(&name);
            out.push('=');
            out.push_str(&name);
            if p.direction.is_output_like() {
                out.push_str(" OUTPUT");
            }
        }
        Ok(out.trim_end().to_owned())
    }

    /// The comma-separated `@name type(modifiers)` signature.
    pub(crate) fn param_list_signature(&self) -> String {
        let decls: Vec<String> = self
            .params
            .sendable()
            .map(|p| self.declaration(p))
            .collect();
        decls.join(",")
    }

    fn declaration(&self, p: &Parameter) -> String {
        let mut decl = at_name(&p.name);
        decl.push(' ');
        decl.push_str(&self.type_declaration(p));
        if p.sql_type == SqlType::Structured {
            decl.push_str(" READONLY");
        }
        if p.direction != ParamDirection::Input {
            decl.push_str(" OUTPUT");
        }
        decl
    }

    fn type_declaration(&self, p: &Parameter) -> String {
        // UDTs and table types declare through their multi-part type name.
        if matches!(p.sql_type, SqlType::Udt | SqlType::Structured) {
            if let Some(type_name) = &p.udt_type_name {
                return quote_multipart_identifier(type_name, 4)
                    .unwrap_or_else(|_| type_name.clone());
            }
        }
        let name = p.sql_type.type_name();
        match p.sql_type.signature_modifier(p.size) {
            SignatureModifier::PrecisionScale => {
                format!("{name}({},{})", p.precision.max(1), p.scale)
            }
            SignatureModifier::Scale => format!("{name}({})", p.scale),
            SignatureModifier::Length => {
                format!("{name}({})", self.declared_length(p))
            }
            SignatureModifier::Max => format!("{name}(max)"),
            SignatureModifier::None => name.to_owned(),
        }
    }

    /// Declared length, recomputed from the encoded value for ANSI types
    /// whose value exceeds the declaration.
    fn declared_length(&self, p: &Parameter) -> usize {
        let mut size = p.size.max(1);
        if p.sql_type.is_ansi_character() {
            if let Some(s) = p.value.as_str() {
                let encoded = s.len();
                if encoded > size {
                    size = encoded;
                }
            }
        }
        size
    }

    fn push_user_params(&self, record: &mut RpcRecord) -> Result<()> {
        for p in self.params.sendable() {
            record.push_user(self.wire_param(p)?);
        }
        Ok(())
    }

    fn wire_param(&self, p: &Parameter) -> Result<WireParam> {
        let options = ParamOptions {
            by_ref: matches!(
                p.direction,
                ParamDirection::Output | ParamDirection::InputOutput
            ),
            default_value: p.value.is_null()
                && p.direction == ParamDirection::Input
                && p.cipher.is_none(),
            encrypted: p.cipher.is_some(),
        };

        let value = if p.cipher.is_some() && p.direction.sends_value() && !p.value.is_null() {
            let runtime = self.ciphers.ok_or_else(|| {
                Error::InvalidOperation(format!(
                    "parameter `{}` carries cipher metadata but no cell cipher was resolved",
                    p.name
                ))
            })?;
            let (cipher, kind) = runtime.for_parameter(p.bare_name()).ok_or_else(|| {
                Error::InvalidOperation(format!(
                    "parameter `{}` carries cipher metadata but no cell cipher was resolved",
                    p.name
                ))
            })?;
            let plaintext = encode_plaintext(&p.value)?;
            let ciphertext = cipher.encrypt(&plaintext, kind)?;
            WireValue::Bytes(Bytes::from(ciphertext))
        } else {
            p.value.clone()
        };

        Ok(WireParam {
            name: at_name(&p.name),
            sql_type: p.sql_type,
            size: p.size,
            precision: (p.precision > 0).then_some(p.precision),
            scale: (p.sql_type == SqlType::Decimal || p.sql_type.has_fractional_scale())
                .then_some(p.scale),
            options,
            value,
        })
    }
}

fn at_name(name: &str) -> String {
    if name.starts_with('@') {
        name.to_owned()
    } else {
        format!("@{name}")
    }
}

/// Canonical plaintext encoding of a value for cell encryption.
pub(crate) fn encode_plaintext(value: &WireValue) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    match value {
        WireValue::Null => {
            return Err(Error::InvalidOperation(
                "NULL values are not encrypted".into(),
            ))
        }
        WireValue::Bool(v) => buf.put_u8(u8::from(*v)),
        WireValue::TinyInt(v) => buf.put_u8(*v),
        WireValue::SmallInt(v) => buf.put_i16_le(*v),
        WireValue::Int(v) => buf.put_i32_le(*v),
        WireValue::BigInt(v) => buf.put_i64_le(*v),
        WireValue::Double(v) => buf.put_f64_le(*v),
        WireValue::Decimal { unscaled, .. } => {
            buf.put_u8(u8::from(*unscaled >= 0));
            buf.put_slice(&unscaled.unsigned_abs().to_le_bytes());
        }
        WireValue::String(s) => {
            for unit in s.encode_utf16() {
                buf.put_u16_le(unit);
            }
        }
        WireValue::Bytes(b) => buf.put_slice(b),
        WireValue::Xml(b) => buf.put_slice(b),
        WireValue::Guid(g) => buf.put_slice(g),
    }
    Ok(buf.freeze())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn builder_params() -> ParameterCollection {
        let mut params = ParameterCollection::new();
        params.push(Parameter::new("@id", SqlType::Int).with_value(WireValue::Int(5)));
        params.push(
            Parameter::new("@name", SqlType::NVarChar)
                .with_size(40)
                .with_value(WireValue::String("x".into())),
        );
        params
    }

    #[test]
    fn test_shape_raw_text() {
        let params = ParameterCollection::new();
        let shape = choose_shape(
            CommandKind::TextBatch,
            &PrepareState::Unprepared,
            false,
            params.sendable_count(),
            false,
            0,
            0,
        );
        assert_eq!(shape, ExecuteShape::RawText);
    }

    #[test]
    fn test_shape_enclave_forces_rpc() {
        let shape = choose_shape(
            CommandKind::TextBatch,
            &PrepareState::Unprepared,
            false,
            0,
            true,
            0,
            0,
        );
        assert_eq!(shape, ExecuteShape::ExecuteSql);
    }

    #[test]
    fn test_shape_prepare_lifecycle() {
        let pending = PrepareState::PreparePending {
            reusable_handle: Some(7),
        };
        assert_eq!(
            choose_shape(CommandKind::TextBatch, &pending, false, 1, false, 0, 0),
            ExecuteShape::PrepExec { handle: Some(7) }
        );
        let prepared = PrepareState::Prepared {
            handle: 7,
            close_count: 0,
            reconnect_count: 0,
        };
        assert_eq!(
            choose_shape(CommandKind::TextBatch, &prepared, false, 1, false, 0, 0),
            ExecuteShape::Execute { handle: 7 }
        );
        // A close invalidates the handle: fall back to a fresh prepexec.
        assert_eq!(
            choose_shape(CommandKind::TextBatch, &prepared, false, 1, false, 1, 0),
            ExecuteShape::PrepExec { handle: None }
        );
    }

    #[test]
    fn test_shape_batch_wins() {
        let shape = choose_shape(
            CommandKind::StoredProcedure,
            &PrepareState::Unprepared,
            true,
            0,
            false,
            0,
            0,
        );
        assert_eq!(shape, ExecuteShape::Batch);
    }

    #[test]
    fn test_shape_stored_proc() {
        let shape = choose_shape(
            CommandKind::StoredProcedure,
            &PrepareState::Unprepared,
            false,
            0,
            false,
            0,
            0,
        );
        assert_eq!(shape, ExecuteShape::StoredProc);
    }

    #[test]
    fn test_execute_sql_record_layout() {
        let params = builder_params();
        let record = RecordBuilder::new(&params, None)
            .execute_sql("SELECT @id, @name")
            .unwrap();
        assert_eq!(record.proc_id(), Some(ProcId::ExecuteSql));
        assert_eq!(record.system_params.len(), 2);
        assert_eq!(record.user_params.len(), 2);
        match &record.system_params[1] {
            SystemParam::NVarChar { value, .. } => {
                assert_eq!(value, "@id int,@name nvarchar(40)");
            }
            other => panic!("unexpected system param: {other:?}"),
        }
    }

    #[test]
    fn test_execute_sql_without_params_omits_paramlist() {
        let params = ParameterCollection::new();
        let record = RecordBuilder::new(&params, None)
            .execute_sql("SELECT 1")
            .unwrap();
        assert_eq!(record.system_params.len(), 1);
    }

    #[test]
    fn test_prepexec_record_layout() {
        let params = builder_params();
        let record = RecordBuilder::new(&params, None)
            .prepexec(None, "SELECT @id")
            .unwrap();
        assert_eq!(record.proc_id(), Some(ProcId::PrepExec));
        assert_eq!(
            record.system_params[0],
            SystemParam::IntByRef {
                name: "@handle",
                value: -1
            }
        );
        let record = RecordBuilder::new(&params, None)
            .prepexec(Some(42), "SELECT @id")
            .unwrap();
        assert_eq!(
            record.system_params[0],
            SystemParam::IntByRef {
                name: "@handle",
                value: 42
            }
        );
    }

    #[test]
    fn test_execute_record_layout() {
        let params = builder_params();
        let record = RecordBuilder::new(&params, None).execute(9).unwrap();
        assert_eq!(record.proc_id(), Some(ProcId::Execute));
        assert_eq!(
            record.system_params[0],
            SystemParam::Int {
                name: "@handle",
                value: 9
            }
        );
        assert_eq!(record.user_params.len(), 2);
    }

    #[test]
    fn test_stored_proc_name_cap() {
        let params = ParameterCollection::new();
        let builder = RecordBuilder::new(&params, None);
        assert!(builder.stored_proc(&"p".repeat(523)).is_ok());
        assert!(builder.stored_proc(&"p".repeat(524)).is_err());
    }

    #[test]
    fn test_signature_rules() {
        let mut params = ParameterCollection::new();
        params.push(
            Parameter::new("@d", SqlType::Decimal).with_precision_scale(18, 4),
        );
        params.push(Parameter::new("@t", SqlType::DateTime2).with_precision_scale(0, 7));
        params.push(Parameter::new("@v", SqlType::VarBinary).with_size(16));
        params.push(Parameter::new("@m", SqlType::NVarChar));
        params.push({
            let mut p = Parameter::new("@tvp", SqlType::Structured);
            p.udt_type_name = Some("dbo.IdList".into());
            p
        });
        params.push(
            Parameter::new("@out", SqlType::Int).with_direction(ParamDirection::Output),
        );
        let signature = RecordBuilder::new(&params, None).param_list_signature();
        assert_eq!(
            signature,
            "@d decimal(18,4),@t datetime2(7),@v varbinary(16),@m nvarchar(max),\
             @tvp [dbo].[IdList] READONLY,@out int OUTPUT"
        );
    }

    #[test]
    fn test_signature_ansi_size_recompute() {
        let mut params = ParameterCollection::new();
        params.push(
            Parameter::new("@s", SqlType::VarChar)
                .with_size(4)
                .with_value(WireValue::String("longer-than-four".into())),
        );
        let signature = RecordBuilder::new(&params, None).param_list_signature();
        assert_eq!(signature, "@s varchar(16)");
    }

    #[test]
    fn test_exec_preview() {
        let mut params = ParameterCollection::new();
        params.push(Parameter::new("@a", SqlType::Int));
        params.push(
            Parameter::new("@b", SqlType::Int).with_direction(ParamDirection::InputOutput),
        );
        let builder = RecordBuilder::new(&params, None);
        assert_eq!(
            builder.exec_preview("dbo.usp_thing").unwrap(),
            "EXEC [dbo].[usp_thing] @a=@a, @b=@b OUTPUT"
        );
    }

    #[test]
    fn test_exec_preview_with_return_value() {
        let mut params = ParameterCollection::new();
        params.push(
            Parameter::new("@ret", SqlType::Int).with_direction(ParamDirection::ReturnValue),
        );
        params.push(Parameter::new("@a", SqlType::Int));
        let builder = RecordBuilder::new(&params, None);
        assert_eq!(
            builder.exec_preview("p").unwrap(),
            "EXEC @return=[p] @a=@a"
        );
    }

    #[test]
    fn test_default_option_for_null_input() {
        let mut params = ParameterCollection::new();
        params.push(Parameter::new("@n", SqlType::Int));
        let record = RecordBuilder::new(&params, None)
            .execute_sql("SELECT @n")
            .unwrap();
        assert!(record.user_params[0].options.default_value);
        // Output parameters never elide to defaults.
        let mut params = ParameterCollection::new();
        params.push(
            Parameter::new("@o", SqlType::Int).with_direction(ParamDirection::Output),
        );
        let record = RecordBuilder::new(&params, None)
            .execute_sql("SELECT @o")
            .unwrap();
        assert!(!record.user_params[0].options.default_value);
        assert!(record.user_params[0].options.by_ref);
    }

    #[test]
    fn test_describe_record_layout() {
        let params = builder_params();
        let record = RecordBuilder::new(&params, None)
            .describe_parameter_encryption("SELECT @id", Some(Bytes::from_static(b"blob")))
            .unwrap();
        assert_eq!(
            record.procedure.name(),
            Some("sp_describe_parameter_encryption")
        );
        assert_eq!(record.system_params.len(), 3);
        assert_eq!(record.system_params[0].name(), "@tsql");
        assert_eq!(record.system_params[1].name(), "@params");
        assert_eq!(record.system_params[2].name(), "@attestation_parameters");
    }

    #[test]
    fn test_encode_plaintext_shapes() {
        assert_eq!(
            encode_plaintext(&WireValue::Int(1)).unwrap().as_ref(),
            &[1, 0, 0, 0]
        );
        assert_eq!(
            encode_plaintext(&WireValue::String("ab".into()))
                .unwrap()
                .as_ref(),
            &[b'a', 0, b'b', 0]
        );
        assert!(encode_plaintext(&WireValue::Null).is_err());
    }
}
