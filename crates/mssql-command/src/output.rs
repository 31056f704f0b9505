//! Output parameter binding.
//!
//! Return-value tokens carry prepare handles, output parameters, and (as a
//! separate token) the procedure's return status. The driver routes them
//! here: handles are captured by the caller, named tokens bind to the
//! matching output-capable parameter, unnamed tokens bind to the first
//! return-value parameter, and encrypted values — always delivered as
//! opaque binary when cipher metadata is present — are decrypted with the
//! execution's cell ciphers before the copy.

use bytes::{Buf, Bytes};

use tds_rpc::{ReturnValueToken, SqlType, WireValue};

use crate::connection::UdtFactory;
use crate::encryption::CipherRuntime;
use crate::error::{Error, Result};
use crate::param::{ParamDirection, ParameterCollection};

/// Bind one return-value token into the parameter collection.
///
/// Unmatched tokens are ignored; the server may return values the caller
/// never declared an interest in.
pub(crate) fn bind_return_value(
    params: &mut ParameterCollection,
    token: &ReturnValueToken,
    runtime: Option<&CipherRuntime>,
    udt_factory: Option<&dyn UdtFactory>,
) -> Result<()> {
    let index = if token.name.is_empty() {
        params.first_return_value()
    } else {
        params
            .iter()
            .enumerate()
            .find(|(_, p)| p.direction.is_output_like() && p.matches_name(&token.name))
            .map(|(i, _)| i)
    };
    let Some(index) = index else {
        tracing::trace!(name = %token.name, "return value had no matching parameter");
        return Ok(());
    };

    let encrypted = params
        .get(index)
        .is_some_and(|p| p.cipher.is_some());

    let value = if encrypted {
        let WireValue::Bytes(cell) = &token.value else {
            return Err(Error::Protocol(format!(
                "encrypted return value for `{}` was not delivered as binary",
                token.name
            )));
        };
        let param = params.get(index).unwrap_or_else(|| unreachable!());
        let (cipher, _) = runtime
            .and_then(|r| r.for_parameter(param.bare_name()))
            .ok_or_else(|| {
                Error::InvalidOperation(format!(
                    "no cell cipher resolved for encrypted return value `{}`",
                    token.name
                ))
            })?;
        let plaintext = cipher.decrypt(cell)?;
        decode_plaintext(param.sql_type, &plaintext)?
    } else {
        match (&token.value, token.sql_type) {
            // UDT payloads materialize through the connection's factory.
            (WireValue::Bytes(payload), SqlType::Udt) => {
                let param = params.get(index).unwrap_or_else(|| unreachable!());
                match (udt_factory, &param.udt_type_name) {
                    (Some(factory), Some(type_name)) => {
                        factory.materialize(type_name, payload)?
                    }
                    _ => token.value.clone(),
                }
            }
            // Cached XML buffers materialize to strings.
            (WireValue::Xml(buffer), _) => WireValue::String(decode_utf16(buffer)?),
            _ => token.value.clone(),
        }
    };

    let param = params.get_mut(index).unwrap_or_else(|| unreachable!());
    param.value = value;
    if token.sql_type == SqlType::Decimal {
        if let Some(precision) = token.precision {
            param.precision = precision;
        }
        if let Some(scale) = token.scale {
            param.scale = scale;
        }
    }
    if token.collation.is_some() {
        param.collation = token.collation;
    }
    Ok(())
}

/// Bind a return-status token into the first return-value parameter.
pub(crate) fn bind_return_status(params: &mut ParameterCollection, status: i32) {
    if let Some(index) = params.first_return_value() {
        if let Some(param) = params.get_mut(index) {
            param.value = WireValue::Int(status);
        }
    }
}

/// Decode a decrypted cell back into the parameter's declared type.
///
/// Inverse of the canonical plaintext encoding used on the way out; types
/// without a fixed decoding stay opaque binary.
pub(crate) fn decode_plaintext(sql_type: SqlType, mut plain: &[u8]) -> Result<WireValue> {
    let short = |what: &str| Error::Protocol(format!("decrypted {what} cell has wrong length"));
    Ok(match sql_type {
        SqlType::Bit => {
            if plain.is_empty() {
                return Err(short("bit"));
            }
            WireValue::Bool(plain[0] != 0)
        }
        SqlType::TinyInt => {
            if plain.is_empty() {
                return Err(short("tinyint"));
            }
            WireValue::TinyInt(plain[0])
        }
        SqlType::SmallInt => {
            if plain.len() < 2 {
                return Err(short("smallint"));
            }
            WireValue::SmallInt(plain.get_i16_le())
        }
        SqlType::Int => {
            if plain.len() < 4 {
                return Err(short("int"));
            }
            WireValue::Int(plain.get_i32_le())
        }
        SqlType::BigInt => {
            if plain.len() < 8 {
                return Err(short("bigint"));
            }
            WireValue::BigInt(plain.get_i64_le())
        }
        SqlType::Real | SqlType::Float => {
            if plain.len() < 8 {
                return Err(short("float"));
            }
            WireValue::Double(plain.get_f64_le())
        }
        SqlType::Char | SqlType::VarChar | SqlType::NChar | SqlType::NVarChar | SqlType::Xml
        | SqlType::Json => WireValue::String(decode_utf16(plain)?),
        SqlType::UniqueIdentifier => {
            let bytes: [u8; 16] = plain
                .try_into()
                .map_err(|_| short("uniqueidentifier"))?;
            WireValue::Guid(bytes)
        }
        _ => WireValue::Bytes(Bytes::copy_from_slice(plain)),
    })
}

fn decode_utf16(bytes: &[u8]) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(Error::Protocol(
            "character cell has odd byte length".into(),
        ));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units)
        .map_err(|_| Error::Protocol("character cell is not valid UTF-16".into()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::param::Parameter;

    fn token(name: &str, sql_type: SqlType, value: WireValue) -> ReturnValueToken {
        ReturnValueToken {
            name: name.into(),
            ordinal: 0,
            status: 0,
            sql_type,
            precision: None,
            scale: None,
            collation: None,
            value,
        }
    }

    #[test]
    fn test_named_token_binds_output_param() {
        let mut params = ParameterCollection::new();
        params.push(Parameter::new("@in", SqlType::Int));
        params.push(Parameter::new("@out", SqlType::Int).with_direction(ParamDirection::Output));

        bind_return_value(
            &mut params,
            &token("@out", SqlType::Int, WireValue::Int(9)),
            None,
            None,
        )
        .unwrap();
        assert_eq!(params.get_by_name("@out").unwrap().value, WireValue::Int(9));
        // Input params are never targets.
        assert_eq!(params.get_by_name("@in").unwrap().value, WireValue::Null);
    }

    #[test]
    fn test_unnamed_token_binds_first_return_value() {
        let mut params = ParameterCollection::new();
        params.push(Parameter::new("@a", SqlType::Int).with_direction(ParamDirection::Output));
        params.push(
            Parameter::new("@ret", SqlType::Int).with_direction(ParamDirection::ReturnValue),
        );

        bind_return_value(
            &mut params,
            &token("", SqlType::Int, WireValue::Int(3)),
            None,
            None,
        )
        .unwrap();
        assert_eq!(params.get_by_name("@ret").unwrap().value, WireValue::Int(3));
    }

    #[test]
    fn test_unmatched_token_is_ignored() {
        let mut params = ParameterCollection::new();
        params.push(Parameter::new("@a", SqlType::Int));
        bind_return_value(
            &mut params,
            &token("@other", SqlType::Int, WireValue::Int(1)),
            None,
            None,
        )
        .unwrap();
        assert_eq!(params.get(0).unwrap().value, WireValue::Null);
    }

    #[test]
    fn test_return_status_binds_first_return_value() {
        let mut params = ParameterCollection::new();
        params.push(Parameter::new("@x", SqlType::Int));
        params.push(
            Parameter::new("@ret", SqlType::Int).with_direction(ParamDirection::ReturnValue),
        );
        bind_return_status(&mut params, 7);
        assert_eq!(params.get_by_name("@ret").unwrap().value, WireValue::Int(7));
    }

    #[test]
    fn test_return_status_without_return_value_param() {
        let mut params = ParameterCollection::new();
        params.push(Parameter::new("@x", SqlType::Int));
        // Must not panic or bind anywhere.
        bind_return_status(&mut params, 7);
        assert_eq!(params.get(0).unwrap().value, WireValue::Null);
    }

    #[test]
    fn test_decimal_token_carries_precision_scale() {
        let mut params = ParameterCollection::new();
        params.push(
            Parameter::new("@d", SqlType::Decimal).with_direction(ParamDirection::Output),
        );
        let mut t = token(
            "@d",
            SqlType::Decimal,
            WireValue::Decimal {
                unscaled: 12345,
                precision: 10,
                scale: 2,
            },
        );
        t.precision = Some(10);
        t.scale = Some(2);
        bind_return_value(&mut params, &t, None, None).unwrap();
        let p = params.get_by_name("@d").unwrap();
        assert_eq!(p.precision, 10);
        assert_eq!(p.scale, 2);
    }

    #[test]
    fn test_xml_buffer_materializes_to_string() {
        let mut params = ParameterCollection::new();
        params.push(Parameter::new("@x", SqlType::Xml).with_direction(ParamDirection::Output));
        let xml_utf16: Vec<u8> = "<a/>"
            .encode_utf16()
            .flat_map(|u| u.to_le_bytes())
            .collect();
        bind_return_value(
            &mut params,
            &token("@x", SqlType::Xml, WireValue::Xml(Bytes::from(xml_utf16))),
            None,
            None,
        )
        .unwrap();
        assert_eq!(
            params.get_by_name("@x").unwrap().value,
            WireValue::String("<a/>".into())
        );
    }

    #[test]
    fn test_decode_plaintext_roundtrip() {
        use crate::rpc::encode_plaintext;
        let cases = [
            (SqlType::Int, WireValue::Int(-7)),
            (SqlType::BigInt, WireValue::BigInt(1 << 40)),
            (SqlType::Bit, WireValue::Bool(true)),
            (SqlType::NVarChar, WireValue::String("héllo".into())),
            (SqlType::Float, WireValue::Double(2.5)),
        ];
        for (sql_type, value) in cases {
            let encoded = encode_plaintext(&value).unwrap();
            assert_eq!(decode_plaintext(sql_type, &encoded).unwrap(), value);
        }
    }
}
