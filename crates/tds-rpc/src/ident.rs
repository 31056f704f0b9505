//! Multi-part identifier parsing and quoting.
//!
//! Procedure names and UDT type names arrive as dotted multi-part
//! identifiers, optionally quoted with `[` and `]` (a literal `]` inside a
//! quoted part is doubled). The record builder uses these helpers both to
//! split incoming names and to emit safely quoted ones.

use crate::{Result, RpcError};

/// Split a dotted, optionally bracket-quoted identifier into its parts.
///
/// Empty unquoted parts (`a..b`) and unterminated quotes are rejected.
/// At most `max_parts` parts are accepted.
///
/// # Examples
///
/// ```
/// use tds_rpc::parse_multipart_identifier;
///
/// let parts = parse_multipart_identifier("[dbo].[My.Proc]", 4).unwrap();
/// assert_eq!(parts, vec!["dbo", "My.Proc"]);
/// ```
pub fn parse_multipart_identifier(name: &str, max_parts: usize) -> Result<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = name.chars().peekable();
    let mut in_quotes = false;
    let mut part_done = false;

    while let Some(c) = chars.next() {
        match c {
            '[' if !in_quotes && current.is_empty() && !part_done => in_quotes = true,
            ']' if in_quotes => {
                if chars.peek() == Some(&']') {
                    chars.next();
                    current.push(']');
                } else {
                    in_quotes = false;
                    part_done = true;
                }
            }
            '.' if !in_quotes => {
                if current.is_empty() && !part_done {
                    return Err(RpcError::InvalidIdentifier(format!(
                        "empty part in `{name}`"
                    )));
                }
                parts.push(std::mem::take(&mut current));
                part_done = false;
            }
            _ if part_done => {
                return Err(RpcError::InvalidIdentifier(format!(
                    "unexpected character after `]` in `{name}`"
                )));
            }
            _ => current.push(c),
        }
    }

    if in_quotes {
        return Err(RpcError::InvalidIdentifier(format!(
            "unterminated `[` in `{name}`"
        )));
    }
    if current.is_empty() && !part_done {
        return Err(RpcError::InvalidIdentifier(format!(
            "empty part in `{name}`"
        )));
    }
    parts.push(current);

    if parts.len() > max_parts {
        return Err(RpcError::InvalidIdentifier(format!(
            "`{name}` has {} parts, at most {max_parts} allowed",
            parts.len()
        )));
    }
    Ok(parts)
}

/// Quote a single identifier part with `[` and `]`, doubling embedded `]`.
#[must_use]
pub fn quote_identifier(part: &str) -> String {
    let mut out = String::with_capacity(part.len() + 2);
    out.push('[');
    for c in part.chars() {
        if c == ']' {
            out.push(']');
        }
        out.push(c);
    }
    out.push(']');
    out
}

/// Quote every part of a multi-part name and join with dots.
pub fn quote_multipart_identifier(name: &str, max_parts: usize) -> Result<String> {
    let parts = parse_multipart_identifier(name, max_parts)?;
    Ok(parts
        .iter()
        .map(|p| quote_identifier(p))
        .collect::<Vec<_>>()
        .join("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple() {
        assert_eq!(
            parse_multipart_identifier("dbo.my_proc", 4).unwrap(),
            vec!["dbo", "my_proc"]
        );
    }

    #[test]
    fn test_parse_single_part() {
        assert_eq!(
            parse_multipart_identifier("my_proc", 4).unwrap(),
            vec!["my_proc"]
        );
    }

    #[test]
    fn test_parse_quoted_with_dot() {
        assert_eq!(
            parse_multipart_identifier("[dbo].[My.Proc]", 4).unwrap(),
            vec!["dbo", "My.Proc"]
        );
    }

    #[test]
    fn test_parse_escaped_bracket() {
        assert_eq!(
            parse_multipart_identifier("[a]]b]", 4).unwrap(),
            vec!["a]b"]
        );
    }

    #[test]
    fn test_parse_rejects_empty_part() {
        assert!(parse_multipart_identifier("a..b", 4).is_err());
        assert!(parse_multipart_identifier(".a", 4).is_err());
    }

    #[test]
    fn test_parse_rejects_unterminated_quote() {
        assert!(parse_multipart_identifier("[abc", 4).is_err());
    }

    #[test]
    fn test_parse_rejects_trailing_garbage() {
        assert!(parse_multipart_identifier("[a]x", 4).is_err());
    }

    #[test]
    fn test_parse_rejects_too_many_parts() {
        assert!(parse_multipart_identifier("a.b.c", 2).is_err());
    }

    #[test]
    fn test_quote_plain() {
        assert_eq!(quote_identifier("proc"), "[proc]");
    }

    #[test]
    fn test_quote_doubles_bracket() {
        assert_eq!(quote_identifier("a]b"), "[a]]b]");
    }

    #[test]
    fn test_quote_multipart_roundtrip() {
        let quoted = quote_multipart_identifier("dbo.My]Proc", 4).unwrap();
        assert_eq!(quoted, "[dbo].[My]]Proc]");
        let parts = parse_multipart_identifier(&quoted, 4).unwrap();
        assert_eq!(parts, vec!["dbo", "My]Proc"]);
    }
}
