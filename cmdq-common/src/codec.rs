//! Text-format encode/decode for the three PostgreSQL wire shapes this
//! daemon needs to hand-roll: composite literals, arrays of composites, and
//! hstore. `tokio_postgres` gives us typed columns for everything *read* off
//! a `RowDescription`, but NOTIFY payloads and the PG diagnostic records we
//! serialize back into `nonfatal_errors` only exist as text, so we centralize
//! the quoting rules here instead of duplicating them per call site.

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unterminated quoted field in composite literal")]
    UnterminatedQuote,
    #[error("unbalanced parentheses in composite literal")]
    Unbalanced,
    #[error("unbalanced braces in array literal")]
    UnbalancedArray,
}

/// Encode a sequence of optional fields as a PostgreSQL composite literal,
/// e.g. `("a","b,c",)` for `[Some("a"), Some("b,c"), None]`.
pub fn encode_composite<'a, I>(fields: I) -> String
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    let mut out = String::from("(");
    let mut first = true;
    for field in fields {
        if !first {
            out.push(',');
        }
        first = false;
        if let Some(value) = field {
            out.push('"');
            for ch in value.chars() {
                if ch == '"' || ch == '\\' {
                    out.push('\\');
                }
                out.push(ch);
            }
            out.push('"');
        }
        // None (SQL NULL) is encoded as the empty string between delimiters.
    }
    out.push(')');
    out
}

/// Decode a PostgreSQL composite literal into its field vector. A field is
/// `None` if it was written unquoted-and-empty (SQL NULL); a quoted empty
/// string decodes to `Some(String::new())`.
pub fn decode_composite(input: &str) -> Result<Vec<Option<String>>, CodecError> {
    let bytes: Vec<char> = input.trim().chars().collect();
    if bytes.first() != Some(&'(') || bytes.last() != Some(&')') {
        return Err(CodecError::Unbalanced);
    }
    let inner = &bytes[1..bytes.len() - 1];

    let mut fields = Vec::new();
    let mut i = 0;
    while i <= inner.len() {
        if i == inner.len() {
            // Trailing field after the last comma (or the only field).
            fields.push(None);
            break;
        }
        if inner[i] == '"' {
            let mut value = String::new();
            let mut j = i + 1;
            let mut closed = false;
            while j < inner.len() {
                match inner[j] {
                    '\\' if j + 1 < inner.len() => {
                        value.push(inner[j + 1]);
                        j += 2;
                    }
                    '"' => {
                        j += 1;
                        closed = true;
                        break;
                    }
                    c => {
                        value.push(c);
                        j += 1;
                    }
                }
            }
            if !closed {
                return Err(CodecError::UnterminatedQuote);
            }
            fields.push(Some(value));
            // Skip to the next comma.
            i = j;
            if i < inner.len() && inner[i] == ',' {
                i += 1;
            } else {
                i += 1;
                continue;
            }
        } else {
            let start = i;
            while i < inner.len() && inner[i] != ',' {
                i += 1;
            }
            let raw: String = inner[start..i].iter().collect();
            fields.push(if raw.is_empty() { None } else { Some(raw) });
            i += 1;
        }
    }
    Ok(fields)
}

/// Encode a sequence of already-encoded element literals as a PostgreSQL
/// text array, e.g. `{"(1,a)","(2,b)"}`.
pub fn encode_array<'a, I>(elements: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut out = String::from("{");
    let mut first = true;
    for element in elements {
        if !first {
            out.push(',');
        }
        first = false;
        out.push('"');
        for ch in element.chars() {
            if ch == '"' || ch == '\\' {
                out.push('\\');
            }
            out.push(ch);
        }
        out.push('"');
    }
    out.push('}');
    out
}

/// Decode a PostgreSQL text array into its raw (unescaped) element strings.
/// Each returned element is itself a composite/scalar literal to be
/// decoded further by the caller.
pub fn decode_array(input: &str) -> Result<Vec<String>, CodecError> {
    let chars: Vec<char> = input.trim().chars().collect();
    if chars.first() != Some(&'{') || chars.last() != Some(&'}') {
        return Err(CodecError::UnbalancedArray);
    }
    let inner = &chars[1..chars.len() - 1];
    if inner.is_empty() {
        return Ok(Vec::new());
    }

    let mut elements = Vec::new();
    let mut i = 0;
    while i < inner.len() {
        if inner[i] == '"' {
            let mut value = String::new();
            let mut j = i + 1;
            let mut closed = false;
            while j < inner.len() {
                match inner[j] {
                    '\\' if j + 1 < inner.len() => {
                        value.push(inner[j + 1]);
                        j += 2;
                    }
                    '"' => {
                        j += 1;
                        closed = true;
                        break;
                    }
                    c => {
                        value.push(c);
                        j += 1;
                    }
                }
            }
            if !closed {
                return Err(CodecError::UnterminatedQuote);
            }
            elements.push(value);
            i = j;
            if i < inner.len() && inner[i] == ',' {
                i += 1;
            }
        } else {
            let start = i;
            while i < inner.len() && inner[i] != ',' {
                i += 1;
            }
            elements.push(inner[start..i].iter().collect());
            if i < inner.len() {
                i += 1;
            }
        }
    }
    Ok(elements)
}

/// Encode a `key => value` mapping as hstore text, e.g. `"a"=>"1","b"=>NULL`.
/// Used to pass the queue's environment overrides to `runner_session_start`.
pub fn encode_hstore<'a, I>(pairs: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = String::new();
    let mut first = true;
    for (key, value) in pairs {
        if !first {
            out.push_str(", ");
        }
        first = false;
        write_hstore_quoted(&mut out, key);
        out.push_str("=>");
        write_hstore_quoted(&mut out, value);
    }
    out
}

/// Decode hstore text into key/value pairs; a value of bare `NULL` decodes
/// to `None`. Used to read back `env` columns stored as hstore.
pub fn decode_hstore(input: &str) -> Result<Vec<(String, Option<String>)>, CodecError> {
    let chars: Vec<char> = input.trim().chars().collect();
    let mut pairs = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        while i < chars.len() && (chars[i] == ',' || chars[i].is_whitespace()) {
            i += 1;
        }
        if i >= chars.len() {
            break;
        }
        let (key, next) = read_hstore_scalar(&chars, i)?;
        i = next;
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        if chars.get(i) != Some(&'=') || chars.get(i + 1) != Some(&'>') {
            return Err(CodecError::UnterminatedQuote);
        }
        i += 2;
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        if chars[i..].iter().collect::<String>().starts_with("NULL")
            && !matches!(chars.get(i + 4), Some(c) if *c != ',' && !c.is_whitespace())
        {
            pairs.push((key.expect("hstore key must not be NULL"), None));
            i += 4;
        } else {
            let (value, next) = read_hstore_scalar(&chars, i)?;
            i = next;
            pairs.push((key.expect("hstore key must not be NULL"), value));
        }
    }
    Ok(pairs)
}

fn read_hstore_scalar(chars: &[char], start: usize) -> Result<(Option<String>, usize), CodecError> {
    if chars.get(start) != Some(&'"') {
        return Err(CodecError::UnterminatedQuote);
    }
    let mut value = String::new();
    let mut j = start + 1;
    let mut closed = false;
    while j < chars.len() {
        match chars[j] {
            '\\' if j + 1 < chars.len() => {
                value.push(chars[j + 1]);
                j += 2;
            }
            '"' => {
                j += 1;
                closed = true;
                break;
            }
            c => {
                value.push(c);
                j += 1;
            }
        }
    }
    if !closed {
        return Err(CodecError::UnterminatedQuote);
    }
    Ok((Some(value), j))
}

fn write_hstore_quoted(out: &mut String, value: &str) {
    out.push('"');
    for ch in value.chars() {
        if ch == '"' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_round_trip_simple() {
        let fields = vec![Some("23505"), Some("duplicate key"), None];
        let encoded = encode_composite(fields.clone());
        let decoded = decode_composite(&encoded).unwrap();
        assert_eq!(
            decoded,
            vec![
                Some("23505".to_string()),
                Some("duplicate key".to_string()),
                None
            ]
        );
    }

    #[test]
    fn composite_round_trip_quoting_sensitive_chars() {
        for raw in [
            "plain",
            "has,comma",
            "has\"quote",
            "has\\backslash",
            "has(paren)",
            "",
            "mix \",\\()",
        ] {
            let encoded = encode_composite(vec![Some(raw)]);
            let decoded = decode_composite(&encoded).unwrap();
            assert_eq!(decoded, vec![Some(raw.to_string())]);
        }
    }

    #[test]
    fn composite_empty_field_is_null() {
        let decoded = decode_composite("(,,)").unwrap();
        assert_eq!(decoded, vec![None, None, None]);
    }

    #[test]
    fn composite_rejects_unbalanced_input() {
        assert_eq!(decode_composite("a,b"), Err(CodecError::Unbalanced));
    }

    #[test]
    fn array_round_trip() {
        let elements = vec![
            encode_composite(vec![Some("1"), Some("a")]),
            encode_composite(vec![Some("2"), Some("b,c")]),
        ];
        let refs: Vec<&str> = elements.iter().map(|s| s.as_str()).collect();
        let encoded = encode_array(refs);
        let decoded = decode_array(&encoded).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(
            decode_composite(&decoded[1]).unwrap(),
            vec![Some("2".to_string()), Some("b,c".to_string())]
        );
    }

    #[test]
    fn array_empty() {
        assert_eq!(decode_array("{}").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn hstore_basic_encoding() {
        let encoded = encode_hstore(vec![("PATH", "/usr/bin"), ("FOO", "bar,baz")]);
        assert_eq!(encoded, "\"PATH\"=>\"/usr/bin\", \"FOO\"=>\"bar,baz\"");
    }

    #[test]
    fn hstore_round_trip_with_null_value() {
        let decoded = decode_hstore("\"PATH\"=>\"/usr/bin\", \"EMPTY\"=>NULL").unwrap();
        assert_eq!(
            decoded,
            vec![
                ("PATH".to_string(), Some("/usr/bin".to_string())),
                ("EMPTY".to_string(), None),
            ]
        );
    }
}
