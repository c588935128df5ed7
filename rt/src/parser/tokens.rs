//! Line tokenizer shared by both textual workflow forms.
//!
//! A line is a whitespace-separated sequence of `key=value` pairs. Values
//! are bare (up to the next whitespace) or double-quoted; quoted values
//! preserve embedded whitespace and support backslash escapes for `"`
//! and `\`. Payloads may be any Unicode; the syntax itself is ASCII.

use super::ParseError;

/// Tokenize one non-comment line into ordered key/value pairs.
pub fn tokenize(line: &str, lineno: usize) -> Result<Vec<(String, String)>, ParseError> {
    let mut pairs = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        loop {
            match chars.next() {
                Some('=') => break,
                Some(c) if c.is_whitespace() => {
                    return Err(ParseError::Syntax {
                        line: lineno,
                        message: format!("malformed token '{key}': expected '='"),
                    });
                }
                Some(c) => key.push(c),
                None => {
                    return Err(ParseError::Syntax {
                        line: lineno,
                        message: format!("malformed token '{key}': expected '='"),
                    });
                }
            }
        }
        if key.is_empty() {
            return Err(ParseError::Syntax {
                line: lineno,
                message: "malformed token: empty key".to_string(),
            });
        }

        let value = if chars.peek() == Some(&'"') {
            chars.next();
            let mut value = String::new();
            loop {
                match chars.next() {
                    Some('\\') => match chars.next() {
                        Some(c @ ('"' | '\\')) => value.push(c),
                        Some(c) => {
                            return Err(ParseError::Syntax {
                                line: lineno,
                                message: format!("invalid escape '\\{c}' in value of '{key}'"),
                            });
                        }
                        None => {
                            return Err(ParseError::Syntax {
                                line: lineno,
                                message: format!("unclosed quote in value of '{key}'"),
                            });
                        }
                    },
                    Some('"') => break,
                    Some(c) => value.push(c),
                    None => {
                        return Err(ParseError::Syntax {
                            line: lineno,
                            message: format!("unclosed quote in value of '{key}'"),
                        });
                    }
                }
            }
            value
        } else {
            let mut value = String::new();
            while matches!(chars.peek(), Some(c) if !c.is_whitespace()) {
                value.push(chars.next().unwrap_or_default());
            }
            value
        };

        pairs.push((key, value));
    }

    Ok(pairs)
}

/// Quote a value for re-emission in line form when it needs it.
pub fn quote_if_needed(value: &str) -> String {
    if !value.is_empty() && !value.chars().any(|c| c.is_whitespace() || c == '"' || c == '\\') {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}
