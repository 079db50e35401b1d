use crate::parser::ParseError;
use crate::{MAX_SCRIPT_SIZE, MAX_STRING_LEN, MAX_TOKENS};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Token {
    Identifier(String),
    Tag(String),
    Number(u64),
    String(String),
    BlockOpen,
    BlockClose,
    ParenOpen,
    ParenClose,
    BracketOpen,
    BracketClose,
    Comma,
    Semicolon,
}

/// Tokenizes a script, enforcing the size, token-count and
/// string-length bounds. Comments (`#` to end of line and
/// bracketed `/* */`) are skipped.
pub fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    if input.len() > MAX_SCRIPT_SIZE {
        return Err(ParseError::ScriptTooLarge(input.len()));
    }

    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        if tokens.len() > MAX_TOKENS {
            return Err(ParseError::TooManyTokens);
        }
        let c = bytes[pos] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => pos += 1,
            '#' => {
                while pos < bytes.len() && bytes[pos] != b'\n' {
                    pos += 1;
                }
            }
            '/' if bytes.get(pos + 1) == Some(&b'*') => {
                let end = find_subslice(&bytes[pos + 2..], b"*/")
                    .ok_or(ParseError::UnterminatedComment)?;
                pos += 2 + end + 2;
            }
            '{' => {
                tokens.push(Token::BlockOpen);
                pos += 1;
            }
            '}' => {
                tokens.push(Token::BlockClose);
                pos += 1;
            }
            '(' => {
                tokens.push(Token::ParenOpen);
                pos += 1;
            }
            ')' => {
                tokens.push(Token::ParenClose);
                pos += 1;
            }
            '[' => {
                tokens.push(Token::BracketOpen);
                pos += 1;
            }
            ']' => {
                tokens.push(Token::BracketClose);
                pos += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                pos += 1;
            }
            ';' => {
                tokens.push(Token::Semicolon);
                pos += 1;
            }
            '"' => {
                let (s, next) = lex_string(bytes, pos + 1)?;
                tokens.push(Token::String(s));
                pos = next;
            }
            ':' => {
                let start = pos + 1;
                let end = scan_word(bytes, start);
                if end == start {
                    return Err(ParseError::UnexpectedChar(':'));
                }
                tokens.push(Token::Tag(input[start..end].to_lowercase()));
                pos = end;
            }
            '0'..='9' => {
                let start = pos;
                let mut end = pos;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                let mut value: u64 = input[start..end]
                    .parse()
                    .map_err(|_| ParseError::BadNumber)?;
                // RFC 5228 quantifiers
                if end < bytes.len() {
                    let mult = match bytes[end] as char {
                        'k' | 'K' => Some(1024),
                        'm' | 'M' => Some(1024 * 1024),
                        'g' | 'G' => Some(1024 * 1024 * 1024),
                        _ => None,
                    };
                    if let Some(mult) = mult {
                        value = value.checked_mul(mult).ok_or(ParseError::BadNumber)?;
                        end += 1;
                    }
                }
                tokens.push(Token::Number(value));
                pos = end;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let end = scan_word(bytes, pos);
                tokens.push(Token::Identifier(input[pos..end].to_lowercase()));
                pos = end;
            }
            other => return Err(ParseError::UnexpectedChar(other)),
        }
    }

    Ok(tokens)
}

fn scan_word(bytes: &[u8], start: usize) -> usize {
    let mut end = start;
    while end < bytes.len() {
        let c = bytes[end] as char;
        if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
            end += 1;
        } else {
            break;
        }
    }
    end
}

fn lex_string(bytes: &[u8], mut pos: usize) -> Result<(String, usize), ParseError> {
    let mut out: Vec<u8> = Vec::new();
    while pos < bytes.len() {
        if out.len() > MAX_STRING_LEN {
            return Err(ParseError::StringTooLong);
        }
        match bytes[pos] {
            b'"' => return Ok((String::from_utf8_lossy(&out).into_owned(), pos + 1)),
            b'\\' => {
                let next = *bytes.get(pos + 1).ok_or(ParseError::UnterminatedString)?;
                out.push(next);
                pos += 2;
            }
            c => {
                out.push(c);
                pos += 1;
            }
        }
    }
    Err(ParseError::UnterminatedString)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_a_rule() {
        let tokens =
            tokenize("if header :contains \"Subject\" \"team\" { fileinto \"Team\"; }").unwrap();
        assert_eq!(tokens[0], Token::Identifier("if".into()));
        assert_eq!(tokens[1], Token::Identifier("header".into()));
        assert_eq!(tokens[2], Token::Tag("contains".into()));
        assert!(tokens.contains(&Token::BlockOpen));
        assert!(tokens.contains(&Token::Semicolon));
    }

    #[test]
    fn size_quantifiers() {
        let tokens = tokenize("size :over 2M").unwrap();
        assert_eq!(tokens[2], Token::Number(2 * 1024 * 1024));
    }

    #[test]
    fn string_escapes() {
        let tokens = tokenize(r#""a \"b\" \\ c""#).unwrap();
        assert_eq!(tokens[0], Token::String(r#"a "b" \ c"#.into()));
    }

    #[test]
    fn comments_are_skipped() {
        let tokens = tokenize("# comment\nkeep; /* block\ncomment */ stop;").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Identifier("keep".into()),
                Token::Semicolon,
                Token::Identifier("stop".into()),
                Token::Semicolon,
            ]
        );
    }

    #[test]
    fn rejects_oversized_string() {
        let script = format!("\"{}\"", "a".repeat(MAX_STRING_LEN + 1));
        assert!(matches!(
            tokenize(&script),
            Err(ParseError::StringTooLong)
        ));
    }
}
