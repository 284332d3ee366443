//! LQL tokenizer
//!
//! Hand-rolled scanner producing position-tagged tokens. Timespans
//! (`1h`, `7d`) are recognized at the lexer level so the parser sees a
//! single literal token.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Identifier or keyword, possibly dotted (`user.name`)
    Ident(String),
    /// Double-quoted string, unescaped
    Str(String),
    Int(i64),
    Float(f64),
    /// Timespan literal in seconds
    Timespan(i64),
    /// Raw body of a `datetime(...)` literal
    Datetime(String),
    Pipe,
    Comma,
    LParen,
    RParen,
    Star,
    EqEq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    /// Single '=' as in `kind=inner`
    Assign,
}

impl TokenKind {
    pub fn describe(&self) -> String {
        match self {
            Self::Ident(text) => format!("'{}'", text),
            Self::Str(_) => "string literal".to_string(),
            Self::Int(_) | Self::Float(_) => "number".to_string(),
            Self::Timespan(_) => "timespan".to_string(),
            Self::Datetime(_) => "datetime literal".to_string(),
            Self::Pipe => "'|'".to_string(),
            Self::Comma => "','".to_string(),
            Self::LParen => "'('".to_string(),
            Self::RParen => "')'".to_string(),
            Self::Star => "'*'".to_string(),
            Self::EqEq => "'=='".to_string(),
            Self::Neq => "'!='".to_string(),
            Self::Lt => "'<'".to_string(),
            Self::Lte => "'<='".to_string(),
            Self::Gt => "'>'".to_string(),
            Self::Gte => "'>='".to_string(),
            Self::Assign => "'='".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    pub col: u32,
}

/// Lexer error with position
#[derive(Debug, Clone, Serialize)]
pub struct LexError {
    pub line: u32,
    pub col: u32,
    pub message: String,
}

pub fn tokenize(input: &str) -> Result<Vec<Token>, LexError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    let mut line: u32 = 1;
    let mut col: u32 = 1;

    fn advance(i: &mut usize, col: &mut u32, n: usize) {
        *i += n;
        *col += n as u32;
    }

    while i < chars.len() {
        let c = chars[i];
        let (tok_line, tok_col) = (line, col);

        match c {
            '\n' => {
                i += 1;
                line += 1;
                col = 1;
            }
            ' ' | '\t' | '\r' => {
                advance(&mut i, &mut col, 1);
            }
            '|' => {
                tokens.push(Token { kind: TokenKind::Pipe, line: tok_line, col: tok_col });
                advance(&mut i, &mut col, 1);
            }
            ',' => {
                tokens.push(Token { kind: TokenKind::Comma, line: tok_line, col: tok_col });
                advance(&mut i, &mut col, 1);
            }
            '(' => {
                tokens.push(Token { kind: TokenKind::LParen, line: tok_line, col: tok_col });
                advance(&mut i, &mut col, 1);
            }
            ')' => {
                tokens.push(Token { kind: TokenKind::RParen, line: tok_line, col: tok_col });
                advance(&mut i, &mut col, 1);
            }
            '*' => {
                tokens.push(Token { kind: TokenKind::Star, line: tok_line, col: tok_col });
                advance(&mut i, &mut col, 1);
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token { kind: TokenKind::EqEq, line: tok_line, col: tok_col });
                    advance(&mut i, &mut col, 2);
                } else {
                    tokens.push(Token { kind: TokenKind::Assign, line: tok_line, col: tok_col });
                    advance(&mut i, &mut col, 1);
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token { kind: TokenKind::Neq, line: tok_line, col: tok_col });
                    advance(&mut i, &mut col, 2);
                } else {
                    return Err(LexError {
                        line: tok_line,
                        col: tok_col,
                        message: "unexpected '!'".to_string(),
                    });
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token { kind: TokenKind::Lte, line: tok_line, col: tok_col });
                    advance(&mut i, &mut col, 2);
                } else {
                    tokens.push(Token { kind: TokenKind::Lt, line: tok_line, col: tok_col });
                    advance(&mut i, &mut col, 1);
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token { kind: TokenKind::Gte, line: tok_line, col: tok_col });
                    advance(&mut i, &mut col, 2);
                } else {
                    tokens.push(Token { kind: TokenKind::Gt, line: tok_line, col: tok_col });
                    advance(&mut i, &mut col, 1);
                }
            }
            '"' => {
                let mut text = String::new();
                let mut j = i + 1;
                let mut closed = false;
                while j < chars.len() {
                    match chars[j] {
                        '\\' if j + 1 < chars.len() => {
                            let escaped = chars[j + 1];
                            text.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => other,
                            });
                            j += 2;
                        }
                        '"' => {
                            closed = true;
                            j += 1;
                            break;
                        }
                        other => {
                            text.push(other);
                            j += 1;
                        }
                    }
                }
                if !closed {
                    return Err(LexError {
                        line: tok_line,
                        col: tok_col,
                        message: "unterminated string literal".to_string(),
                    });
                }
                let consumed = j - i;
                tokens.push(Token { kind: TokenKind::Str(text), line: tok_line, col: tok_col });
                advance(&mut i, &mut col, consumed);
            }
            c if c.is_ascii_digit() => {
                let mut j = i;
                let mut is_float = false;
                while j < chars.len() && (chars[j].is_ascii_digit() || chars[j] == '.') {
                    if chars[j] == '.' {
                        // Dot followed by non-digit ends the number (e.g. ranges)
                        if !chars.get(j + 1).is_some_and(|next| next.is_ascii_digit()) {
                            break;
                        }
                        is_float = true;
                    }
                    j += 1;
                }
                let number_text: String = chars[i..j].iter().collect();

                // Timespan suffix: 1h, 7d, 30m, 10s, 500ms
                let mut suffix = String::new();
                let mut k = j;
                while k < chars.len() && chars[k].is_ascii_alphabetic() {
                    suffix.push(chars[k]);
                    k += 1;
                }

                if !suffix.is_empty() {
                    let magnitude: f64 = number_text.parse().map_err(|_| LexError {
                        line: tok_line,
                        col: tok_col,
                        message: format!("invalid number '{}'", number_text),
                    })?;
                    let seconds = match suffix.as_str() {
                        "s" => magnitude,
                        "m" => magnitude * 60.0,
                        "h" => magnitude * 3_600.0,
                        "d" => magnitude * 86_400.0,
                        "ms" => magnitude / 1_000.0,
                        other => {
                            return Err(LexError {
                                line: tok_line,
                                col: tok_col,
                                message: format!("unknown timespan unit '{}'", other),
                            });
                        }
                    };
                    tokens.push(Token {
                        kind: TokenKind::Timespan(seconds as i64),
                        line: tok_line,
                        col: tok_col,
                    });
                    let delta = k - i;
                    advance(&mut i, &mut col, delta);
                } else if is_float {
                    let value: f64 = number_text.parse().map_err(|_| LexError {
                        line: tok_line,
                        col: tok_col,
                        message: format!("invalid number '{}'", number_text),
                    })?;
                    tokens.push(Token {
                        kind: TokenKind::Float(value),
                        line: tok_line,
                        col: tok_col,
                    });
                    let delta = j - i;
                    advance(&mut i, &mut col, delta);
                } else {
                    let value: i64 = number_text.parse().map_err(|_| LexError {
                        line: tok_line,
                        col: tok_col,
                        message: format!("invalid number '{}'", number_text),
                    })?;
                    tokens.push(Token { kind: TokenKind::Int(value), line: tok_line, col: tok_col });
                    let delta = j - i;
                    advance(&mut i, &mut col, delta);
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut j = i;
                while j < chars.len()
                    && (chars[j].is_ascii_alphanumeric() || chars[j] == '_' || chars[j] == '.')
                {
                    j += 1;
                }
                // A trailing dot belongs to the next token, not the ident
                while j > i && chars[j - 1] == '.' {
                    j -= 1;
                }
                let text: String = chars[i..j].iter().collect();

                // datetime(...) literal: capture the raw body here, since
                // its contents are not otherwise tokenizable
                if text == "datetime" && chars.get(j) == Some(&'(') {
                    let mut k = j + 1;
                    let mut raw = String::new();
                    while k < chars.len() && chars[k] != ')' {
                        raw.push(chars[k]);
                        k += 1;
                    }
                    if k >= chars.len() {
                        return Err(LexError {
                            line: tok_line,
                            col: tok_col,
                            message: "unterminated datetime literal".to_string(),
                        });
                    }
                    k += 1;
                    let raw = raw.trim().trim_matches('"').to_string();
                    tokens.push(Token {
                        kind: TokenKind::Datetime(raw),
                        line: tok_line,
                        col: tok_col,
                    });
                    let delta = k - i;
                    advance(&mut i, &mut col, delta);
                } else {
                    tokens.push(Token { kind: TokenKind::Ident(text), line: tok_line, col: tok_col });
                    let delta = j - i;
                    advance(&mut i, &mut col, delta);
                }
            }
            other => {
                return Err(LexError {
                    line: tok_line,
                    col: tok_col,
                    message: format!("unexpected character '{}'", other),
                });
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        tokenize(input).unwrap().into_iter().map(|token| token.kind).collect()
    }

    #[test]
    fn test_basic_pipeline_tokens() {
        let tokens = kinds("logs | where severity == \"high\"");
        assert_eq!(
            tokens,
            vec![
                TokenKind::Ident("logs".to_string()),
                TokenKind::Pipe,
                TokenKind::Ident("where".to_string()),
                TokenKind::Ident("severity".to_string()),
                TokenKind::EqEq,
                TokenKind::Str("high".to_string()),
            ]
        );
    }

    #[test]
    fn test_numbers_and_timespans() {
        assert_eq!(kinds("5"), vec![TokenKind::Int(5)]);
        assert_eq!(kinds("2.5"), vec![TokenKind::Float(2.5)]);
        assert_eq!(kinds("1h"), vec![TokenKind::Timespan(3_600)]);
        assert_eq!(kinds("7d"), vec![TokenKind::Timespan(604_800)]);
    }

    #[test]
    fn test_dotted_identifier() {
        assert_eq!(
            kinds("user.name"),
            vec![TokenKind::Ident("user.name".to_string())]
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            kinds(r#""a\"b""#),
            vec![TokenKind::Str("a\"b".to_string())]
        );
    }

    #[test]
    fn test_position_tracking() {
        let tokens = tokenize("logs\n| where x > 1").unwrap();
        let pipe = &tokens[1];
        assert_eq!(pipe.line, 2);
        assert_eq!(pipe.col, 1);
        let x = &tokens[3];
        assert_eq!(x.line, 2);
        assert_eq!(x.col, 9);
    }

    #[test]
    fn test_unterminated_string_errors() {
        let err = tokenize("where a == \"oops").unwrap_err();
        assert!(err.message.contains("unterminated"));
    }

    #[test]
    fn test_comparison_operators() {
        assert_eq!(
            kinds("a >= 1 b <= 2 c != 3 d = e"),
            vec![
                TokenKind::Ident("a".to_string()),
                TokenKind::Gte,
                TokenKind::Int(1),
                TokenKind::Ident("b".to_string()),
                TokenKind::Lte,
                TokenKind::Int(2),
                TokenKind::Ident("c".to_string()),
                TokenKind::Neq,
                TokenKind::Int(3),
                TokenKind::Ident("d".to_string()),
                TokenKind::Assign,
                TokenKind::Ident("e".to_string()),
            ]
        );
    }
}
