use super::EvalError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

/// Offset-tagged token, so parse errors can point into the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub offset: usize,
}

pub fn tokenize(src: &str) -> Result<Vec<Spanned>, EvalError> {
    let bytes = src.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        let start = i;
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
                continue;
            }
            '+' => {
                out.push(Spanned { token: Token::Plus, offset: start });
                i += 1;
            }
            '-' => {
                out.push(Spanned { token: Token::Minus, offset: start });
                i += 1;
            }
            '*' => {
                if bytes.get(i + 1) == Some(&b'*') {
                    out.push(Spanned { token: Token::DoubleStar, offset: start });
                    i += 2;
                } else {
                    out.push(Spanned { token: Token::Star, offset: start });
                    i += 1;
                }
            }
            '/' => {
                if bytes.get(i + 1) == Some(&b'/') {
                    out.push(Spanned { token: Token::DoubleSlash, offset: start });
                    i += 2;
                } else {
                    out.push(Spanned { token: Token::Slash, offset: start });
                    i += 1;
                }
            }
            '%' => {
                out.push(Spanned { token: Token::Percent, offset: start });
                i += 1;
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    out.push(Spanned { token: Token::Eq, offset: start });
                    i += 2;
                } else {
                    // Assignment never tokenizes; the grammar is
                    // expressions only.
                    return Err(EvalError::Lex('=', start));
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    out.push(Spanned { token: Token::Ne, offset: start });
                    i += 2;
                } else {
                    return Err(EvalError::Lex('!', start));
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    out.push(Spanned { token: Token::Le, offset: start });
                    i += 2;
                } else {
                    out.push(Spanned { token: Token::Lt, offset: start });
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    out.push(Spanned { token: Token::Ge, offset: start });
                    i += 2;
                } else {
                    out.push(Spanned { token: Token::Gt, offset: start });
                    i += 1;
                }
            }
            '(' => {
                out.push(Spanned { token: Token::LParen, offset: start });
                i += 1;
            }
            ')' => {
                out.push(Spanned { token: Token::RParen, offset: start });
                i += 1;
            }
            '[' => {
                out.push(Spanned { token: Token::LBracket, offset: start });
                i += 1;
            }
            ']' => {
                out.push(Spanned { token: Token::RBracket, offset: start });
                i += 1;
            }
            ',' => {
                out.push(Spanned { token: Token::Comma, offset: start });
                i += 1;
            }
            '\'' | '"' => {
                let quote = c;
                i += 1;
                let mut text = String::new();
                loop {
                    match src[i..].chars().next() {
                        None => return Err(EvalError::UnterminatedString),
                        Some(ch) if ch == quote => {
                            i += ch.len_utf8();
                            break;
                        }
                        Some('\\') => {
                            i += 1;
                            match src[i..].chars().next() {
                                Some('n') => {
                                    text.push('\n');
                                    i += 1;
                                }
                                Some('t') => {
                                    text.push('\t');
                                    i += 1;
                                }
                                Some(other) => {
                                    text.push(other);
                                    i += other.len_utf8();
                                }
                                None => return Err(EvalError::UnterminatedString),
                            }
                        }
                        Some(ch) => {
                            text.push(ch);
                            i += ch.len_utf8();
                        }
                    }
                }
                out.push(Spanned { token: Token::Str(text), offset: start });
            }
            '0'..='9' | '.' => {
                let mut end = i;
                let mut seen_exp = false;
                while end < bytes.len() {
                    let b = bytes[end] as char;
                    let is_number_part = b.is_ascii_digit()
                        || b == '.'
                        || b == 'e'
                        || b == 'E'
                        || (seen_exp
                            && (b == '+' || b == '-')
                            && matches!(bytes[end - 1], b'e' | b'E'));
                    if !is_number_part {
                        break;
                    }
                    if b == 'e' || b == 'E' {
                        seen_exp = true;
                    }
                    end += 1;
                }
                let text = &src[i..end];
                // Integral literals stay integers; a decimal point or
                // exponent makes the literal a float, as in Python.
                let token = if !text.contains(['.', 'e', 'E']) {
                    match text.parse::<i64>() {
                        Ok(v) => Token::Int(v),
                        Err(_) => Token::Float(
                            text.parse().map_err(|_| EvalError::Lex(c, start))?,
                        ),
                    }
                } else {
                    Token::Float(text.parse().map_err(|_| EvalError::Lex(c, start))?)
                };
                out.push(Spanned { token, offset: start });
                i = end;
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = i;
                while end < bytes.len() {
                    let b = bytes[end] as char;
                    if b.is_ascii_alphanumeric() || b == '_' {
                        end += 1;
                    } else {
                        break;
                    }
                }
                out.push(Spanned {
                    token: Token::Ident(src[i..end].to_string()),
                    offset: start,
                });
                i = end;
            }
            other => return Err(EvalError::Lex(other, start)),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Token> {
        tokenize(src).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn numbers_operators_and_idents() {
        assert_eq!(
            kinds("1 + 2.5e3 * price"),
            vec![
                Token::Int(1),
                Token::Plus,
                Token::Float(2500.0),
                Token::Star,
                Token::Ident("price".into()),
            ]
        );
        assert_eq!(kinds("1.0"), vec![Token::Float(1.0)]);
        assert_eq!(kinds("1e2"), vec![Token::Float(100.0)]);
    }

    #[test]
    fn two_char_operators() {
        assert_eq!(
            kinds("** // <= >= == !="),
            vec![
                Token::DoubleStar,
                Token::DoubleSlash,
                Token::Le,
                Token::Ge,
                Token::Eq,
                Token::Ne,
            ]
        );
    }

    #[test]
    fn strings_with_both_quotes_and_escapes() {
        assert_eq!(
            kinds(r#"'a' "b" 'c\'d'"#),
            vec![
                Token::Str("a".into()),
                Token::Str("b".into()),
                Token::Str("c'd".into()),
            ]
        );
    }

    #[test]
    fn rejects_bare_assignment_and_attribute_syntax() {
        assert!(tokenize("x = 1").is_err());
        // '.' outside a number only occurs in attribute access, which
        // fails to parse as a number.
        assert!(tokenize("a.b").is_err());
    }
}
