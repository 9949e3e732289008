use super::ScriptError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Double(f64),
    Str(String),
    Ident(String),
    // Keywords
    Def,
    If,
    Else,
    While,
    True,
    False,
    Null,
    // Punctuation
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Assign,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    AndAnd,
    OrOr,
    Bang,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    DotDot,
    DotDotLt,
    Arrow,
    Separator,
}

/// Splits a script into tokens. Newlines and semicolons both become
/// [`Token::Separator`]; the parser collapses runs of them.
pub fn tokenize(source: &str) -> Result<Vec<Token>, ScriptError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' => i += 1,
            '\n' | ';' => {
                tokens.push(Token::Separator);
                i += 1;
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                // A '.' is part of the number only when followed by a digit;
                // otherwise it is a range or member access.
                if i < chars.len()
                    && chars[i] == '.'
                    && chars.get(i + 1).is_some_and(char::is_ascii_digit)
                {
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                    let text: String = chars[start..i].iter().collect();
                    let value = text.parse::<f64>().map_err(|e| {
                        ScriptError::Compile(format!("invalid number literal '{text}': {e}"))
                    })?;
                    tokens.push(Token::Double(value));
                } else {
                    let text: String = chars[start..i].iter().collect();
                    let value = text.parse::<i64>().map_err(|e| {
                        ScriptError::Compile(format!("invalid number literal '{text}': {e}"))
                    })?;
                    tokens.push(Token::Int(value));
                }
            }
            '\'' | '"' => {
                let quote = c;
                i += 1;
                let mut text = String::new();
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(ScriptError::Compile(
                                "unterminated string literal".to_string(),
                            ));
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            i += 1;
                            match chars.get(i) {
                                Some('n') => text.push('\n'),
                                Some('t') => text.push('\t'),
                                Some(&esc) => text.push(esc),
                                None => {
                                    return Err(ScriptError::Compile(
                                        "unterminated string literal".to_string(),
                                    ));
                                }
                            }
                            i += 1;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "def" => Token::Def,
                    "if" => Token::If,
                    "else" => Token::Else,
                    "while" => Token::While,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(word),
                });
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' if chars.get(i + 1) == Some(&'>') => {
                tokens.push(Token::Arrow);
                i += 2;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '=' => {
                tokens.push(Token::Assign);
                i += 1;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::NotEq);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Bang);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::LtEq);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::GtEq);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '{' => {
                tokens.push(Token::LBrace);
                i += 1;
            }
            '}' => {
                tokens.push(Token::RBrace);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '.' if chars.get(i + 1) == Some(&'.') => {
                if chars.get(i + 2) == Some(&'<') {
                    tokens.push(Token::DotDotLt);
                    i += 3;
                } else {
                    tokens.push(Token::DotDot);
                    i += 2;
                }
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            other => {
                return Err(ScriptError::Compile(format!(
                    "unexpected character '{other}'"
                )));
            }
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_arithmetic() {
        let tokens = tokenize("1 + 1").unwrap();
        assert_eq!(tokens, vec![Token::Int(1), Token::Plus, Token::Int(1)]);
    }

    #[test]
    fn distinguishes_range_from_float() {
        assert_eq!(
            tokenize("0..9").unwrap(),
            vec![Token::Int(0), Token::DotDot, Token::Int(9)]
        );
        assert_eq!(tokenize("0.5").unwrap(), vec![Token::Double(0.5)]);
        assert_eq!(
            tokenize("0..<9").unwrap(),
            vec![Token::Int(0), Token::DotDotLt, Token::Int(9)]
        );
    }

    #[test]
    fn semicolons_and_newlines_are_separators() {
        let tokens = tokenize("a;b\nc").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("a".into()),
                Token::Separator,
                Token::Ident("b".into()),
                Token::Separator,
                Token::Ident("c".into()),
            ]
        );
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            tokenize(r#"'a\'b'"#).unwrap(),
            vec![Token::Str("a'b".into())]
        );
    }

    #[test]
    fn rejects_stray_characters() {
        assert!(tokenize("1 @ 2").is_err());
    }
}
