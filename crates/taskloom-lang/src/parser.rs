//! S-expression tokeniser and reader

use crate::value::Value;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ParseError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("unexpected ')' at position {0}")]
    UnexpectedClose(usize),

    #[error("unterminated string starting at position {0}")]
    UnterminatedString(usize),

    #[error("invalid escape '\\{0}'")]
    InvalidEscape(char),

    #[error("trailing input after expression: '{0}'")]
    TrailingInput(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Open,
    Close,
    Quote,
    Str(String),
    Atom(String),
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, ParseError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            ';' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '(' => {
                tokens.push((Token::Open, i));
                i += 1;
            }
            ')' => {
                tokens.push((Token::Close, i));
                i += 1;
            }
            '\'' => {
                tokens.push((Token::Quote, i));
                i += 1;
            }
            '"' => {
                let start = i;
                i += 1;
                let mut text = String::new();
                loop {
                    match chars.get(i) {
                        None => return Err(ParseError::UnterminatedString(start)),
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            i += 1;
                            match chars.get(i) {
                                Some('"') => text.push('"'),
                                Some('\\') => text.push('\\'),
                                Some('n') => text.push('\n'),
                                Some('t') => text.push('\t'),
                                Some(&other) => return Err(ParseError::InvalidEscape(other)),
                                None => return Err(ParseError::UnterminatedString(start)),
                            }
                            i += 1;
                        }
                        Some(&ch) => {
                            text.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push((Token::Str(text), start));
            }
            _ => {
                let start = i;
                let mut atom = String::new();
                while i < chars.len()
                    && !chars[i].is_whitespace()
                    && !matches!(chars[i], '(' | ')' | '"' | ';')
                {
                    atom.push(chars[i]);
                    i += 1;
                }
                tokens.push((Token::Atom(atom), start));
            }
        }
    }

    Ok(tokens)
}

fn classify_atom(atom: &str) -> Value {
    match atom {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "nil" => Value::nil(),
        _ => {
            if let Ok(n) = atom.parse::<i64>() {
                Value::Int(n)
            } else if let Ok(f) = atom.parse::<f64>() {
                Value::Float(f)
            } else {
                Value::Symbol(atom.to_string())
            }
        }
    }
}

struct Reader {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Reader {
    fn peek(&self) -> Option<&(Token, usize)> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<(Token, usize)> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn read_expr(&mut self) -> Result<Value, ParseError> {
        match self.next() {
            None => Err(ParseError::UnexpectedEof),
            Some((Token::Close, at)) => Err(ParseError::UnexpectedClose(at)),
            Some((Token::Str(s), _)) => Ok(Value::Str(s)),
            Some((Token::Atom(a), _)) => Ok(classify_atom(&a)),
            Some((Token::Quote, _)) => {
                let quoted = self.read_expr()?;
                Ok(Value::List(vec![Value::Symbol("quote".to_string()), quoted]))
            }
            Some((Token::Open, _)) => {
                let mut items = Vec::new();
                loop {
                    match self.peek() {
                        None => return Err(ParseError::UnexpectedEof),
                        Some((Token::Close, _)) => {
                            self.pos += 1;
                            return Ok(Value::List(items));
                        }
                        Some(_) => items.push(self.read_expr()?),
                    }
                }
            }
        }
    }
}

/// Parse a source string into a sequence of top-level expressions.
pub fn parse(source: &str) -> Result<Vec<Value>, ParseError> {
    let mut reader = Reader {
        tokens: tokenize(source)?,
        pos: 0,
    };
    let mut forms = Vec::new();
    while reader.peek().is_some() {
        forms.push(reader.read_expr()?);
    }
    Ok(forms)
}

/// Parse exactly one expression; trailing input is an error.
pub fn parse_one(source: &str) -> Result<Value, ParseError> {
    let mut reader = Reader {
        tokens: tokenize(source)?,
        pos: 0,
    };
    let expr = reader.read_expr()?;
    if let Some((token, _)) = reader.peek() {
        return Err(ParseError::TrailingInput(format!("{:?}", token)));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_atoms() {
        assert_eq!(parse_one("42").unwrap(), Value::Int(42));
        assert_eq!(parse_one("-7").unwrap(), Value::Int(-7));
        assert_eq!(parse_one("3.5").unwrap(), Value::Float(3.5));
        assert_eq!(parse_one("true").unwrap(), Value::Bool(true));
        assert_eq!(parse_one("nil").unwrap(), Value::nil());
        assert_eq!(parse_one("foo").unwrap(), Value::Symbol("foo".into()));
        assert_eq!(
            parse_one("system:run_script").unwrap(),
            Value::Symbol("system:run_script".into())
        );
    }

    #[test]
    fn parses_strings_with_escapes() {
        assert_eq!(
            parse_one(r#""he said \"hi\"\n""#).unwrap(),
            Value::Str("he said \"hi\"\n".into())
        );
    }

    #[test]
    fn parses_nested_lists() {
        let parsed = parse_one("(let ((n 10)) (+ n 5))").unwrap();
        let items = parsed.as_list().unwrap();
        assert_eq!(items[0], Value::Symbol("let".into()));
        assert_eq!(items.len(), 3);
    }

    #[test]
    fn quote_sugar_expands() {
        assert_eq!(
            parse_one("'x").unwrap(),
            Value::List(vec![Value::Symbol("quote".into()), Value::Symbol("x".into())])
        );
    }

    #[test]
    fn comments_are_skipped() {
        let forms = parse("; a comment\n(+ 1 2) ; trailing\n").unwrap();
        assert_eq!(forms.len(), 1);
    }

    #[test]
    fn errors_on_unbalanced_input() {
        assert_eq!(parse_one("(+ 1 2").unwrap_err(), ParseError::UnexpectedEof);
        assert!(matches!(
            parse_one(")").unwrap_err(),
            ParseError::UnexpectedClose(_)
        ));
        assert!(matches!(
            parse_one(r#""abc"#).unwrap_err(),
            ParseError::UnterminatedString(_)
        ));
    }

    #[test]
    fn errors_on_trailing_input() {
        assert!(matches!(
            parse_one("(+ 1 2) extra").unwrap_err(),
            ParseError::TrailingInput(_)
        ));
    }

    #[test]
    fn parses_multiple_top_level_forms() {
        let forms = parse("(bind x 1) (+ x 2)").unwrap();
        assert_eq!(forms.len(), 2);
    }
}
