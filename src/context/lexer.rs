//! Tokenizer for script source

use super::EvalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::FloorDiv => "//",
            Self::Mod => "%",
            Self::Pow => "**",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Name(String),
    Op(BinOp),
    /// `+=`, `-=`, `*=`
    AugAssign(BinOp),
    Assign,
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
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    /// Statement separator: newline or `;`
    Separator,
    Eof,
}

impl Token {
    pub fn describe(&self) -> String {
        match self {
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Str(s) => format!("{s:?}"),
            Self::Name(n) => n.clone(),
            Self::Op(op) => op.symbol().to_string(),
            Self::AugAssign(op) => format!("{}=", op.symbol()),
            Self::Assign => "=".into(),
            Self::Eq => "==".into(),
            Self::Ne => "!=".into(),
            Self::Lt => "<".into(),
            Self::Le => "<=".into(),
            Self::Gt => ">".into(),
            Self::Ge => ">=".into(),
            Self::LParen => "(".into(),
            Self::RParen => ")".into(),
            Self::LBracket => "[".into(),
            Self::RBracket => "]".into(),
            Self::LBrace => "{".into(),
            Self::RBrace => "}".into(),
            Self::Comma => ",".into(),
            Self::Colon => ":".into(),
            Self::Dot => ".".into(),
            Self::Separator => "end of statement".into(),
            Self::Eof => "end of input".into(),
        }
    }
}

/// Split source into tokens
///
/// Newlines inside brackets do not end a statement.
pub fn tokenize(source: &str) -> Result<Vec<Token>, EvalError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut depth = 0usize;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' | ';' => {
                if depth == 0 || c == ';' {
                    tokens.push(Token::Separator);
                }
                i += 1;
            }
            c if c.is_whitespace() => i += 1,
            '\\' if chars.get(i + 1) == Some(&'\n') => i += 2,
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '0'..='9' => {
                let (token, next) = number(&chars, i)?;
                tokens.push(token);
                i = next;
            }
            '.' if chars.get(i + 1).is_some_and(char::is_ascii_digit) => {
                let (token, next) = number(&chars, i)?;
                tokens.push(token);
                i = next;
            }
            '\'' | '"' => {
                let (text, next) = string(&chars, i)?;
                tokens.push(Token::Str(text));
                i = next;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Name(chars[start..i].iter().collect()));
            }
            _ => {
                let next = chars.get(i + 1).copied();
                let (token, width) = match (c, next) {
                    ('*', Some('*')) => (Token::Op(BinOp::Pow), 2),
                    ('/', Some('/')) => (Token::Op(BinOp::FloorDiv), 2),
                    ('+', Some('=')) => (Token::AugAssign(BinOp::Add), 2),
                    ('-', Some('=')) => (Token::AugAssign(BinOp::Sub), 2),
                    ('*', Some('=')) => (Token::AugAssign(BinOp::Mul), 2),
                    ('=', Some('=')) => (Token::Eq, 2),
                    ('!', Some('=')) => (Token::Ne, 2),
                    ('<', Some('=')) => (Token::Le, 2),
                    ('>', Some('=')) => (Token::Ge, 2),
                    ('+', _) => (Token::Op(BinOp::Add), 1),
                    ('-', _) => (Token::Op(BinOp::Sub), 1),
                    ('*', _) => (Token::Op(BinOp::Mul), 1),
                    ('/', _) => (Token::Op(BinOp::Div), 1),
                    ('%', _) => (Token::Op(BinOp::Mod), 1),
                    ('=', _) => (Token::Assign, 1),
                    ('<', _) => (Token::Lt, 1),
                    ('>', _) => (Token::Gt, 1),
                    ('(', _) => (Token::LParen, 1),
                    (')', _) => (Token::RParen, 1),
                    ('[', _) => (Token::LBracket, 1),
                    (']', _) => (Token::RBracket, 1),
                    ('{', _) => (Token::LBrace, 1),
                    ('}', _) => (Token::RBrace, 1),
                    (',', _) => (Token::Comma, 1),
                    (':', _) => (Token::Colon, 1),
                    ('.', _) => (Token::Dot, 1),
                    _ => {
                        return Err(EvalError::Syntax(format!("invalid character {c:?}")));
                    }
                };
                match token {
                    Token::LParen | Token::LBracket | Token::LBrace => depth += 1,
                    Token::RParen | Token::RBracket | Token::RBrace => {
                        depth = depth.saturating_sub(1)
                    }
                    _ => {}
                }
                tokens.push(token);
                i += width;
            }
        }
    }
    tokens.push(Token::Eof);
    Ok(tokens)
}

fn number(chars: &[char], start: usize) -> Result<(Token, usize), EvalError> {
    let mut i = start;
    let mut is_float = false;
    while i < chars.len() {
        match chars[i] {
            '0'..='9' | '_' => i += 1,
            '.' if !is_float => {
                is_float = true;
                i += 1;
            }
            'e' | 'E' => {
                is_float = true;
                i += 1;
                if matches!(chars.get(i), Some('+') | Some('-')) {
                    i += 1;
                }
            }
            _ => break,
        }
    }
    let text: String = chars[start..i].iter().filter(|c| **c != '_').collect();
    let token = if is_float {
        text.parse::<f64>().map(Token::Float).ok()
    } else {
        text.parse::<i64>().map(Token::Int).ok()
    };
    match token {
        Some(token) => Ok((token, i)),
        None if !is_float => Err(EvalError::Overflow(format!(
            "integer literal {text} is too large"
        ))),
        None => Err(EvalError::Syntax(format!("invalid number literal {text}"))),
    }
}

fn string(chars: &[char], start: usize) -> Result<(String, usize), EvalError> {
    let quote = chars[start];
    let mut text = String::new();
    let mut i = start + 1;
    loop {
        match chars.get(i) {
            None | Some('\n') => {
                return Err(EvalError::Syntax("unterminated string literal".into()));
            }
            Some(c) if *c == quote => return Ok((text, i + 1)),
            Some('\\') => {
                let escaped = chars
                    .get(i + 1)
                    .ok_or_else(|| EvalError::Syntax("unterminated string literal".into()))?;
                match escaped {
                    'n' => text.push('\n'),
                    't' => text.push('\t'),
                    'r' => text.push('\r'),
                    '0' => text.push('\0'),
                    '\n' => {}
                    c @ ('\\' | '\'' | '"') => text.push(*c),
                    other => {
                        text.push('\\');
                        text.push(*other);
                    }
                }
                i += 2;
            }
            Some(c) => {
                text.push(*c);
                i += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operators_and_literals() {
        let tokens = tokenize("x += 2 ** 3 // 1.5e1").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Name("x".into()),
                Token::AugAssign(BinOp::Add),
                Token::Int(2),
                Token::Op(BinOp::Pow),
                Token::Int(3),
                Token::Op(BinOp::FloorDiv),
                Token::Float(15.0),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_newlines_inside_brackets_are_ignored() {
        let tokens = tokenize("x = [1,\n 2]\ny = 'a\\'b' # note").unwrap();
        let separators = tokens.iter().filter(|t| **t == Token::Separator).count();
        assert_eq!(separators, 1);
        assert!(tokens.contains(&Token::Str("a'b".into())));
    }

    #[test]
    fn test_errors() {
        assert!(matches!(tokenize("'open"), Err(EvalError::Syntax(_))));
        assert!(matches!(tokenize("a $ b"), Err(EvalError::Syntax(_))));
        assert!(matches!(
            tokenize("99999999999999999999"),
            Err(EvalError::Overflow(_))
        ));
    }
}
