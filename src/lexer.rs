use std::iter::Peekable;
use std::str::Chars;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Name(String),
    Str(String),
    Int(String),
    Float(String),
    Var(String), // $name

    LBrace,   // {
    RBrace,   // }
    LParen,   // (
    RParen,   // )
    LBracket, // [
    RBracket, // ]
    Colon,    // :
    Eq,       // =
    At,       // @
    Bang,     // !
    Spread,   // ...

    Eof,
}

impl Token {
    pub fn describe(&self) -> String {
        match self {
            Token::Name(s) => format!("name '{}'", s),
            Token::Str(s) => format!("string \"{}\"", s),
            Token::Int(s) | Token::Float(s) => format!("number {}", s),
            Token::Var(s) => format!("variable ${}", s),
            Token::LBrace => "'{'".into(),
            Token::RBrace => "'}'".into(),
            Token::LParen => "'('".into(),
            Token::RParen => "')'".into(),
            Token::LBracket => "'['".into(),
            Token::RBracket => "']'".into(),
            Token::Colon => "':'".into(),
            Token::Eq => "'='".into(),
            Token::At => "'@'".into(),
            Token::Bang => "'!'".into(),
            Token::Spread => "'...'".into(),
            Token::Eof => "end of input".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LexError {
    #[error("unexpected character '{0}' on line {1}")]
    UnexpectedChar(char, usize),
    #[error("unterminated string on line {0}")]
    UnterminatedString(usize),
    #[error("unterminated comment on line {0}")]
    UnterminatedComment(usize),
    #[error("invalid number '{0}' on line {1}")]
    InvalidNumber(String, usize),
    #[error("variable name expected after '$' on line {0}")]
    EmptyVariable(usize),
}

/// Single pass GraphQL tokenizer. Commas are insignificant and skipped
/// along with whitespace, `#` line comments and `/* */` block comments.
pub struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
    line: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
            line: 1,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next();
        if c == Some('\n') {
            self.line += 1;
        }
        c
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), LexError> {
        loop {
            match self.chars.peek() {
                Some(c) if c.is_whitespace() || *c == ',' || *c == '\u{feff}' => {
                    self.bump();
                }
                Some('#') => {
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                Some('/') => {
                    let start = self.line;
                    self.bump();
                    if self.chars.peek() != Some(&'*') {
                        return Err(LexError::UnexpectedChar('/', start));
                    }
                    self.bump();
                    let mut star = false;
                    loop {
                        match self.bump() {
                            Some('/') if star => break,
                            Some(c) => star = c == '*',
                            None => return Err(LexError::UnterminatedComment(start)),
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn read_name(&mut self, first: char) -> String {
        let mut s = String::from(first);
        while let Some(&c) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                s.push(c);
                self.bump();
            } else {
                break;
            }
        }
        s
    }

    fn read_string(&mut self) -> Result<String, LexError> {
        let start = self.line;

        // """block strings"""
        if self.chars.peek() == Some(&'"') {
            self.bump();
            if self.chars.peek() != Some(&'"') {
                return Ok(String::new());
            }
            self.bump();
            return self.read_block_string(start);
        }

        let mut s = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(s),
                Some('\\') => match self.bump() {
                    Some('n') => s.push('\n'),
                    Some('t') => s.push('\t'),
                    Some('r') => s.push('\r'),
                    Some('b') => s.push('\u{8}'),
                    Some('f') => s.push('\u{c}'),
                    Some('u') => {
                        let mut hex = String::new();
                        for _ in 0..4 {
                            match self.bump() {
                                Some(h) => hex.push(h),
                                None => return Err(LexError::UnterminatedString(start)),
                            }
                        }
                        match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                            Some(c) => s.push(c),
                            None => s.push(char::REPLACEMENT_CHARACTER),
                        }
                    }
                    Some(c) => s.push(c),
                    None => return Err(LexError::UnterminatedString(start)),
                },
                Some('\n') => return Err(LexError::UnterminatedString(start)),
                Some(c) => s.push(c),
                None => return Err(LexError::UnterminatedString(start)),
            }
        }
    }

    fn read_block_string(&mut self, start: usize) -> Result<String, LexError> {
        let mut s = String::new();
        let mut quotes = 0;
        loop {
            match self.bump() {
                Some('"') => {
                    quotes += 1;
                    if quotes == 3 {
                        return Ok(s.trim().to_string());
                    }
                }
                Some(c) => {
                    for _ in 0..quotes {
                        s.push('"');
                    }
                    quotes = 0;
                    s.push(c);
                }
                None => return Err(LexError::UnterminatedString(start)),
            }
        }
    }

    fn read_digits(&mut self, s: &mut String) -> usize {
        let mut n = 0;
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() {
                s.push(c);
                self.bump();
                n += 1;
            } else {
                break;
            }
        }
        n
    }

    fn read_number(&mut self, first: char) -> Result<Token, LexError> {
        let mut s = String::from(first);
        let mut float = false;

        let int_digits = if first == '-' {
            self.read_digits(&mut s)
        } else {
            1 + self.read_digits(&mut s)
        };
        if int_digits == 0 {
            return Err(LexError::InvalidNumber(s, self.line));
        }

        if self.chars.peek() == Some(&'.') {
            float = true;
            s.push('.');
            self.bump();
            if self.read_digits(&mut s) == 0 {
                return Err(LexError::InvalidNumber(s, self.line));
            }
        }

        if matches!(self.chars.peek(), Some('e') | Some('E')) {
            float = true;
            s.push('e');
            self.bump();
            if let Some(&c) = self.chars.peek() {
                if c == '+' || c == '-' {
                    s.push(c);
                    self.bump();
                }
            }
            if self.read_digits(&mut s) == 0 {
                return Err(LexError::InvalidNumber(s, self.line));
            }
        }

        // 12abc or 1.2.3
        if let Some(&c) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' || c == '.' {
                s.push(c);
                return Err(LexError::InvalidNumber(s, self.line));
            }
        }

        Ok(if float { Token::Float(s) } else { Token::Int(s) })
    }

    pub fn next_token(&mut self) -> Result<Token, LexError> {
        self.skip_whitespace_and_comments()?;

        let c = match self.bump() {
            Some(c) => c,
            None => return Ok(Token::Eof),
        };

        let tok = match c {
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            ':' => Token::Colon,
            '=' => Token::Eq,
            '@' => Token::At,
            '!' => Token::Bang,
            '.' => {
                if self.chars.peek() == Some(&'.') {
                    self.bump();
                    if self.chars.peek() == Some(&'.') {
                        self.bump();
                        Token::Spread
                    } else {
                        return Err(LexError::UnexpectedChar('.', self.line));
                    }
                } else {
                    return Err(LexError::UnexpectedChar('.', self.line));
                }
            }
            '$' => match self.chars.peek() {
                Some(&n) if n.is_alphabetic() || n == '_' => {
                    self.bump();
                    Token::Var(self.read_name(n))
                }
                _ => return Err(LexError::EmptyVariable(self.line)),
            },
            '"' => Token::Str(self.read_string()?),
            c if c.is_ascii_digit() || c == '-' => self.read_number(c)?,
            c if c.is_alphabetic() || c == '_' => Token::Name(self.read_name(c)),
            _ => return Err(LexError::UnexpectedChar(c, self.line)),
        };

        Ok(tok)
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        loop {
            let tok = self.next_token()?;
            if tok == Token::Eof {
                tokens.push(tok);
                break;
            }
            tokens.push(tok);
        }
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_tokens() {
        let tokens = Lexer::new("query { users(id: $id) { id } }")
            .tokenize()
            .unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Name("query".into()),
                Token::LBrace,
                Token::Name("users".into()),
                Token::LParen,
                Token::Name("id".into()),
                Token::Colon,
                Token::Var("id".into()),
                Token::RParen,
                Token::LBrace,
                Token::Name("id".into()),
                Token::RBrace,
                Token::RBrace,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_comments() {
        let input = "# heading\n{ a /* inline */ b # tail\n }";
        let tokens = Lexer::new(input).tokenize().unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::LBrace,
                Token::Name("a".into()),
                Token::Name("b".into()),
                Token::RBrace,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        let tokens = Lexer::new("1 -20 3.5 1e10 -2.5E-3").tokenize().unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Int("1".into()),
                Token::Int("-20".into()),
                Token::Float("3.5".into()),
                Token::Float("1e10".into()),
                Token::Float("-2.5e-3".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_invalid_numbers() {
        assert!(matches!(
            Lexer::new("12abc").tokenize(),
            Err(LexError::InvalidNumber(_, 1))
        ));
        assert!(matches!(
            Lexer::new("1.").tokenize(),
            Err(LexError::InvalidNumber(_, 1))
        ));
        assert!(matches!(
            Lexer::new("-").tokenize(),
            Err(LexError::InvalidNumber(_, 1))
        ));
    }

    #[test]
    fn test_unterminated_string() {
        assert_eq!(
            Lexer::new("{ a(b: \"oops) }").tokenize(),
            Err(LexError::UnterminatedString(1))
        );
        assert_eq!(
            Lexer::new("\n\"\"\"never closed").tokenize(),
            Err(LexError::UnterminatedString(2))
        );
    }

    #[test]
    fn test_strings() {
        let tokens = Lexer::new(r#""a\"b\n" """ block "q" """"#).tokenize().unwrap();
        assert_eq!(tokens[0], Token::Str("a\"b\n".into()));
        assert_eq!(tokens[1], Token::Str("block \"q\"".into()));
    }

    #[test]
    fn test_symbols() {
        let tokens = Lexer::new("... @ ! = [ ] $v").tokenize().unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Spread,
                Token::At,
                Token::Bang,
                Token::Eq,
                Token::LBracket,
                Token::RBracket,
                Token::Var("v".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_unterminated_comment() {
        assert_eq!(
            Lexer::new("{ /* a").tokenize(),
            Err(LexError::UnterminatedComment(1))
        );
    }
}
