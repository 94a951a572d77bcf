//! Token stream for DDL dumps.
//!
//! Only what `CREATE TABLE`, `ALTER TABLE ... ADD` and `CREATE FUNCTION`
//! headers need survives: words, quoted names, literals and the handful of
//! punctuation marks those statements use. Everything else is dropped, so
//! operators and casts in defaults or function bodies never reach the
//! parser.

/// Words with a meaning in the statements the loader reads. Quoted names
/// are never keywords.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kw {
    Add,
    Alter,
    Check,
    Constraint,
    Create,
    Default,
    Delete,
    Exists,
    Foreign,
    Fulltext,
    Function,
    If,
    Index,
    Key,
    Not,
    Null,
    On,
    Only,
    Or,
    Primary,
    References,
    Replace,
    Returns,
    Table,
    Unique,
    Update,
}

const KEYWORDS: &[(&str, Kw)] = &[
    ("add", Kw::Add),
    ("alter", Kw::Alter),
    ("check", Kw::Check),
    ("constraint", Kw::Constraint),
    ("create", Kw::Create),
    ("default", Kw::Default),
    ("delete", Kw::Delete),
    ("exists", Kw::Exists),
    ("foreign", Kw::Foreign),
    ("fulltext", Kw::Fulltext),
    ("function", Kw::Function),
    ("if", Kw::If),
    ("index", Kw::Index),
    ("key", Kw::Key),
    ("not", Kw::Not),
    ("null", Kw::Null),
    ("on", Kw::On),
    ("only", Kw::Only),
    ("or", Kw::Or),
    ("primary", Kw::Primary),
    ("references", Kw::References),
    ("replace", Kw::Replace),
    ("returns", Kw::Returns),
    ("table", Kw::Table),
    ("unique", Kw::Unique),
    ("update", Kw::Update),
];

impl Kw {
    fn lookup(word: &str) -> Option<Kw> {
        KEYWORDS
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(word))
            .map(|&(_, kw)| kw)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Kw(Kw),
    /// Bare or quoted name, or any word that is not a keyword
    Ident(String),
    /// `'...'` or a dollar quoted body
    Str(String),
    Num(String),
    LParen,
    RParen,
    Comma,
    Semicolon,
    Dot,
    /// `[]` or `[n]` after a type name
    ArrayMark,
    Eof,
}

/// Split a dump into tokens. The result always ends with `Token::Eof`.
pub fn tokenize(src: &str) -> Vec<Token> {
    let mut s = Scanner { src, pos: 0 };
    let mut out = Vec::new();
    while let Some(t) = s.next() {
        out.push(t);
    }
    out.push(Token::Eof);
    out
}

struct Scanner<'a> {
    src: &'a str,
    pos: usize,
}

impl Scanner<'_> {
    fn rest(&self) -> &str {
        &self.src[self.pos..]
    }

    fn first(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn second(&self) -> Option<char> {
        self.rest().chars().nth(1)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.first()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    /// Consume while `f` holds and return the consumed text.
    fn take_while(&mut self, f: impl Fn(char) -> bool) -> &str {
        let start = self.pos;
        while self.first().is_some_and(&f) {
            self.bump();
        }
        &self.src[start..self.pos]
    }

    /// Skip to just past `end`, or to the end of input.
    fn skip_past(&mut self, end: &str) {
        match self.rest().find(end) {
            Some(i) => self.pos += i + end.len(),
            None => self.pos = self.src.len(),
        }
    }

    fn next(&mut self) -> Option<Token> {
        loop {
            self.take_while(char::is_whitespace);
            let rest = self.rest();
            if rest.starts_with("--") || rest.starts_with('#') {
                self.skip_past("\n");
                continue;
            }
            if rest.starts_with("/*") {
                self.skip_past("*/");
                continue;
            }

            let c = self.first()?;
            let tok = match c {
                '(' => Token::LParen,
                ')' => Token::RParen,
                ',' => Token::Comma,
                ';' => Token::Semicolon,
                '.' => Token::Dot,
                '[' => {
                    self.skip_past("]");
                    return Some(Token::ArrayMark);
                }
                '"' | '`' => return Some(Token::Ident(self.quoted(c, false))),
                '\'' => return Some(Token::Str(self.quoted(c, true))),
                '$' => match self.dollar_body() {
                    Some(body) => return Some(Token::Str(body)),
                    None => {
                        self.bump();
                        continue;
                    }
                },
                '-' if self.second().is_some_and(|d| d.is_ascii_digit()) => {
                    return Some(Token::Num(self.number()));
                }
                c if c.is_ascii_digit() => return Some(Token::Num(self.number())),
                c if c.is_alphabetic() || c == '_' => {
                    let w = self.take_while(|c| c.is_alphanumeric() || c == '_' || c == '$');
                    return Some(match Kw::lookup(w) {
                        Some(kw) => Token::Kw(kw),
                        None => Token::Ident(w.to_string()),
                    });
                }
                // operators, casts and anything else the loader ignores
                _ => {
                    self.bump();
                    continue;
                }
            };
            self.bump();
            return Some(tok);
        }
    }

    /// Body of a quoted name or string. A doubled quote stands for itself;
    /// string literals also take backslash escapes.
    fn quoted(&mut self, q: char, escapes: bool) -> String {
        self.bump();
        let mut out = String::new();
        while let Some(c) = self.bump() {
            match c {
                c if c == q && self.first() == Some(q) => {
                    out.push(q);
                    self.bump();
                }
                c if c == q => break,
                '\\' if escapes => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some(e) => out.push(e),
                    None => break,
                },
                c => out.push(c),
            }
        }
        out
    }

    /// `$$...$$` or `$tag$...$tag$`. `None` when the `$` opens no tag,
    /// as in `$1`.
    fn dollar_body(&mut self) -> Option<String> {
        let tag_len = self.rest()[1..]
            .find(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|&i| self.rest()[1 + i..].starts_with('$'))?
            + 2;
        if self.rest()[1..].starts_with(|c: char| c.is_ascii_digit()) {
            return None;
        }
        let tag = self.rest()[..tag_len].to_string();
        self.pos += tag_len;
        let body = match self.rest().find(&tag) {
            Some(i) => {
                let body = self.rest()[..i].to_string();
                self.pos += i + tag.len();
                body
            }
            None => {
                let body = self.rest().to_string();
                self.pos = self.src.len();
                body
            }
        };
        Some(body)
    }

    fn number(&mut self) -> String {
        let start = self.pos;
        if self.first() == Some('-') {
            self.bump();
        }
        self.take_while(|c| c.is_ascii_digit());
        if self.first() == Some('.') {
            self.bump();
            self.take_while(|c| c.is_ascii_digit());
        }
        self.src[start..self.pos].to_string()
    }
}
