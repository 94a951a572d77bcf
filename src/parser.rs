use std::collections::HashMap;

use crate::ast::*;
use crate::lexer::{LexError, Lexer, Token};

pub const MAX_FIELDS: usize = 1200;
pub const MAX_ARGS: usize = 25;
const MAX_VALUE_DEPTH: usize = 50;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("lex error: {0}")]
    Lex(#[from] LexError),
    #[error("unexpected {0}, expecting {1}")]
    Unexpected(String, &'static str),
    #[error("no operation found")]
    NoOperation,
    #[error("only one operation allowed per document")]
    MultipleOperations,
    #[error("fragment not found: {0}")]
    FragmentNotFound(String),
    #[error("fragment cycle detected at: {0}")]
    FragmentCycle(String),
    #[error("duplicate fragment: {0}")]
    DuplicateFragment(String),
    #[error("max number of fields ({0}) exceeded")]
    TooManyFields(usize),
    #[error("max number of arguments ({0}) exceeded")]
    TooManyArgs(usize),
    #[error("max value nesting depth ({0}) exceeded")]
    TooDeep(usize),
    #[error("invalid number: {0}")]
    InvalidNumber(String),
}

/// Parse a GraphQL document holding exactly one operation and any number
/// of named fragments.
pub fn parse(query: &str) -> Result<Operation, ParseError> {
    let mut parser = Parser::new(query)?;
    parser.parse_document()
}

/// Parse a standalone GraphQL value such as a role filter
/// `{ user_id: { eq: $user_id } }`.
pub fn parse_value(text: &str) -> Result<Node, ParseError> {
    let mut parser = Parser::new(text)?;
    let node = parser.parse_value(0)?;
    match parser.peek() {
        Token::Eof => Ok(node),
        tok => Err(ParseError::Unexpected(tok.describe(), "end of value")),
    }
}

struct FragmentDef {
    type_cond: String,
    body: usize,
}

/// One open selection set while walking the field tree.
struct Frame {
    parent: Option<usize>,
    type_cond: Option<String>,
    /// Token position to resume at once a fragment body is closed
    resume: Option<usize>,
    fragment: Option<String>,
}

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    fragments: HashMap<String, FragmentDef>,
    fields: Vec<Field>,
    roots: Vec<usize>,
}

impl Parser {
    pub fn new(input: &str) -> Result<Self, ParseError> {
        let tokens = Lexer::new(input).tokenize()?;
        Ok(Self {
            tokens,
            pos: 0,
            fragments: HashMap::new(),
            fields: Vec::new(),
            roots: Vec::new(),
        })
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> &Token {
        let tok = self.tokens.get(self.pos).unwrap_or(&Token::Eof);
        self.pos += 1;
        tok
    }

    fn expect(&mut self, expected: Token, what: &'static str) -> Result<(), ParseError> {
        let tok = self.advance().clone();
        if tok == expected {
            Ok(())
        } else {
            Err(ParseError::Unexpected(tok.describe(), what))
        }
    }

    fn expect_name(&mut self, what: &'static str) -> Result<String, ParseError> {
        match self.advance().clone() {
            Token::Name(s) => Ok(s),
            tok => Err(ParseError::Unexpected(tok.describe(), what)),
        }
    }

    fn check_name(&self, name: &str) -> bool {
        matches!(self.peek(), Token::Name(s) if s == name)
    }

    fn parse_document(&mut self) -> Result<Operation, ParseError> {
        let op_start = self.scan_definitions()?;
        self.pos = op_start;

        let typ = match self.peek().clone() {
            Token::LBrace => OpType::Query,
            Token::Name(kind) => {
                self.advance();
                match kind.as_str() {
                    "query" => OpType::Query,
                    "mutation" => OpType::Mutation,
                    "subscription" => OpType::Subscription,
                    _ => {
                        return Err(ParseError::Unexpected(
                            format!("name '{}'", kind),
                            "query, mutation or subscription",
                        ));
                    }
                }
            }
            tok => return Err(ParseError::Unexpected(tok.describe(), "operation")),
        };

        let mut name = String::new();
        if let Token::Name(n) = self.peek().clone() {
            self.advance();
            name = n;
        }

        let var_defs = if *self.peek() == Token::LParen {
            self.parse_var_defs()?
        } else {
            Vec::new()
        };

        let directives = self.parse_directives()?;
        self.parse_selections()?;

        Ok(Operation {
            typ,
            name,
            var_defs,
            directives,
            fields: std::mem::take(&mut self.fields),
            roots: std::mem::take(&mut self.roots),
        })
    }

    /// First pass over the top level: record fragment bodies and find the
    /// single operation so spreads can refer to fragments defined later.
    fn scan_definitions(&mut self) -> Result<usize, ParseError> {
        let mut op_start = None;

        while *self.peek() != Token::Eof {
            if self.check_name("fragment") {
                self.advance();
                let name = self.expect_name("fragment name")?;
                if !self.check_name("on") {
                    return Err(ParseError::Unexpected(self.peek().describe(), "on"));
                }
                self.advance();
                let type_cond = self.expect_name("type condition")?;
                self.parse_directives()?;
                if *self.peek() != Token::LBrace {
                    return Err(ParseError::Unexpected(self.peek().describe(), "{"));
                }
                let body = self.pos;
                self.skip_braces()?;
                if self
                    .fragments
                    .insert(name.clone(), FragmentDef { type_cond, body })
                    .is_some()
                {
                    return Err(ParseError::DuplicateFragment(name));
                }
                continue;
            }

            if op_start.is_some() {
                return Err(ParseError::MultipleOperations);
            }
            op_start = Some(self.pos);

            // skip operation header up to the selection set
            let mut depth = 0usize;
            loop {
                match self.peek() {
                    Token::LParen => depth += 1,
                    Token::RParen => depth = depth.saturating_sub(1),
                    Token::LBrace if depth == 0 => break,
                    Token::Eof => {
                        return Err(ParseError::Unexpected(
                            Token::Eof.describe(),
                            "selection set",
                        ));
                    }
                    _ => {}
                }
                self.advance();
            }
            self.skip_braces()?;
        }

        op_start.ok_or(ParseError::NoOperation)
    }

    fn skip_braces(&mut self) -> Result<(), ParseError> {
        let mut depth = 0usize;
        loop {
            match self.advance() {
                Token::LBrace => depth += 1,
                Token::RBrace => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(());
                    }
                }
                Token::Eof => {
                    return Err(ParseError::Unexpected(Token::Eof.describe(), "}"));
                }
                _ => {}
            }
        }
    }

    fn parse_var_defs(&mut self) -> Result<Vec<VarDef>, ParseError> {
        self.expect(Token::LParen, "(")?;
        let mut defs = Vec::new();

        while *self.peek() != Token::RParen {
            let name = match self.advance().clone() {
                Token::Var(v) => v,
                tok => return Err(ParseError::Unexpected(tok.describe(), "variable")),
            };
            self.expect(Token::Colon, ":")?;
            let typ = self.parse_type()?;
            let required = typ.ends_with('!');

            let default = if *self.peek() == Token::Eq {
                self.advance();
                Some(self.parse_value(0)?)
            } else {
                None
            };
            self.parse_directives()?;

            defs.push(VarDef {
                name,
                typ,
                required,
                default,
            });
        }
        self.advance();
        Ok(defs)
    }

    fn parse_type(&mut self) -> Result<String, ParseError> {
        let mut typ = String::new();
        let mut open = 0usize;

        while *self.peek() == Token::LBracket {
            self.advance();
            typ.push('[');
            open += 1;
        }
        typ.push_str(&self.expect_name("type name")?);
        if *self.peek() == Token::Bang {
            self.advance();
            typ.push('!');
        }
        while open > 0 {
            self.expect(Token::RBracket, "]")?;
            typ.push(']');
            if *self.peek() == Token::Bang {
                self.advance();
                typ.push('!');
            }
            open -= 1;
        }
        Ok(typ)
    }

    fn parse_directives(&mut self) -> Result<Vec<Directive>, ParseError> {
        let mut dirs = Vec::new();
        while *self.peek() == Token::At {
            self.advance();
            let name = self.expect_name("directive name")?;
            let args = if *self.peek() == Token::LParen {
                self.parse_args()?
            } else {
                Vec::new()
            };
            dirs.push(Directive { name, args });
        }
        Ok(dirs)
    }

    fn parse_args(&mut self) -> Result<Vec<Arg>, ParseError> {
        self.expect(Token::LParen, "(")?;
        let mut args = Vec::new();

        while *self.peek() != Token::RParen {
            let name = self.expect_name("argument name")?;
            self.expect(Token::Colon, ":")?;
            let val = self.parse_value(0)?;
            args.push(Arg { name, val });

            if args.len() > MAX_ARGS {
                return Err(ParseError::TooManyArgs(MAX_ARGS));
            }
        }
        self.advance();
        Ok(args)
    }

    fn parse_value(&mut self, depth: usize) -> Result<Node, ParseError> {
        if depth > MAX_VALUE_DEPTH {
            return Err(ParseError::TooDeep(MAX_VALUE_DEPTH));
        }

        let node = match self.advance().clone() {
            Token::Var(v) => Node::Var(v),
            Token::Str(s) => Node::Str(s),
            Token::Int(n) => match n.parse::<i64>() {
                Ok(v) => Node::Int(v),
                Err(_) => return Err(ParseError::InvalidNumber(n)),
            },
            Token::Float(n) => match n.parse::<f64>() {
                Ok(v) if v.is_finite() => Node::Float(v),
                _ => return Err(ParseError::InvalidNumber(n)),
            },
            Token::Name(n) => match n.as_str() {
                "true" => Node::Bool(true),
                "false" => Node::Bool(false),
                "null" => Node::Null,
                _ => Node::Label(n),
            },
            Token::LBracket => {
                let mut items = Vec::new();
                while *self.peek() != Token::RBracket {
                    if *self.peek() == Token::Eof {
                        return Err(ParseError::Unexpected(Token::Eof.describe(), "]"));
                    }
                    items.push(self.parse_value(depth + 1)?);
                }
                self.advance();
                Node::List(items)
            }
            Token::LBrace => {
                let mut items = Vec::new();
                while *self.peek() != Token::RBrace {
                    let key = self.expect_name("object key")?;
                    self.expect(Token::Colon, ":")?;
                    items.push((key, self.parse_value(depth + 1)?));
                }
                self.advance();
                Node::Obj(items)
            }
            tok => return Err(ParseError::Unexpected(tok.describe(), "value")),
        };
        Ok(node)
    }

    /// Walk the selection sets with an explicit stack of open frames so
    /// deeply nested documents cannot exhaust the call stack.
    fn parse_selections(&mut self) -> Result<(), ParseError> {
        self.expect(Token::LBrace, "{")?;
        let mut stack = vec![Frame {
            parent: None,
            type_cond: None,
            resume: None,
            fragment: None,
        }];

        while let Some(frame) = stack.last() {
            match self.peek().clone() {
                Token::RBrace => {
                    self.advance();
                    if let Some(resume) = frame.resume {
                        self.pos = resume;
                    }
                    stack.pop();
                }

                Token::Spread => {
                    self.advance();
                    let parent = frame.parent;

                    if self.check_name("on") {
                        self.advance();
                        let cond = self.expect_name("type condition")?;
                        self.parse_directives()?;
                        self.expect(Token::LBrace, "{")?;
                        stack.push(Frame {
                            parent,
                            type_cond: Some(cond),
                            resume: None,
                            fragment: None,
                        });
                    } else if matches!(self.peek(), Token::LBrace | Token::At) {
                        self.parse_directives()?;
                        self.expect(Token::LBrace, "{")?;
                        let type_cond = frame.type_cond.clone();
                        stack.push(Frame {
                            parent,
                            type_cond,
                            resume: None,
                            fragment: None,
                        });
                    } else {
                        let name = self.expect_name("fragment name")?;
                        self.parse_directives()?;

                        if stack
                            .iter()
                            .any(|f| f.fragment.as_deref() == Some(name.as_str()))
                        {
                            return Err(ParseError::FragmentCycle(name));
                        }
                        let (type_cond, body) = match self.fragments.get(&name) {
                            Some(fd) => (fd.type_cond.clone(), fd.body),
                            None => return Err(ParseError::FragmentNotFound(name)),
                        };

                        stack.push(Frame {
                            parent,
                            type_cond: Some(type_cond),
                            resume: Some(self.pos),
                            fragment: Some(name),
                        });
                        self.pos = body + 1;
                    }
                }

                Token::Name(_) => {
                    let parent = frame.parent;
                    let type_cond = frame.type_cond.clone();
                    let id = self.parse_field(parent, type_cond)?;

                    if *self.peek() == Token::LBrace {
                        self.advance();
                        stack.push(Frame {
                            parent: Some(id),
                            type_cond: None,
                            resume: None,
                            fragment: None,
                        });
                    }
                }

                tok => return Err(ParseError::Unexpected(tok.describe(), "field or '}'")),
            }
        }

        Ok(())
    }

    fn parse_field(
        &mut self,
        parent: Option<usize>,
        type_cond: Option<String>,
    ) -> Result<usize, ParseError> {
        let first = self.expect_name("field name")?;
        let (alias, name) = if *self.peek() == Token::Colon {
            self.advance();
            (Some(first), self.expect_name("field name")?)
        } else {
            (None, first)
        };

        let args = if *self.peek() == Token::LParen {
            self.parse_args()?
        } else {
            Vec::new()
        };
        let directives = self.parse_directives()?;

        let id = self.fields.len();
        if id >= MAX_FIELDS {
            return Err(ParseError::TooManyFields(MAX_FIELDS));
        }

        self.fields.push(Field {
            id,
            parent_id: parent,
            name,
            alias,
            args,
            directives,
            children: Vec::new(),
            type_cond,
        });

        match parent {
            Some(pid) => self.fields[pid].children.push(id),
            None => self.roots.push(id),
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_query() {
        let op = parse("{ products(limit: 3) { id owner { id full_name } } }").unwrap();
        assert_eq!(op.typ, OpType::Query);
        assert_eq!(op.roots, vec![0]);
        assert_eq!(op.fields.len(), 5);

        let products = &op.fields[0];
        assert_eq!(products.name, "products");
        assert_eq!(products.args[0].name, "limit");
        assert_eq!(products.args[0].val, Node::Int(3));
        assert_eq!(products.children, vec![1, 2]);

        let owner = &op.fields[2];
        assert_eq!(owner.parent_id, Some(0));
        assert_eq!(owner.children, vec![3, 4]);
    }

    #[test]
    fn test_parse_named_mutation() {
        let op = parse(
            r#"mutation createUser($data: UserInput!, $n: Int = 5) @constraint(variable: "data", required: true) {
                user: users(insert: $data) { id email }
            }"#,
        )
        .unwrap();
        assert_eq!(op.typ, OpType::Mutation);
        assert_eq!(op.name, "createUser");
        assert_eq!(op.var_defs.len(), 2);
        assert_eq!(op.var_defs[0].typ, "UserInput!");
        assert!(op.var_defs[0].required);
        assert_eq!(op.var_defs[1].default, Some(Node::Int(5)));
        assert_eq!(op.directives[0].name, "constraint");

        let f = &op.fields[0];
        assert_eq!(f.key(), "user");
        assert_eq!(f.name, "users");
        assert_eq!(f.args[0].val, Node::Var("data".into()));
    }

    #[test]
    fn test_parse_values() {
        let node = parse_value(
            r#"{ and: [{ price: { gt: 10.5 } }, { name: { in: ["a", "b"] } }], not: { id: { is_null: true } }, o: desc }"#,
        )
        .unwrap();
        let and = node.get("and").unwrap();
        match and {
            Node::List(items) => {
                assert_eq!(items.len(), 2);
                assert_eq!(
                    items[0].get("price").unwrap().get("gt"),
                    Some(&Node::Float(10.5))
                );
            }
            other => panic!("expected list, got {:?}", other),
        }
        assert_eq!(node.get("o"), Some(&Node::Label("desc".into())));
    }

    #[test]
    fn test_fragments_expand_in_place() {
        let op = parse(
            r#"
            query { users { ...UserFields products { id } } }
            fragment UserFields on users { id email }
        "#,
        )
        .unwrap();
        let users = &op.fields[0];
        let names: Vec<&str> = users
            .children
            .iter()
            .map(|&id| op.fields[id].name.as_str())
            .collect();
        assert_eq!(names, vec!["id", "email", "products"]);
        assert_eq!(op.fields[1].type_cond.as_deref(), Some("users"));
    }

    #[test]
    fn test_inline_fragments_carry_type() {
        let op = parse(
            "{ notifications { id subject { ... on users { email } ... on products { name } } } }",
        )
        .unwrap();
        let subject = &op.fields[2];
        assert_eq!(subject.children.len(), 2);
        assert_eq!(op.fields[3].type_cond.as_deref(), Some("users"));
        assert_eq!(op.fields[4].type_cond.as_deref(), Some("products"));
    }

    #[test]
    fn test_fragment_cycle() {
        let err = parse(
            "query { users { ...A } } fragment A on users { id ...B } fragment B on users { ...A }",
        )
        .unwrap_err();
        assert_eq!(err, ParseError::FragmentCycle("A".into()));
    }

    #[test]
    fn test_missing_fragment() {
        let err = parse("{ users { ...Nope } }").unwrap_err();
        assert_eq!(err, ParseError::FragmentNotFound("Nope".into()));
    }

    #[test]
    fn test_multiple_operations() {
        let err = parse("query a { users { id } } query b { users { id } }").unwrap_err();
        assert_eq!(err, ParseError::MultipleOperations);
    }

    #[test]
    fn test_too_many_args() {
        let args: Vec<String> = (0..30).map(|i| format!("a{}: {}", i, i)).collect();
        let q = format!("{{ users({}) {{ id }} }}", args.join(" "));
        assert_eq!(parse(&q).unwrap_err(), ParseError::TooManyArgs(MAX_ARGS));
    }

    #[test]
    fn test_too_many_fields() {
        let fields: Vec<String> = (0..MAX_FIELDS + 1).map(|i| format!("f{}", i)).collect();
        let q = format!("{{ users {{ {} }} }}", fields.join(" "));
        assert_eq!(parse(&q).unwrap_err(), ParseError::TooManyFields(MAX_FIELDS));
    }

    #[test]
    fn test_deep_nesting_does_not_overflow() {
        let depth = 1000;
        let q = format!("{}{}", "{ a ".repeat(depth), "}".repeat(depth));
        let op = parse(&q).unwrap();
        assert_eq!(op.fields.len(), depth);
        assert_eq!(op.fields[depth - 1].parent_id, Some(depth - 2));

        let deep_value = format!("{{ a(w: {}1{}) }}", "[".repeat(200), "]".repeat(200));
        assert_eq!(
            parse(&deep_value).unwrap_err(),
            ParseError::TooDeep(MAX_VALUE_DEPTH)
        );
    }

    #[test]
    fn test_malformed_input_is_an_error() {
        for q in [
            "",
            "{",
            "}",
            "{ a(",
            "{ a(b: ) }",
            "{ a { b }",
            "query ($x) { a }",
            "{ ...on }",
            "{ a: }",
            "fragment F on { a }",
            "{ a(b: {c}) }",
            "{ a @ }",
            "mutation",
        ] {
            assert!(parse(q).is_err(), "expected error for {:?}", q);
        }
    }
}
