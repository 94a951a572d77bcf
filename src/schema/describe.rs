//! GraphQL style schema description.
//!
//! ```text
//! # dbinfo:postgres,150000,public
//!
//! type products {
//!     id: Bigint! @id
//!     owner_id: Bigint @relation(type: users, field: id)
//!     tags: [Text]
//! }
//!
//! function add_five(a: Integer): Integer
//! ```
//!
//! Types are written in PascalCase. When that loses information the
//! original name is kept in `@type(name: "...")`.

use crate::ast::Node;
use crate::lexer::{Lexer, Token};

use super::{
    Blocklist, DBColumn, DBFuncParam, DBFunction, DBInfo, DBTable, FKey, SchemaError, TableType,
};

const HEADER: &str = "# dbinfo:";

/// Serialize a `DBInfo` to the schema description format.
pub fn write_schema(info: &DBInfo) -> String {
    let mut output = String::new();
    output.push_str(&format!(
        "{}{},{},{}\n",
        HEADER, info.typ, info.version, info.schema
    ));

    for t in &info.tables {
        output.push('\n');
        write_table(&mut output, info, t);
    }

    if !info.functions.is_empty() {
        output.push('\n');
    }
    for f in &info.functions {
        write_function(&mut output, info, f);
    }

    output
}

fn write_table(output: &mut String, info: &DBInfo, t: &DBTable) {
    output.push_str("type ");
    output.push_str(&safe_name(&t.name, "_t"));
    if t.typ != TableType::Table {
        output.push_str(&format!(" @{}", t.typ.as_str()));
    }
    if t.schema != info.schema {
        output.push_str(&format!(" @schema(name: {})", quote(&t.schema)));
    }
    if t.blocked {
        output.push_str(" @blocked");
    }
    if !is_name(&t.name) {
        output.push_str(&format!(" @name(value: {})", quote(&t.name)));
    }
    output.push_str(" {\n");

    for c in &t.columns {
        write_column(output, t, c);
    }
    output.push_str("}\n");
}

fn write_column(output: &mut String, t: &DBTable, c: &DBColumn) {
    output.push_str("    ");
    output.push_str(&safe_name(&c.name, &format!("_c{}", c.id)));
    output.push_str(": ");

    let typ = pascal(&c.typ);
    if c.array {
        output.push_str(&format!("[{}]", typ));
    } else {
        output.push_str(&typ);
    }
    if c.not_null {
        output.push('!');
    }

    if c.primary_key {
        output.push_str(" @id");
    }
    if c.unique_key && !c.primary_key {
        output.push_str(" @unique");
    }
    if c.full_text {
        output.push_str(" @search");
    }
    if c.blocked {
        output.push_str(" @blocked");
    }
    if let Some(fk) = &c.fk {
        output.push_str(&format!(
            " @relation(type: {}, field: {}",
            quote(&fk.table),
            quote(&fk.col)
        ));
        if fk.schema != t.schema {
            output.push_str(&format!(", schema: {}", quote(&fk.schema)));
        }
        output.push(')');
    }
    if typ.to_lowercase() != c.typ {
        output.push_str(&format!(" @type(name: {})", quote(&c.typ)));
    }
    if !is_name(&c.name) {
        output.push_str(&format!(" @name(value: {})", quote(&c.name)));
    }
    output.push('\n');
}

fn write_function(output: &mut String, info: &DBInfo, f: &DBFunction) {
    let params: Vec<String> = f
        .inputs
        .iter()
        .map(|p| {
            let typ = pascal(&p.typ);
            let mut s = format!("{}: ", safe_name(&p.name, &format!("_p{}", p.id)));
            if p.array {
                s.push_str(&format!("[{}]", typ));
            } else {
                s.push_str(&typ);
            }
            if typ.to_lowercase() != p.typ {
                s.push_str(&format!(" @type(name: {})", quote(&p.typ)));
            }
            s
        })
        .collect();

    let ret = pascal(&f.typ);
    output.push_str(&format!(
        "function {}({}): {}",
        f.name,
        params.join(", "),
        ret
    ));
    if ret.to_lowercase() != f.typ {
        output.push_str(&format!(" @type(name: {})", quote(&f.typ)));
    }
    if f.agg {
        output.push_str(" @agg");
    }
    if f.schema != info.schema {
        output.push_str(&format!(" @schema(name: {})", quote(&f.schema)));
    }
    output.push('\n');
}

/// `double precision` -> `DoublePrecision`
fn pascal(typ: &str) -> String {
    let mut out = String::with_capacity(typ.len());
    let mut upper = true;
    for c in typ.chars() {
        if c.is_alphanumeric() || c == '_' {
            if upper {
                out.extend(c.to_uppercase());
            } else {
                out.push(c);
            }
            upper = false;
        } else {
            upper = true;
        }
    }
    if !is_name(&out) {
        return "Unknown".to_string();
    }
    out
}

fn is_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn safe_name(name: &str, fallback: &str) -> String {
    if is_name(name) {
        name.to_string()
    } else {
        fallback.to_string()
    }
}

fn quote(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

/// Parse the schema description format back into a `DBInfo`.
pub fn parse_schema(input: &str) -> Result<DBInfo, SchemaError> {
    let header = input
        .lines()
        .find_map(|l| l.trim().strip_prefix(HEADER))
        .ok_or_else(|| SchemaError::Describe("missing '# dbinfo:' header".into()))?;

    let parts: Vec<&str> = header.trim().splitn(3, ',').collect();
    if parts.len() != 3 {
        return Err(SchemaError::Describe(format!("invalid header '{}'", header)));
    }
    let version = parts[1]
        .parse::<u32>()
        .map_err(|_| SchemaError::Describe(format!("invalid version '{}'", parts[1])))?;

    let tokens = Lexer::new(input)
        .tokenize()
        .map_err(|e| SchemaError::Describe(e.to_string()))?;

    let mut p = SchemaParser {
        tokens,
        pos: 0,
        schema: parts[2].to_string(),
    };

    let mut tables = Vec::new();
    let mut functions = Vec::new();

    loop {
        match p.peek().clone() {
            Token::Eof => break,
            Token::Name(kw) if kw == "type" => {
                p.advance();
                tables.push(p.parse_table()?);
            }
            Token::Name(kw) if kw == "function" => {
                p.advance();
                functions.push(p.parse_function()?);
            }
            tok => return Err(p.unexpected(&tok, "'type' or 'function'")),
        }
    }

    Ok(DBInfo::new(
        parts[0],
        version,
        parts[2],
        "",
        tables,
        functions,
        &Blocklist::default(),
    ))
}

struct SchemaParser {
    tokens: Vec<Token>,
    pos: usize,
    schema: String,
}

struct Dir {
    name: String,
    args: Vec<(String, Node)>,
}

impl Dir {
    fn text(&self, key: &str) -> Option<String> {
        self.args
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_text())
    }
}

impl SchemaParser {
    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        self.pos += 1;
        tok
    }

    fn unexpected(&self, tok: &Token, what: &str) -> SchemaError {
        SchemaError::Describe(format!("unexpected {}, expecting {}", tok.describe(), what))
    }

    fn expect(&mut self, expected: Token) -> Result<(), SchemaError> {
        let tok = self.advance();
        if tok == expected {
            Ok(())
        } else {
            Err(self.unexpected(&tok, &expected.describe()))
        }
    }

    fn name(&mut self) -> Result<String, SchemaError> {
        match self.advance() {
            Token::Name(n) => Ok(n),
            tok => Err(self.unexpected(&tok, "name")),
        }
    }

    fn value(&mut self) -> Result<Node, SchemaError> {
        match self.advance() {
            Token::Str(s) => Ok(Node::Str(s)),
            Token::Name(n) => Ok(Node::Label(n)),
            Token::Int(n) | Token::Float(n) => Ok(Node::Str(n)),
            tok => Err(self.unexpected(&tok, "value")),
        }
    }

    fn directives(&mut self) -> Result<Vec<Dir>, SchemaError> {
        let mut dirs = Vec::new();
        while *self.peek() == Token::At {
            self.advance();
            let name = self.name()?;
            let mut args = Vec::new();
            if *self.peek() == Token::LParen {
                self.advance();
                while *self.peek() != Token::RParen {
                    let k = self.name()?;
                    self.expect(Token::Colon)?;
                    args.push((k, self.value()?));
                }
                self.advance();
            }
            dirs.push(Dir { name, args });
        }
        Ok(dirs)
    }

    /// `Type`, `Type!`, `[Type]` or `[Type]!`
    fn typ(&mut self) -> Result<(String, bool, bool), SchemaError> {
        let array = *self.peek() == Token::LBracket;
        if array {
            self.advance();
        }
        let typ = self.name()?.to_lowercase();
        if array {
            self.expect(Token::RBracket)?;
        }
        let not_null = *self.peek() == Token::Bang;
        if not_null {
            self.advance();
        }
        Ok((typ, array, not_null))
    }

    fn parse_table(&mut self) -> Result<DBTable, SchemaError> {
        let mut name = self.name()?;
        let mut schema = self.schema.clone();
        let mut typ = TableType::Table;
        let mut blocked = false;

        for d in self.directives()? {
            match d.name.as_str() {
                "view" => typ = TableType::View,
                "json" => typ = TableType::Json,
                "virtual" => typ = TableType::Virtual,
                "blocked" => blocked = true,
                "schema" => schema = d.text("name").unwrap_or(schema),
                "name" => name = d.text("value").unwrap_or(name),
                other => {
                    return Err(SchemaError::Describe(format!(
                        "unknown table directive @{}",
                        other
                    )));
                }
            }
        }

        self.expect(Token::LBrace)?;
        let mut columns = Vec::new();
        while *self.peek() != Token::RBrace {
            columns.push(self.parse_column(&schema)?);
        }
        self.advance();

        let mut t = DBTable::new(&schema, &name, typ, columns);
        t.blocked = blocked;
        Ok(t)
    }

    fn parse_column(&mut self, table_schema: &str) -> Result<DBColumn, SchemaError> {
        let name = self.name()?;
        self.expect(Token::Colon)?;
        let (typ, array, not_null) = self.typ()?;

        let mut c = DBColumn::new(&name, &typ);
        c.array = array;
        c.not_null = not_null;

        for d in self.directives()? {
            match d.name.as_str() {
                "id" => {
                    c.primary_key = true;
                    c.unique_key = true;
                }
                "unique" => c.unique_key = true,
                "search" => c.full_text = true,
                "blocked" => c.blocked = true,
                "type" => c.typ = d.text("name").unwrap_or(c.typ),
                "name" => {
                    c.name = d.text("value").unwrap_or(c.name);
                    c.key = c.name.to_lowercase();
                }
                "relation" => {
                    let table = d.text("type").ok_or_else(|| {
                        SchemaError::Describe(format!("@relation on '{}' needs a type", name))
                    })?;
                    c.fk = Some(FKey {
                        schema: d.text("schema").unwrap_or_else(|| table_schema.to_string()),
                        table,
                        col: d.text("field").unwrap_or_else(|| "id".to_string()),
                    });
                }
                other => {
                    return Err(SchemaError::Describe(format!(
                        "unknown column directive @{}",
                        other
                    )));
                }
            }
        }
        Ok(c)
    }

    fn parse_function(&mut self) -> Result<DBFunction, SchemaError> {
        let name = self.name()?;
        self.expect(Token::LParen)?;

        let mut inputs = Vec::new();
        while *self.peek() != Token::RParen {
            let pname = self.name()?;
            self.expect(Token::Colon)?;
            let (mut typ, array, _) = self.typ()?;
            for d in self.directives()? {
                if d.name == "type" {
                    typ = d.text("name").unwrap_or(typ);
                }
            }
            inputs.push(DBFuncParam {
                id: inputs.len(),
                name: pname,
                typ,
                array,
            });
        }
        self.advance();
        self.expect(Token::Colon)?;
        let (mut typ, _, _) = self.typ()?;

        let mut f = DBFunction {
            schema: self.schema.clone(),
            name,
            typ: String::new(),
            agg: false,
            inputs,
        };
        for d in self.directives()? {
            match d.name.as_str() {
                "type" => typ = d.text("name").unwrap_or(typ),
                "agg" => f.agg = true,
                "schema" => f.schema = d.text("name").unwrap_or(f.schema),
                _ => {}
            }
        }
        f.typ = typ;
        Ok(f)
    }
}
