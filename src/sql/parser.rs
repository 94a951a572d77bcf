//! DDL parser producing a `DBInfo` from `CREATE TABLE`, `ALTER TABLE` and
//! `CREATE FUNCTION` statements.

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use super::dialect::Dialect;
use super::lexer::{Kw, Token, tokenize};
use super::types::map_type;
use crate::schema::{Blocklist, DBColumn, DBFuncParam, DBFunction, DBInfo, DBTable, FKey, TableType};

pub const DEFAULT_SCHEMA: &str = "public";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SqlParseError {
    #[error("Unexpected token: {0:?}")]
    UnexpectedToken(Token),
    #[error("Expected {expected}, found {found:?}")]
    Expected { expected: String, found: Token },
    #[error("Unknown table in {stmt}: {table}")]
    UnknownTable { stmt: String, table: String },
    #[error("Unknown column in {stmt}: {table}.{column}")]
    UnknownColumn {
        stmt: String,
        table: String,
        column: String,
    },
    #[error("No tables found")]
    Empty,
}

/// Load a SQL dump into a `DBInfo` snapshot.
pub fn load_ddl(
    input: &str,
    dialect: Dialect,
    blocklist: &Blocklist,
) -> Result<DBInfo, SqlParseError> {
    let dialect = dialect.resolve(input);
    let tokens = tokenize(input);
    let mut parser = Parser::new(tokens, dialect);
    let (tables, functions) = parser.parse()?;

    debug!(
        dialect = dialect.db_type(),
        tables = tables.len(),
        functions = functions.len(),
        "loaded ddl"
    );

    Ok(DBInfo::new(
        dialect.db_type(),
        0,
        DEFAULT_SCHEMA,
        "",
        tables,
        functions,
        blocklist,
    ))
}

struct FkInfo {
    column: String,
    schema: Option<String>,
    target: String,
    target_column: String,
}

enum TableChange {
    Fk(FkInfo),
    PrimaryKey(Vec<String>),
    Unique(Vec<String>),
    FullText(Vec<String>),
}

struct TableDef {
    schema: String,
    name: String,
    columns: Vec<DBColumn>,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    dialect: Dialect,
}

impl Parser {
    fn new(tokens: Vec<Token>, dialect: Dialect) -> Self {
        Self {
            tokens,
            pos: 0,
            dialect,
        }
    }

    fn current(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
    }

    fn is_word(&self, word: &str) -> bool {
        matches!(self.current(), Token::Ident(s) if s.eq_ignore_ascii_case(word))
    }

    fn parse(&mut self) -> Result<(Vec<DBTable>, Vec<DBFunction>), SqlParseError> {
        let mut tables: Vec<TableDef> = Vec::new();
        let mut changes: Vec<(String, String, TableChange)> = Vec::new();
        let mut functions = Vec::new();

        while self.current() != &Token::Eof {
            match self.current() {
                Token::Kw(Kw::Create) => {
                    self.advance();

                    // CREATE OR REPLACE
                    if self.current() == &Token::Kw(Kw::Or) {
                        self.advance();
                        if self.current() == &Token::Kw(Kw::Replace) {
                            self.advance();
                        }
                    }
                    // CREATE TEMPORARY / UNLOGGED TABLE
                    while self.is_word("temporary") || self.is_word("temp") || self.is_word("unlogged") {
                        self.advance();
                    }

                    match self.current() {
                        Token::Kw(Kw::Table) => {
                            self.advance();
                            self.skip_if_not_exists();
                            if let Some((table, tchanges)) = self.parse_create_table()? {
                                for c in tchanges {
                                    changes.push((table.schema.clone(), table.name.clone(), c));
                                }
                                tables.push(table);
                            }
                        }
                        Token::Kw(Kw::Function) => {
                            self.advance();
                            if let Some(f) = self.parse_function()? {
                                functions.push(f);
                            }
                        }
                        _ => self.skip_statement(),
                    }
                }
                Token::Kw(Kw::Alter) => {
                    if let Some((schema, table, change)) = self.parse_alter_table()? {
                        changes.push((schema, table, change));
                    }
                }
                _ => {
                    self.advance();
                }
            }
        }

        if tables.is_empty() {
            return Err(SqlParseError::Empty);
        }

        for (schema, table, change) in changes {
            apply_change(&mut tables, &schema, &table, change)?;
        }

        let tables = tables
            .into_iter()
            .map(|t| DBTable::new(&t.schema, &t.name, TableType::Table, t.columns))
            .collect();
        Ok((tables, functions))
    }

    fn skip_if_not_exists(&mut self) {
        if self.current() == &Token::Kw(Kw::If) {
            self.advance(); // IF
            if self.current() == &Token::Kw(Kw::Not) {
                self.advance(); // NOT
            }
            if self.current() == &Token::Kw(Kw::Exists) {
                self.advance(); // EXISTS
            }
        }
    }

    /// `name` or `schema.name`
    fn parse_qualified_name(&mut self) -> Option<(String, String)> {
        let first = match self.current() {
            Token::Ident(name) => name.clone(),
            _ => return None,
        };
        self.advance();

        if self.current() == &Token::Dot {
            self.advance();
            let second = match self.current() {
                Token::Ident(name) => name.clone(),
                _ => return None,
            };
            self.advance();
            return Some((first, second));
        }
        Some((DEFAULT_SCHEMA.to_string(), first))
    }

    fn parse_create_table(&mut self) -> Result<Option<(TableDef, Vec<TableChange>)>, SqlParseError> {
        let Some((schema, name)) = self.parse_qualified_name() else {
            self.skip_statement();
            return Ok(None);
        };

        if self.current() != &Token::LParen {
            // CREATE TABLE x AS SELECT ..., PARTITION OF ...
            self.skip_statement();
            return Ok(None);
        }
        self.advance();

        let mut columns = Vec::new();
        let mut changes = Vec::new();

        loop {
            match self.current() {
                Token::RParen => {
                    self.advance();
                    break;
                }
                Token::Comma => {
                    self.advance();
                }
                Token::Kw(Kw::Primary) => {
                    // PRIMARY KEY (col1, col2, ...)
                    self.advance();
                    if self.current() == &Token::Kw(Kw::Key) {
                        self.advance();
                        changes.push(TableChange::PrimaryKey(self.parse_column_list()));
                    }
                }
                Token::Kw(Kw::Foreign) => {
                    if let Some(fk) = self.parse_foreign_key_constraint()? {
                        changes.push(TableChange::Fk(fk));
                    }
                }
                Token::Kw(Kw::Unique) => {
                    // UNIQUE [KEY name] (col1, ...)
                    self.advance();
                    if matches!(self.current(), Token::Kw(Kw::Key) | Token::Kw(Kw::Index)) {
                        self.advance();
                    }
                    if let Token::Ident(_) = self.current() {
                        self.advance();
                    }
                    changes.push(TableChange::Unique(self.parse_column_list()));
                }
                Token::Kw(Kw::Fulltext) => {
                    // FULLTEXT KEY name (col1, ...)
                    self.advance();
                    if matches!(self.current(), Token::Kw(Kw::Key) | Token::Kw(Kw::Index)) {
                        self.advance();
                    }
                    if let Token::Ident(_) = self.current() {
                        self.advance();
                    }
                    changes.push(TableChange::FullText(self.parse_column_list()));
                }
                Token::Kw(Kw::Constraint) => {
                    // Named constraint, the constraint type follows
                    self.advance();
                    if let Token::Ident(_) = self.current() {
                        self.advance();
                    }
                }
                Token::Kw(Kw::Index) | Token::Kw(Kw::Key) => {
                    self.skip_until(&[Token::Comma, Token::RParen]);
                }
                Token::Kw(Kw::Check) => {
                    self.advance();
                    self.skip_parenthesized();
                }
                Token::Ident(_) => {
                    if let Some((col, fk)) = self.parse_column()? {
                        if let Some(fk) = fk {
                            changes.push(TableChange::Fk(fk));
                        }
                        columns.push(col);
                    }
                }
                Token::Eof => break,
                _ => {
                    self.advance();
                }
            }
        }

        // Skip table options (ENGINE=, etc.)
        self.skip_statement();

        Ok(Some((
            TableDef {
                schema,
                name,
                columns,
            },
            changes,
        )))
    }

    fn parse_type(&mut self) -> String {
        let mut type_parts: Vec<String> = Vec::new();
        let mut paren_depth = 0;

        loop {
            match self.current() {
                Token::Ident(t) if paren_depth > 0 || !is_column_keyword(t) => {
                    if paren_depth == 0 && !type_parts.is_empty() {
                        type_parts.push(" ".to_string());
                    }
                    type_parts.push(t.clone());
                    self.advance();
                }
                Token::LParen => {
                    paren_depth += 1;
                    type_parts.push("(".to_string());
                    self.advance();
                }
                Token::RParen if paren_depth > 0 => {
                    paren_depth -= 1;
                    type_parts.push(")".to_string());
                    self.advance();
                }
                Token::Num(n) => {
                    type_parts.push(n.clone());
                    self.advance();
                }
                Token::Comma if paren_depth > 0 => {
                    type_parts.push(",".to_string());
                    self.advance();
                }
                Token::ArrayMark => {
                    type_parts.push("[]".to_string());
                    self.advance();
                }
                _ => break,
            }
        }
        type_parts.concat()
    }

    fn parse_column(&mut self) -> Result<Option<(DBColumn, Option<FkInfo>)>, SqlParseError> {
        let name = match self.current() {
            Token::Ident(n) => n.clone(),
            _ => return Ok(None),
        };
        self.advance();

        let raw_type = self.parse_type();
        if raw_type.is_empty() {
            self.skip_until(&[Token::Comma, Token::RParen]);
            return Ok(None);
        }

        let (typ, array) = map_type(&raw_type, self.dialect);
        let mut col = DBColumn::new(&name, &typ);
        col.array = array;
        col.full_text = typ == "tsvector";
        let mut fk = None;

        loop {
            match self.current() {
                Token::Kw(Kw::Primary) => {
                    self.advance();
                    if self.current() == &Token::Kw(Kw::Key) {
                        self.advance();
                    }
                    col.primary_key = true;
                    col.not_null = true;
                }
                Token::Kw(Kw::Not) => {
                    self.advance();
                    if self.current() == &Token::Kw(Kw::Null) {
                        self.advance();
                        col.not_null = true;
                    }
                }
                Token::Kw(Kw::Null) => {
                    self.advance();
                }
                Token::Kw(Kw::Unique) => {
                    self.advance();
                    if self.current() == &Token::Kw(Kw::Key) {
                        self.advance();
                    }
                    col.unique_key = true;
                }
                Token::Kw(Kw::Default) => {
                    self.advance();
                    self.skip_default_value();
                }
                Token::Kw(Kw::References) => {
                    // Inline FK reference
                    self.advance();
                    let (schema, target, target_column) = self.parse_reference()?;
                    fk = Some(FkInfo {
                        column: name.clone(),
                        schema,
                        target,
                        target_column,
                    });
                    self.skip_on_actions();
                }
                Token::Kw(Kw::Check) => {
                    self.advance();
                    self.skip_parenthesized();
                }
                Token::LParen => {
                    // GENERATED ALWAYS AS (...)
                    self.skip_parenthesized();
                }
                Token::Comma | Token::RParen | Token::Eof => break,
                Token::Kw(Kw::Constraint) => {
                    self.advance();
                    if let Token::Ident(_) = self.current() {
                        self.advance();
                    }
                }
                Token::Kw(Kw::On) => {
                    self.skip_on_actions();
                }
                _ => {
                    self.advance();
                }
            }
        }

        Ok(Some((col, fk)))
    }

    fn skip_default_value(&mut self) {
        match self.current() {
            Token::LParen => self.skip_parenthesized(),
            Token::Ident(_) => {
                self.advance();
                // NOW(), nextval('seq'::regclass)
                if self.current() == &Token::LParen {
                    self.skip_parenthesized();
                }
            }
            Token::Str(_) | Token::Num(_) | Token::Kw(Kw::Null) => self.advance(),
            _ => {}
        }
        // 'x'::text
        if matches!(self.current(), Token::Ident(s) if is_cast_type(s)) {
            self.advance();
        }
    }

    fn parse_reference(&mut self) -> Result<(Option<String>, String, String), SqlParseError> {
        let (schema, target) = match self.current() {
            Token::Ident(_) => match self.parse_qualified_name() {
                Some((s, t)) => (s, t),
                None => return Err(SqlParseError::UnexpectedToken(self.current().clone())),
            },
            _ => return Err(SqlParseError::UnexpectedToken(self.current().clone())),
        };

        // (column)
        let col = if self.current() == &Token::LParen {
            self.parse_column_list()
                .into_iter()
                .next()
                .unwrap_or_else(|| "id".to_string())
        } else {
            "id".to_string()
        };

        Ok((Some(schema), target, col))
    }

    fn parse_foreign_key_constraint(&mut self) -> Result<Option<FkInfo>, SqlParseError> {
        self.advance(); // FOREIGN
        if self.current() != &Token::Kw(Kw::Key) {
            return Ok(None);
        }
        self.advance(); // KEY

        // MySQL allows an index name here
        if let Token::Ident(_) = self.current() {
            self.advance();
        }

        let columns = self.parse_column_list();

        if self.current() != &Token::Kw(Kw::References) {
            return Err(SqlParseError::Expected {
                expected: "REFERENCES".to_string(),
                found: self.current().clone(),
            });
        }
        self.advance();

        let (schema, target, target_column) = self.parse_reference()?;
        self.skip_on_actions();

        // only single column keys take part in relationships
        match columns.as_slice() {
            [column] => Ok(Some(FkInfo {
                column: column.clone(),
                schema,
                target,
                target_column,
            })),
            _ => Ok(None),
        }
    }

    fn parse_column_list(&mut self) -> Vec<String> {
        let mut cols = Vec::new();

        if self.current() != &Token::LParen {
            return cols;
        }
        self.advance();

        let mut depth = 0;
        loop {
            match self.current() {
                Token::Ident(name) if depth == 0 => {
                    cols.push(name.clone());
                    self.advance();
                }
                Token::LParen => {
                    // KEY idx (name(10))
                    depth += 1;
                    self.advance();
                }
                Token::RParen if depth > 0 => {
                    depth -= 1;
                    self.advance();
                }
                Token::RParen => {
                    self.advance();
                    break;
                }
                Token::Eof => break,
                _ => {
                    self.advance();
                }
            }
        }

        cols
    }

    fn skip_on_actions(&mut self) {
        while self.current() == &Token::Kw(Kw::On) {
            self.advance();
            // DELETE or UPDATE
            if matches!(self.current(), Token::Kw(Kw::Delete) | Token::Kw(Kw::Update)) {
                self.advance();
            }
            // CASCADE, RESTRICT, SET NULL, SET DEFAULT, NO ACTION
            if self.is_word("set") || self.is_word("no") {
                self.advance();
            }
            if matches!(self.current(), Token::Ident(_) | Token::Kw(Kw::Null) | Token::Kw(Kw::Default)) {
                self.advance();
            }
        }
        // DEFERRABLE INITIALLY DEFERRED
        while self.is_word("deferrable") || self.is_word("initially") || self.is_word("deferred") || self.is_word("immediate") {
            self.advance();
        }
    }

    fn skip_parenthesized(&mut self) {
        if self.current() != &Token::LParen {
            self.advance();
            return;
        }
        self.advance();
        let mut depth = 1;
        while depth > 0 {
            match self.current() {
                Token::LParen => depth += 1,
                Token::RParen => depth -= 1,
                Token::Eof => break,
                _ => {}
            }
            self.advance();
        }
    }

    fn skip_statement(&mut self) {
        while !matches!(self.current(), Token::Semicolon | Token::Eof) {
            self.advance();
        }
        if self.current() == &Token::Semicolon {
            self.advance();
        }
    }

    fn skip_until(&mut self, tokens: &[Token]) {
        while !tokens.contains(self.current()) && self.current() != &Token::Eof {
            if self.current() == &Token::LParen {
                self.skip_parenthesized();
            } else {
                self.advance();
            }
        }
    }

    /// ALTER TABLE [ONLY] t ADD [CONSTRAINT name] FOREIGN KEY | PRIMARY KEY | UNIQUE
    fn parse_alter_table(&mut self) -> Result<Option<(String, String, TableChange)>, SqlParseError> {
        self.advance(); // ALTER

        if self.current() != &Token::Kw(Kw::Table) {
            self.skip_statement();
            return Ok(None);
        }
        self.advance(); // TABLE
        self.skip_if_not_exists();

        if self.current() == &Token::Kw(Kw::Only) {
            self.advance();
        }

        let Some((schema, table)) = self.parse_qualified_name() else {
            self.skip_statement();
            return Ok(None);
        };

        if self.current() != &Token::Kw(Kw::Add) {
            self.skip_statement();
            return Ok(None);
        }
        self.advance(); // ADD

        if self.current() == &Token::Kw(Kw::Constraint) {
            self.advance();
            if let Token::Ident(_) = self.current() {
                self.advance();
            }
        }

        let change = match self.current() {
            Token::Kw(Kw::Foreign) => self.parse_foreign_key_constraint()?.map(TableChange::Fk),
            Token::Kw(Kw::Primary) => {
                self.advance();
                if self.current() == &Token::Kw(Kw::Key) {
                    self.advance();
                }
                Some(TableChange::PrimaryKey(self.parse_column_list()))
            }
            Token::Kw(Kw::Unique) => {
                self.advance();
                Some(TableChange::Unique(self.parse_column_list()))
            }
            _ => None,
        };

        self.skip_statement();
        Ok(change.map(|c| (schema, table, c)))
    }

    /// CREATE FUNCTION name(args) RETURNS type. Only scalar functions are
    /// kept, set returning ones are skipped.
    fn parse_function(&mut self) -> Result<Option<DBFunction>, SqlParseError> {
        let Some((schema, name)) = self.parse_qualified_name() else {
            self.skip_statement();
            return Ok(None);
        };

        if self.current() != &Token::LParen {
            self.skip_statement();
            return Ok(None);
        }
        self.advance();

        let mut inputs = Vec::new();
        let mut output = false;
        let mut words: Vec<String> = Vec::new();

        loop {
            match self.current() {
                Token::Comma | Token::RParen => {
                    let done = self.current() == &Token::RParen;
                    self.advance();
                    if !output && !words.is_empty() {
                        inputs.push(func_param(inputs.len(), &words, self.dialect));
                    }
                    words.clear();
                    output = false;
                    if done {
                        break;
                    }
                }
                Token::Ident(w) if words.is_empty() && (w.eq_ignore_ascii_case("out") || w.eq_ignore_ascii_case("inout")) => {
                    output = w.eq_ignore_ascii_case("out");
                    self.advance();
                }
                Token::Ident(w) if w.eq_ignore_ascii_case("in") && words.is_empty() => {
                    self.advance();
                }
                Token::Ident(w) => {
                    words.push(w.clone());
                    self.advance();
                }
                Token::ArrayMark => {
                    if let Some(last) = words.last_mut() {
                        last.push_str("[]");
                    }
                    self.advance();
                }
                Token::LParen => self.skip_parenthesized(),
                Token::Kw(Kw::Default) => {
                    self.advance();
                    self.skip_default_value();
                }
                Token::Eof => return Err(SqlParseError::UnexpectedToken(Token::Eof)),
                _ => self.advance(),
            }
        }

        if self.current() != &Token::Kw(Kw::Returns) {
            self.skip_statement();
            return Ok(None);
        }
        self.advance();

        if self.is_word("setof") || self.current() == &Token::Kw(Kw::Table) {
            self.skip_statement();
            return Ok(None);
        }

        let raw_type = self.parse_type();
        self.skip_statement();

        if raw_type.is_empty() {
            return Ok(None);
        }
        let (typ, _) = map_type(&raw_type, self.dialect);

        Ok(Some(DBFunction {
            schema,
            name,
            typ,
            agg: false,
            inputs,
        }))
    }
}

/// `a integer`, `integer` or `a double precision`
fn func_param(id: usize, words: &[String], dialect: Dialect) -> DBFuncParam {
    let (name, typ) = if words.len() >= 2 && !is_type_word(&words[0]) {
        (words[0].clone(), words[1..].join(" "))
    } else {
        (format!("arg{}", id + 1), words.join(" "))
    };
    let (typ, array) = map_type(&typ, dialect);
    DBFuncParam {
        id,
        name,
        typ,
        array,
    }
}

fn is_type_word(w: &str) -> bool {
    matches!(
        w.to_lowercase().as_str(),
        "double" | "character" | "timestamp" | "time" | "bit"
    )
}

/// Words that end a column type: `GENERATED`, `AUTO_INCREMENT`, ...
fn is_column_keyword(w: &str) -> bool {
    matches!(
        w.to_uppercase().as_str(),
        "GENERATED"
            | "AUTO_INCREMENT"
            | "AUTOINCREMENT"
            | "COLLATE"
            | "COMMENT"
            | "IDENTITY"
            | "ALWAYS"
            | "STORED"
            | "CHARACTER_SET"
            | "LANGUAGE"
            | "AS"
            | "IMMUTABLE"
            | "STABLE"
            | "VOLATILE"
            | "STRICT"
            | "SECURITY"
            | "PARALLEL"
            | "COST"
            | "BEGIN"
            | "DETERMINISTIC"
            | "RETURN"
            | "READS"
            | "CONTAINS"
            | "NO"
            | "SQL"
            | "MODIFIES"
            | "CALLED"
            | "SET"
    )
}

fn is_cast_type(w: &str) -> bool {
    matches!(
        w.to_lowercase().as_str(),
        "text" | "regclass" | "character" | "jsonb" | "json" | "integer" | "bigint" | "timestamp"
    )
}

fn apply_change(
    tables: &mut [TableDef],
    schema: &str,
    table: &str,
    change: TableChange,
) -> Result<(), SqlParseError> {
    let stmt = match &change {
        TableChange::Fk(_) => "FOREIGN KEY",
        TableChange::PrimaryKey(_) => "PRIMARY KEY",
        TableChange::Unique(_) => "UNIQUE",
        TableChange::FullText(_) => "FULLTEXT",
    };

    let t = tables
        .iter_mut()
        .find(|t| t.schema == schema && t.name == table)
        .ok_or_else(|| SqlParseError::UnknownTable {
            stmt: stmt.to_string(),
            table: table.to_string(),
        })?;

    let index: HashMap<String, usize> = t
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| (c.name.clone(), i))
        .collect();
    let find = |name: &str| {
        index.get(name).copied().ok_or_else(|| SqlParseError::UnknownColumn {
            stmt: stmt.to_string(),
            table: table.to_string(),
            column: name.to_string(),
        })
    };

    match change {
        TableChange::Fk(fk) => {
            let i = find(&fk.column)?;
            t.columns[i].fk = Some(FKey {
                schema: fk.schema.unwrap_or_else(|| schema.to_string()),
                table: fk.target,
                col: fk.target_column,
            });
        }
        TableChange::PrimaryKey(cols) => {
            // composite keys only mark the columns not null
            let single = cols.len() == 1;
            for c in &cols {
                let i = find(c)?;
                t.columns[i].not_null = true;
                t.columns[i].primary_key |= single;
            }
        }
        TableChange::Unique(cols) => {
            if let [c] = cols.as_slice() {
                let i = find(c)?;
                t.columns[i].unique_key = true;
            }
        }
        TableChange::FullText(cols) => {
            for c in &cols {
                let i = find(c)?;
                t.columns[i].full_text = true;
            }
        }
    }
    Ok(())
}
