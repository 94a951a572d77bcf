//! Relationship graph derived from a `DBInfo` snapshot.

use std::collections::HashMap;

use super::{DBColumn, DBFunction, DBInfo, DBTable, FKey, SchemaError, TableType, plural, singular};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelType {
    OneToOne,
    OneToMany,
    OneToManyThrough,
    Recursive,
    Embedded,
    Polymorphic,
    Remote,
}

/// One side of a join.
#[derive(Debug, Clone, PartialEq)]
pub struct RelEnd {
    pub table: String,
    pub col: DBColumn,
}

/// Join table of a many-to-many relationship. `col_l` joins the child
/// table and `col_r` the parent table.
#[derive(Debug, Clone, PartialEq)]
pub struct Through {
    pub schema: String,
    pub table: String,
    pub col_l: DBColumn,
    pub col_r: DBColumn,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolyInfo {
    /// Discriminator column on the parent table
    pub type_col: DBColumn,
}

/// Directed edge from a child table to the parent it is nested under.
/// The join condition is always `left.col = right.col` (or `= ANY` when
/// one side is an array), `left` being the child end.
#[derive(Debug, Clone, PartialEq)]
pub struct DBRel {
    pub typ: RelType,
    pub left: RelEnd,
    pub right: RelEnd,
    pub through: Option<Through>,
    pub poly: Option<PolyInfo>,
}

impl DBRel {
    /// True when the child row carries the foreign key, so the parent
    /// must exist before the child can be written.
    pub fn child_holds_fk(&self) -> bool {
        self.left.col.fk.is_some() && self.right.col.fk.is_none()
    }
}

/// Schema additions that only exist in configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum Overlay {
    /// Another name for an existing table
    Alias { name: String, table: String },
    /// JSON column `name` on `table` exposed as a table of its own
    Json {
        name: String,
        table: String,
        columns: Vec<DBColumn>,
    },
    /// Virtual table resolving to one of several tables by `type_column`
    Polymorphic {
        name: String,
        table: String,
        type_column: String,
        id_column: String,
    },
    /// Field resolved by a remote resolver using `id_column` as the key
    Remote {
        name: String,
        table: String,
        id_column: String,
    },
    /// Adds a column or sets its foreign key
    Column { table: String, column: DBColumn },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRef {
    pub id: usize,
    pub singular: bool,
}

#[derive(Debug, Clone)]
pub struct DBSchema {
    typ: String,
    version: u32,
    schema: String,
    tables: Vec<DBTable>,
    tindex: HashMap<String, TableRef>,
    edges: Vec<DBRel>,
    eindex: HashMap<(usize, usize), Vec<usize>>,
    names: HashMap<(usize, String), (usize, usize)>,
    functions: HashMap<String, DBFunction>,
}

impl DBSchema {
    pub fn new(info: &DBInfo, overlays: &[Overlay]) -> Result<Self, SchemaError> {
        let mut s = Self {
            typ: info.typ.clone(),
            version: info.version,
            schema: info.schema.clone(),
            tables: info.tables.clone(),
            tindex: HashMap::new(),
            edges: Vec::new(),
            eindex: HashMap::new(),
            names: HashMap::new(),
            functions: HashMap::new(),
        };

        for o in overlays {
            if let Overlay::Column { table, column } = o {
                s.add_column(table, column.clone())?;
            }
        }

        // pass 1: table names
        for id in 0..s.tables.len() {
            let t = &s.tables[id];
            let (schema, name) = (t.schema.clone(), t.name.clone());
            s.tindex
                .insert(format!("{}.{}", schema, name), TableRef { id, singular: false });
            if schema != s.schema {
                continue;
            }
            s.register(&name, id);
        }

        for o in overlays {
            s.add_overlay(o)?;
        }

        // pass 2: first degree
        for id in 0..s.tables.len() {
            if s.tables[id].typ != TableType::Table && s.tables[id].typ != TableType::View {
                continue;
            }
            s.add_column_rels(id)?;
        }

        // pass 3: second degree through join tables
        for id in 0..s.tables.len() {
            s.add_through_rels(id)?;
        }

        for f in &info.functions {
            if f.inputs.len() == 1 {
                s.functions.insert(f.name.to_lowercase(), f.clone());
            }
        }

        Ok(s)
    }

    fn register(&mut self, name: &str, id: usize) {
        self.tindex
            .insert(name.to_string(), TableRef { id, singular: false });

        let sn = singular(name);
        if sn != name {
            self.tindex
                .entry(sn)
                .or_insert(TableRef { id, singular: true });
        } else {
            let pn = plural(name);
            self.tindex
                .entry(pn)
                .or_insert(TableRef { id, singular: false });
        }
    }

    fn add_column(&mut self, table: &str, mut col: DBColumn) -> Result<(), SchemaError> {
        let id = self
            .tables
            .iter()
            .position(|t| t.name == table)
            .ok_or_else(|| SchemaError::TableNotFound(table.to_string()))?;

        let t = &self.tables[id];
        let mut cols = t.columns.clone();
        if let Some(fk) = &mut col.fk {
            if fk.schema.is_empty() {
                fk.schema = t.schema.clone();
            }
        }

        match cols.iter_mut().find(|c| c.name == col.name) {
            Some(c) => {
                if col.fk.is_some() {
                    c.fk = col.fk;
                }
                if !col.typ.is_empty() {
                    c.typ = col.typ;
                }
                c.array |= col.array;
            }
            None => cols.push(col),
        }

        let mut nt = DBTable::new(&t.schema, &t.name, t.typ, cols);
        nt.blocked = t.blocked;
        self.tables[id] = nt;
        Ok(())
    }

    fn add_overlay(&mut self, o: &Overlay) -> Result<(), SchemaError> {
        match o {
            Overlay::Alias { name, table } => {
                let tr = self.find(table).ok_or_else(|| {
                    SchemaError::InvalidTable(name.clone(), format!("unknown table '{}'", table))
                })?;
                self.tindex
                    .insert(name.clone(), TableRef { id: tr.id, singular: false });
            }

            Overlay::Json {
                name,
                table,
                columns,
            } => {
                let pid = self.table_id(name, table)?;
                let pcol = self.tables[pid].get_column(name)?.clone();
                let schema = self.tables[pid].schema.clone();

                let vt = DBTable::new(&schema, name, TableType::Json, columns.clone());
                let mut lcol = pcol.clone();
                lcol.table = name.clone();

                let cid = self.add_table(vt);
                self.add_edge(
                    cid,
                    pid,
                    DBRel {
                        typ: RelType::Embedded,
                        left: RelEnd {
                            table: name.clone(),
                            col: lcol,
                        },
                        right: RelEnd {
                            table: table.clone(),
                            col: pcol,
                        },
                        through: None,
                        poly: None,
                    },
                    Some(name.clone()),
                );
            }

            Overlay::Polymorphic {
                name,
                table,
                type_column,
                id_column,
            } => {
                let pid = self.table_id(name, table)?;
                let pt = &self.tables[pid];
                let type_col = pt.get_column(type_column)?.clone();
                let id_col = pt.get_column(id_column)?.clone();
                let schema = pt.schema.clone();

                let vt = DBTable::new(&schema, name, TableType::Virtual, vec![]);
                let cid = self.add_table(vt);
                self.add_edge(
                    cid,
                    pid,
                    DBRel {
                        typ: RelType::Polymorphic,
                        left: RelEnd {
                            table: name.clone(),
                            col: DBColumn::new("id", &id_col.typ),
                        },
                        right: RelEnd {
                            table: table.clone(),
                            col: id_col,
                        },
                        through: None,
                        poly: Some(PolyInfo { type_col }),
                    },
                    Some(name.clone()),
                );
            }

            Overlay::Remote {
                name,
                table,
                id_column,
            } => {
                let pid = self.table_id(name, table)?;
                let id_col = self.tables[pid].get_column(id_column)?.clone();
                let schema = self.tables[pid].schema.clone();

                let vt = DBTable::new(&schema, name, TableType::Virtual, vec![]);
                let cid = self.add_table(vt);
                self.add_edge(
                    cid,
                    pid,
                    DBRel {
                        typ: RelType::Remote,
                        left: RelEnd {
                            table: name.clone(),
                            col: DBColumn::new(&id_col.name, &id_col.typ),
                        },
                        right: RelEnd {
                            table: table.clone(),
                            col: id_col,
                        },
                        through: None,
                        poly: None,
                    },
                    Some(name.clone()),
                );
            }

            Overlay::Column { .. } => {}
        }
        Ok(())
    }

    fn table_id(&self, overlay: &str, table: &str) -> Result<usize, SchemaError> {
        self.tindex
            .get(table)
            .map(|tr| tr.id)
            .ok_or_else(|| {
                SchemaError::InvalidTable(overlay.to_string(), format!("unknown table '{}'", table))
            })
    }

    fn add_table(&mut self, t: DBTable) -> usize {
        let id = self.tables.len();
        self.tindex
            .insert(format!("{}.{}", t.schema, t.name), TableRef { id, singular: false });
        self.tables.push(t);
        id
    }

    fn add_edge(&mut self, child: usize, parent: usize, rel: DBRel, name: Option<String>) {
        let eid = self.edges.len();
        self.edges.push(rel);
        self.eindex.entry((child, parent)).or_default().push(eid);
        if let Some(n) = name {
            self.names.entry((parent, n)).or_insert((child, eid));
        }
    }

    fn fk_target(&self, t: &DBTable, fk: &FKey) -> Result<(usize, DBColumn), SchemaError> {
        let schema = if fk.schema.is_empty() {
            &t.schema
        } else {
            &fk.schema
        };
        let tr = self
            .tindex
            .get(&format!("{}.{}", schema, fk.table))
            .ok_or_else(|| SchemaError::FkTableNotFound(schema.clone(), fk.table.clone()))?;
        let fc = self.tables[tr.id]
            .column(&fk.col)
            .ok_or_else(|| SchemaError::FkColumnNotFound(fk.table.clone(), fk.col.clone()))?;
        Ok((tr.id, fc.clone()))
    }

    fn add_column_rels(&mut self, id: usize) -> Result<(), SchemaError> {
        let t = self.tables[id].clone();

        for c in &t.columns {
            let Some(fk) = &c.fk else { continue };
            let (fid, fc) = self.fk_target(&t, fk)?;
            let ft = self.tables[fid].name.clone();

            if fid == id {
                self.add_edge(
                    id,
                    id,
                    DBRel {
                        typ: RelType::Recursive,
                        left: RelEnd {
                            table: t.name.clone(),
                            col: c.clone(),
                        },
                        right: RelEnd {
                            table: t.name.clone(),
                            col: fc,
                        },
                        through: None,
                        poly: None,
                    },
                    None,
                );
                continue;
            }

            // products.owner_id -> users.id: a product has one owner
            let name = rel_name(&c.name);
            let name = (name != c.name).then_some(name);
            let array_name = match (&name, c.array) {
                (Some(n), true) => Some(plural(n)),
                _ => None,
            };

            self.add_edge(
                fid,
                id,
                DBRel {
                    typ: if c.array {
                        RelType::OneToMany
                    } else {
                        RelType::OneToOne
                    },
                    left: RelEnd {
                        table: ft.clone(),
                        col: fc.clone(),
                    },
                    right: RelEnd {
                        table: t.name.clone(),
                        col: c.clone(),
                    },
                    through: None,
                    poly: None,
                },
                name,
            );
            if let Some(n) = array_name {
                let eid = self.edges.len() - 1;
                self.names.entry((id, n)).or_insert((fid, eid));
            }

            // and a user owns many products
            self.add_edge(
                id,
                fid,
                DBRel {
                    typ: if c.unique_key && !c.array {
                        RelType::OneToOne
                    } else {
                        RelType::OneToMany
                    },
                    left: RelEnd {
                        table: t.name.clone(),
                        col: c.clone(),
                    },
                    right: RelEnd {
                        table: ft,
                        col: fc,
                    },
                    through: None,
                    poly: None,
                },
                None,
            );
        }
        Ok(())
    }

    fn add_through_rels(&mut self, id: usize) -> Result<(), SchemaError> {
        let t = self.tables[id].clone();
        if t.typ != TableType::Table {
            return Ok(());
        }

        let mut fks: Vec<(DBColumn, usize, DBColumn)> = Vec::new();
        for c in &t.columns {
            let Some(fk) = &c.fk else { continue };
            if c.array {
                continue;
            }
            let (fid, fc) = self.fk_target(&t, fk)?;
            if fid != id {
                fks.push((c.clone(), fid, fc));
            }
        }

        let distinct: std::collections::HashSet<usize> = fks.iter().map(|f| f.1).collect();
        if distinct.len() < 2 {
            return Ok(());
        }

        for (ca, a, ka) in &fks {
            for (cb, b, kb) in &fks {
                if a == b {
                    continue;
                }
                let rel = DBRel {
                    typ: RelType::OneToManyThrough,
                    left: RelEnd {
                        table: self.tables[*a].name.clone(),
                        col: ka.clone(),
                    },
                    right: RelEnd {
                        table: self.tables[*b].name.clone(),
                        col: kb.clone(),
                    },
                    through: Some(Through {
                        schema: t.schema.clone(),
                        table: t.name.clone(),
                        col_l: ca.clone(),
                        col_r: cb.clone(),
                    }),
                    poly: None,
                };
                self.add_edge(*a, *b, rel, None);
            }
        }
        Ok(())
    }

    pub fn db_type(&self) -> &str {
        &self.typ
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn tables(&self) -> &[DBTable] {
        &self.tables
    }

    pub fn table(&self, id: usize) -> &DBTable {
        &self.tables[id]
    }

    /// Resolve a top level field name (`users`, `user`, an alias) to a table.
    pub fn find(&self, name: &str) -> Option<TableRef> {
        self.tindex.get(name).copied()
    }

    pub fn find_in(&self, schema: &str, name: &str) -> Option<TableRef> {
        self.tindex.get(&format!("{}.{}", schema, name)).copied()
    }

    /// Resolve a named relationship such as `owner` under `products`.
    pub fn rel_by_name(&self, parent: usize, name: &str) -> Option<(usize, &DBRel)> {
        self.names
            .get(&(parent, name.to_string()))
            .map(|&(child, eid)| (child, &self.edges[eid]))
    }

    /// Find the single relationship that joins `child` to `parent`.
    /// Direct foreign keys win over join tables. `through` picks a join
    /// table when there is more than one.
    pub fn get_rel(
        &self,
        child: usize,
        parent: usize,
        through: Option<&str>,
    ) -> Result<&DBRel, SchemaError> {
        let cname = &self.tables[child].name;
        let pname = &self.tables[parent].name;
        let not_found = || SchemaError::RelNotFound(cname.clone(), pname.clone());

        let ids = self.eindex.get(&(child, parent)).ok_or_else(not_found)?;
        let edges = ids.iter().map(|&i| &self.edges[i]);

        let candidates: Vec<&DBRel> = match through {
            Some(th) => edges
                .filter(|e| e.through.as_ref().is_some_and(|t| t.table == th))
                .collect(),
            None => {
                let direct: Vec<&DBRel> = edges.clone().filter(|e| e.through.is_none()).collect();
                if direct.is_empty() {
                    edges.filter(|e| e.through.is_some()).collect()
                } else {
                    direct
                }
            }
        };

        match candidates.len() {
            0 => Err(not_found()),
            1 => Ok(candidates[0]),
            _ => {
                let mut opts: Vec<String> = candidates
                    .iter()
                    .map(|e| match &e.through {
                        Some(t) => t.table.clone(),
                        None => format!("{}.{}", e.right.table, e.right.col.name),
                    })
                    .collect();
                opts.sort();
                opts.dedup();
                Err(SchemaError::AmbiguousRel(
                    cname.clone(),
                    pname.clone(),
                    opts.join(", "),
                ))
            }
        }
    }

    pub fn function(&self, name: &str) -> Option<&DBFunction> {
        self.functions.get(&name.to_lowercase())
    }

    pub fn functions(&self) -> impl Iterator<Item = &DBFunction> {
        self.functions.values()
    }
}

/// `owner_id` -> `owner`, `ids_tag` -> `tag`
pub fn rel_name(col: &str) -> String {
    let cn = col.to_lowercase();
    if cn.ends_with("_id") && cn.len() > 3 {
        return col[..col.len() - 3].to_string();
    }
    if cn.ends_with("_ids") && cn.len() > 4 {
        return col[..col.len() - 4].to_string();
    }
    if cn.starts_with("id_") && cn.len() > 3 {
        return col[3..].to_string();
    }
    if cn.starts_with("ids_") && cn.len() > 4 {
        return col[4..].to_string();
    }
    col.to_string()
}
