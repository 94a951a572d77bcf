//! Field resolution: columns, aggregates, functions and child selects.

use crate::ast::Field as AstField;
use crate::schema::{RelType, SchemaError, TableType, singular};

use super::directives::{self, Visibility};
use super::roles::QueryPerms;
use super::{CompileError, Field, FieldKind, Pending, PermissionError, SelType, Skip};
use super::Ctx;

const AGGREGATES: [&str; 5] = ["count", "sum", "avg", "max", "min"];

impl Ctx<'_> {
    pub(super) fn select_fields(
        &mut self,
        id: usize,
        children: &[usize],
        perms: &QueryPerms,
    ) -> Result<(), CompileError> {
        let op = self.op;
        let tid = self.qc.selects[id].tid;
        let mut fields = Vec::with_capacity(children.len());

        for &fid in children {
            let f = &op.fields[fid];
            let vis = directives::visibility(&f.directives, self.role_name, f.key())?;
            if vis == Visibility::Drop {
                continue;
            }
            let name = self.field_name(&f.name);
            let table = self.schema.table(tid);

            let is_child = !f.children.is_empty()
                || (table.column(&name).is_none()
                    && self
                        .schema
                        .rel_by_name(tid, &name)
                        .is_some_and(|(_, r)| r.typ == RelType::Remote));

            if is_child {
                let cid = self.child_select(id, f, &name, &vis)?;
                fields.push(Field {
                    key: f.key().to_string(),
                    kind: FieldKind::Child(cid),
                    null: false,
                    cond: None,
                });
                continue;
            }

            let Some(kind) = self.scalar_field(id, f, &name, perms)? else {
                continue;
            };
            let mut field = Field {
                key: f.key().to_string(),
                kind,
                null: false,
                cond: None,
            };
            match vis {
                Visibility::Null => field.null = true,
                Visibility::When(c) => field.cond = Some(c),
                _ => {}
            }
            fields.push(field);
        }

        self.qc.selects[id].fields = fields;
        Ok(())
    }

    /// Resolve a leaf field. `None` drops it from the output.
    fn scalar_field(
        &self,
        id: usize,
        f: &AstField,
        name: &str,
        perms: &QueryPerms,
    ) -> Result<Option<FieldKind>, CompileError> {
        let sel = &self.qc.selects[id];
        let table = self.schema.table(sel.tid);

        if name == "__typename" {
            let t = match &sel.typ {
                SelType::Member(t) => t.clone(),
                _ => table.name.clone(),
            };
            return Ok(Some(FieldKind::Typename(t)));
        }
        if name == "search_rank" {
            if sel.search.is_none() {
                return Err(CompileError::arg(f.key(), "search", "search_rank needs a search argument"));
            }
            return Ok(Some(FieldKind::SearchRank));
        }

        if let Some(col) = table.column(name) {
            if !self.column_allowed(&table.name, &col.name, col.blocked, perms)? {
                return Ok(None);
            }
            return Ok(Some(FieldKind::Col(col.clone())));
        }

        let functions_off = self.conf.disable_functions || perms.disable_functions;

        if let Some((func, cname)) = name.split_once('_') {
            if AGGREGATES.contains(&func) {
                if let Some(col) = table.column(cname) {
                    if functions_off {
                        return Ok(None);
                    }
                    if !self.column_allowed(&table.name, &col.name, col.blocked, perms)? {
                        return Ok(None);
                    }
                    return Ok(Some(FieldKind::Agg {
                        func: func.to_string(),
                        col: col.clone(),
                    }));
                }
            }
        }

        // function names may contain underscores, try every split
        for (i, _) in name.match_indices('_') {
            let (fname, cname) = (&name[..i], &name[i + 1..]);
            let (Some(func), Some(col)) = (self.schema.function(fname), table.column(cname)) else {
                continue;
            };
            if functions_off {
                return Ok(None);
            }
            if !self.column_allowed(&table.name, &col.name, col.blocked, perms)? {
                return Ok(None);
            }
            return Ok(Some(FieldKind::Func {
                name: func.name.clone(),
                col: col.clone(),
                agg: func.agg,
            }));
        }

        Err(SchemaError::ColumnNotFound(table.name.clone(), name.to_string()).into())
    }

    /// Blocklisted columns are always an error. Columns outside the role's
    /// list are dropped for anonymous requests and an error otherwise.
    fn column_allowed(
        &self,
        table: &str,
        col: &str,
        blocked: bool,
        perms: &QueryPerms,
    ) -> Result<bool, CompileError> {
        if !blocked && perms.allows(col) {
            return Ok(true);
        }
        if !blocked && self.role.is_anon() {
            return Ok(false);
        }
        Err(PermissionError::ColumnBlocked {
            table: table.to_string(),
            column: col.to_string(),
            role: self.role_name.to_string(),
        }
        .into())
    }

    /// Create the select for a nested field and queue it.
    fn child_select(
        &mut self,
        pid: usize,
        f: &AstField,
        name: &str,
        vis: &Visibility,
    ) -> Result<usize, CompileError> {
        let ptid = self.qc.selects[pid].tid;
        let through = directives::through(&f.directives, f.key())?;
        let not_related = directives::has(&f.directives, "notRelated");

        let named = if through.is_none() && !not_related {
            self.schema.rel_by_name(ptid, name)
        } else {
            None
        };

        let (cid, rel, name_singular) = match named {
            Some((cid, rel)) => (cid, Some(rel.clone()), false),
            None => {
                let tr = match directives::schema_name(&f.directives)? {
                    Some(schema) => self.schema.find_in(&schema, name),
                    None => self.schema.find(name),
                }
                .ok_or_else(|| SchemaError::TableNotFound(name.to_string()))?;

                let rel = if not_related {
                    None
                } else {
                    Some(self.schema.get_rel(tr.id, ptid, through.as_deref())?.clone())
                };
                (tr.id, rel, tr.singular)
            }
        };

        let mut sel = self.new_select(cid, f.key(), Some(pid));
        sel.singular = name_singular || directives::has(&f.directives, "object");

        if let Some(rel) = &rel {
            match rel.typ {
                RelType::OneToOne => sel.singular = true,
                RelType::Embedded => sel.singular |= singular(name) == name,
                RelType::Polymorphic => {
                    sel.typ = SelType::Union;
                    sel.singular = true;
                }
                RelType::Remote => sel.skip = Skip::Remote,
                RelType::Recursive => {
                    if f.arg("find").is_none() {
                        return Err(CompileError::arg(
                            f.key(),
                            "find",
                            "required for recursive relationships",
                        ));
                    }
                }
                RelType::OneToMany | RelType::OneToManyThrough => {}
            }
        }
        if self.schema.table(cid).typ == TableType::Virtual
            && !matches!(sel.typ, SelType::Union)
            && sel.skip != Skip::Remote
        {
            return Err(SchemaError::RelNotFound(name.to_string(), self.qc.selects[pid].table.clone()).into());
        }

        sel.rel = rel;
        match vis {
            Visibility::Null => sel.skip = Skip::Nulled,
            Visibility::When(c) => sel.cond = Some(c.clone()),
            _ => {}
        }

        let id = self.add_select(
            sel,
            Pending {
                args: Some(f.id),
                children: f.children.clone(),
            },
        );
        self.stack.push(id);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::super::tests::{compiler, open_config};
    use super::super::*;
    use crate::config::Config;

    fn compile(query: &str, role: &str) -> Result<QCode, CompileError> {
        compiler(&open_config()).compile(query, &Map::new(), role)
    }

    #[test]
    fn test_columns_and_aliases() {
        let qc = compile("{ products { id title: name } }", "user").unwrap();
        let f = &qc.selects[0].fields;
        assert_eq!(f[0].key, "id");
        assert_eq!(f[1].key, "title");
        assert_eq!(f[1].alias().as_deref(), Some("name"));
    }

    #[test]
    fn test_aggregates_and_functions() {
        let qc = compile("{ products { count_id max_price upcase_name } }", "user").unwrap();
        let sel = &qc.selects[0];
        assert!(matches!(&sel.fields[0].kind, FieldKind::Agg { func, .. } if func == "count"));
        assert_eq!(sel.fields[1].alias().as_deref(), Some("max_price"));
        assert!(matches!(&sel.fields[2].kind, FieldKind::Func { name, agg: false, .. } if name == "upcase"));
        assert!(sel.is_grouped());

        let mut conf = open_config();
        conf.disable_functions = true;
        let qc = compiler(&conf)
            .compile("{ products { id count_id upcase_name } }", &Map::new(), "user")
            .unwrap();
        assert_eq!(qc.selects[0].fields.len(), 1);
    }

    #[test]
    fn test_unknown_column() {
        assert!(matches!(
            compile("{ products { nope } }", "user"),
            Err(CompileError::Schema(SchemaError::ColumnNotFound(..)))
        ));
    }

    #[test]
    fn test_column_allow_list() {
        let conf = Config::from_json(
            r#"{ "roles": [
                { "name": "anon", "tables": [{ "name": "users", "query": { "columns": ["id", "full_name"] } }] },
                { "name": "user", "tables": [{ "name": "users", "query": { "columns": ["id", "full_name"] } }] }
            ] }"#,
        )
        .unwrap();
        let c = compiler(&conf);

        let qc = c.compile("{ users { id email } }", &Map::new(), "anon").unwrap();
        assert_eq!(qc.selects[0].fields.len(), 1);

        assert!(matches!(
            c.compile("{ users { id email } }", &Map::new(), "user"),
            Err(CompileError::Permission(PermissionError::ColumnBlocked { .. }))
        ));
    }

    #[test]
    fn test_blocklisted_column_errors() {
        let conf = open_config();
        let mut info = crate::schema::testdata::dbinfo();
        for t in info.tables.iter_mut() {
            for c in t.columns.iter_mut() {
                c.blocked |= c.name == "password";
            }
        }
        let schema = std::sync::Arc::new(DBSchema::new(&info, &[]).unwrap());
        let roles = std::sync::Arc::new(RoleRegistry::new(&conf, &schema).unwrap());
        let c = Compiler::new(schema, roles, CompilerConfig::from(&conf));

        assert!(matches!(
            c.compile("{ users { id password } }", &Map::new(), "anon"),
            Err(CompileError::Permission(PermissionError::ColumnBlocked { .. }))
        ));
    }

    #[test]
    fn test_role_directives_on_fields() {
        let q = r#"{ users { id email @skip(ifRole: "anon") full_name @remove(ifRole: "anon") } }"#;
        let qc = compile(q, "anon").unwrap();
        let f = &qc.selects[0].fields;
        assert_eq!(f.len(), 2);
        assert!(f[1].null);

        let qc = compile(q, "user").unwrap();
        assert_eq!(qc.selects[0].fields.len(), 3);
    }

    #[test]
    fn test_camelcase_fields() {
        let mut conf = open_config();
        conf.enable_camelcase = true;
        let qc = compiler(&conf)
            .compile("{ products { id ownerId owner { fullName } } }", &Map::new(), "user")
            .unwrap();
        assert_eq!(qc.selects[0].fields[1].key, "ownerId");
        assert_eq!(qc.selects[0].fields[1].alias().as_deref(), Some("owner_id"));
        assert_eq!(qc.selects[1].fields[0].alias().as_deref(), Some("full_name"));
    }

    #[test]
    fn test_through_directive_and_not_related() {
        let qc = compile(
            r#"{ customers { id products @through(table: "purchases") { id } users @notRelated { id } } }"#,
            "user",
        )
        .unwrap();
        let rel = qc.selects[1].rel.as_ref().unwrap();
        assert_eq!(rel.through.as_ref().unwrap().table, "purchases");
        assert!(qc.selects[2].rel.is_none());
    }

    #[test]
    fn test_typename() {
        let qc = compile("{ products { __typename id } }", "user").unwrap();
        assert_eq!(qc.selects[0].fields[0].kind, FieldKind::Typename("products".into()));
    }
}
