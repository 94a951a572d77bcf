use std::fmt;

use crate::ast::{Directive, Node};

use super::validate::Constraint;
use super::{CompileError, Ctx};

/// Include the value only when a boolean variable is (or is not) set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldCond {
    pub var: String,
    pub include: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Visibility {
    Show,
    Null,
    Drop,
    When(FieldCond),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheScope {
    #[default]
    Public,
    Private,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheControl {
    pub max_age: u32,
    pub scope: CacheScope,
}

impl fmt::Display for CacheControl {
    /// `Cache-Control` header value.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scope = match self.scope {
            CacheScope::Public => "public",
            CacheScope::Private => "private",
        };
        write!(f, "{}, max-age={}", scope, self.max_age)
    }
}

fn invalid(field: &str, d: &Directive, msg: impl Into<String>) -> CompileError {
    CompileError::InvalidDirective {
        field: field.to_string(),
        name: d.name.clone(),
        msg: msg.into(),
    }
}

fn str_arg(field: &str, d: &Directive, name: &str) -> Result<Option<String>, CompileError> {
    match d.arg(name).map(|a| &a.val) {
        None => Ok(None),
        Some(Node::Str(s)) | Some(Node::Label(s)) => Ok(Some(s.clone())),
        Some(n) => Err(invalid(field, d, format!("{} must be a string, found {}", name, n.kind()))),
    }
}

/// How role and variable directives change a field for this role.
pub(super) fn visibility(dirs: &[Directive], role: &str, field: &str) -> Result<Visibility, CompileError> {
    let mut vis = Visibility::Show;

    for d in dirs {
        let include = match d.name.as_str() {
            "skip" | "remove" => false,
            "include" | "add" => true,
            _ => continue,
        };

        if let Some(r) = str_arg(field, d, "ifRole")? {
            let hit = (r == role) != include;
            if hit {
                let v = if d.name == "add" || d.name == "remove" {
                    Visibility::Drop
                } else {
                    Visibility::Null
                };
                if v == Visibility::Drop || vis != Visibility::Drop {
                    vis = v;
                }
            }
            continue;
        }

        if d.name == "add" || d.name == "remove" {
            return Err(invalid(field, d, "ifRole is required"));
        }
        match d.arg("ifVar").map(|a| &a.val) {
            Some(Node::Var(v)) | Some(Node::Str(v)) => {
                if vis == Visibility::Show {
                    vis = Visibility::When(FieldCond {
                        var: v.clone(),
                        include,
                    });
                }
            }
            Some(n) => return Err(invalid(field, d, format!("ifVar expects a variable, found {}", n.kind()))),
            None => return Err(invalid(field, d, "ifRole or ifVar is required")),
        }
    }
    Ok(vis)
}

pub(super) fn has(dirs: &[Directive], name: &str) -> bool {
    dirs.iter().any(|d| d.name == name)
}

/// `@schema(name: "x")`
pub(super) fn schema_name(dirs: &[Directive]) -> Result<Option<String>, CompileError> {
    match dirs.iter().find(|d| d.name == "schema") {
        Some(d) => str_arg("", d, "name")?
            .map(Some)
            .ok_or_else(|| invalid("", d, "name is required")),
        None => Ok(None),
    }
}

/// `@through(table: "purchases")`
pub(super) fn through(dirs: &[Directive], field: &str) -> Result<Option<String>, CompileError> {
    match dirs.iter().find(|d| d.name == "through") {
        Some(d) => str_arg(field, d, "table")?
            .map(Some)
            .ok_or_else(|| invalid(field, d, "table is required")),
        None => Ok(None),
    }
}

impl Ctx<'_> {
    /// Directives on the operation itself.
    pub(super) fn op_directives(&mut self) -> Result<(), CompileError> {
        let name = self.op.name.clone();
        for d in &self.op.directives {
            match d.name.as_str() {
                "constraint" | "validate" => {
                    self.qc.constraints.push(Constraint::from_directive(d)?);
                }
                "cacheControl" => {
                    let max_age = match d.arg("maxAge").map(|a| &a.val) {
                        Some(Node::Int(n)) if *n >= 0 => u32::try_from(*n).unwrap_or(u32::MAX),
                        Some(n) => {
                            return Err(invalid(&name, d, format!("maxAge must be a positive integer, found {}", n.kind())));
                        }
                        None => 0,
                    };
                    let scope = match str_arg(&name, d, "scope")?.as_deref() {
                        None | Some("public") | Some("PUBLIC") => CacheScope::Public,
                        Some("private") | Some("PRIVATE") => CacheScope::Private,
                        Some(s) => return Err(invalid(&name, d, format!("unknown scope '{}'", s))),
                    };
                    self.qc.cache_control = Some(CacheControl { max_age, scope });
                }
                _ => return Err(invalid(&name, d, "unknown directive")),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn dirs(q: &str) -> Vec<Directive> {
        let op = parse(q).unwrap();
        op.fields[op.fields[op.roots[0]].children[0]].directives.clone()
    }

    #[test]
    fn test_role_directives() {
        let d = dirs(r#"{ users { email @skip(ifRole: "anon") } }"#);
        assert_eq!(visibility(&d, "anon", "email").unwrap(), Visibility::Null);
        assert_eq!(visibility(&d, "user", "email").unwrap(), Visibility::Show);

        let d = dirs(r#"{ users { email @include(ifRole: "user") } }"#);
        assert_eq!(visibility(&d, "anon", "email").unwrap(), Visibility::Null);
        assert_eq!(visibility(&d, "user", "email").unwrap(), Visibility::Show);

        let d = dirs(r#"{ users { email @add(ifRole: "admin") } }"#);
        assert_eq!(visibility(&d, "user", "email").unwrap(), Visibility::Drop);
        assert_eq!(visibility(&d, "admin", "email").unwrap(), Visibility::Show);

        let d = dirs(r#"{ users { email @remove(ifRole: "anon") } }"#);
        assert_eq!(visibility(&d, "anon", "email").unwrap(), Visibility::Drop);
    }

    #[test]
    fn test_var_directives() {
        let d = dirs("{ users { email @include(ifVar: $showEmail) } }");
        assert_eq!(
            visibility(&d, "user", "email").unwrap(),
            Visibility::When(FieldCond {
                var: "showEmail".into(),
                include: true
            })
        );

        let d = dirs("{ users { email @skip } }");
        assert!(visibility(&d, "user", "email").is_err());
    }

    #[test]
    fn test_cache_control_header() {
        let cc = CacheControl {
            max_age: 60,
            scope: CacheScope::Private,
        };
        assert_eq!(cc.to_string(), "private, max-age=60");
    }
}
