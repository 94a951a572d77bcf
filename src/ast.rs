#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    Query,
    Mutation,
    Subscription,
}

/// A parsed GraphQL operation. Fields live in a flat arena and reference
/// each other by index; `roots` lists the top level selections.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub typ: OpType,
    pub name: String,
    pub var_defs: Vec<VarDef>,
    pub directives: Vec<Directive>,
    pub fields: Vec<Field>,
    pub roots: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarDef {
    pub name: String,
    pub typ: String,
    pub required: bool,
    pub default: Option<Node>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub id: usize,
    pub parent_id: Option<usize>,
    pub name: String,
    pub alias: Option<String>,
    pub args: Vec<Arg>,
    pub directives: Vec<Directive>,
    pub children: Vec<usize>,
    /// Set for fields selected inside `... on Type { }`
    pub type_cond: Option<String>,
}

impl Field {
    /// Output key: the alias when given, else the name.
    pub fn key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn arg(&self, name: &str) -> Option<&Arg> {
        self.args.iter().find(|a| a.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Arg {
    pub name: String,
    pub val: Node,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Directive {
    pub name: String,
    pub args: Vec<Arg>,
}

impl Directive {
    pub fn arg(&self, name: &str) -> Option<&Arg> {
        self.args.iter().find(|a| a.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
    /// Bare enum-like value such as `desc` or `children`
    Label(String),
    Var(String),
    List(Vec<Node>),
    Obj(Vec<(String, Node)>),
}

impl Node {
    pub fn kind(&self) -> &'static str {
        match self {
            Node::Str(_) => "string",
            Node::Int(_) => "int",
            Node::Float(_) => "float",
            Node::Bool(_) => "boolean",
            Node::Null => "null",
            Node::Label(_) => "label",
            Node::Var(_) => "variable",
            Node::List(_) => "list",
            Node::Obj(_) => "object",
        }
    }

    /// String value of scalar nodes, used where strings and labels are
    /// interchangeable (`order_by: { id: desc }` vs `"desc"`).
    pub fn as_text(&self) -> Option<String> {
        match self {
            Node::Str(s) | Node::Label(s) => Some(s.clone()),
            Node::Int(n) => Some(n.to_string()),
            Node::Float(f) => Some(f.to_string()),
            Node::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Node> {
        match self {
            Node::Obj(items) => items.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Convert a literal into JSON. Variables are rendered as `"$name"`.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            Node::Str(s) | Node::Label(s) => Value::String(s.clone()),
            Node::Int(n) => Value::from(*n),
            Node::Float(f) => Value::from(*f),
            Node::Bool(b) => Value::Bool(*b),
            Node::Null => Value::Null,
            Node::Var(v) => Value::String(format!("${}", v)),
            Node::List(items) => Value::Array(items.iter().map(Node::to_json).collect()),
            Node::Obj(items) => Value::Object(
                items
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}
