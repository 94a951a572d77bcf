use std::collections::HashMap;
use std::env;
use std::fs;
use std::process;
use std::sync::Arc;

use graphsql::qcode::roles::RoleRegistry;
use graphsql::schema::Blocklist;
use graphsql::schema::describe::write_schema;
use graphsql::sql::load_ddl;
use graphsql::{Compiler, CompilerConfig, Config, DBSchema, Dialect, Renderer};
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

fn usage(prog: &str) -> ! {
    eprintln!("Usage: {} <schema.sql> [query.gql] [options]", prog);
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c, --config <file>    Config file (JSON)");
    eprintln!("  -d, --dialect <name>   postgres, mysql or auto (default: auto)");
    eprintln!("  -r, --role <name>      Role to compile for (default: user)");
    eprintln!("  -V, --vars <json>      Query variables");
    eprintln!("  -s, --schema           Print the schema description instead");
    process::exit(1);
}

fn fail(msg: impl std::fmt::Display) -> ! {
    eprintln!("{}", msg);
    process::exit(1);
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        usage(&args[0]);
    }

    let mut inputs: Vec<String> = Vec::new();
    let mut config_path: Option<String> = None;
    let mut dialect = Dialect::Auto;
    let mut role = "user".to_string();
    let mut vars = Map::new();
    let mut print_schema = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                i += 1;
                config_path = Some(args.get(i).cloned().unwrap_or_else(|| usage(&args[0])));
            }
            "-d" | "--dialect" => {
                i += 1;
                let name = args.get(i).unwrap_or_else(|| usage(&args[0]));
                dialect = Dialect::parse(name).unwrap_or_else(|| fail(format!("Invalid dialect: {}", name)));
            }
            "-r" | "--role" => {
                i += 1;
                role = args.get(i).cloned().unwrap_or_else(|| usage(&args[0]));
            }
            "-V" | "--vars" => {
                i += 1;
                let text = args.get(i).unwrap_or_else(|| usage(&args[0]));
                vars = match serde_json::from_str(text) {
                    Ok(Value::Object(m)) => m,
                    Ok(_) => fail("Variables must be a JSON object"),
                    Err(e) => fail(format!("Invalid variables: {}", e)),
                };
            }
            "-s" | "--schema" => print_schema = true,
            a if a.starts_with('-') => fail(format!("Unknown option: {}", a)),
            a => inputs.push(a.to_string()),
        }
        i += 1;
    }

    let conf = match &config_path {
        Some(p) => Config::load(p).unwrap_or_else(|e| fail(format!("Failed to load {}: {}", p, e))),
        None => Config::default(),
    };
    if let Err(e) = conf.validate() {
        fail(e);
    }

    let ddl_path = inputs.first().unwrap_or_else(|| usage(&args[0]));
    let ddl = fs::read_to_string(ddl_path).unwrap_or_else(|e| fail(format!("Failed to read {}: {}", ddl_path, e)));

    let blocklist = Blocklist::new(&conf.blocklist).unwrap_or_else(|e| fail(e));
    let info = load_ddl(&ddl, dialect, &blocklist).unwrap_or_else(|e| fail(format!("Schema error: {}", e)));

    if print_schema {
        print!("{}", write_schema(&info));
        return;
    }

    let query_path = inputs.get(1).unwrap_or_else(|| usage(&args[0]));
    let query = fs::read_to_string(query_path).unwrap_or_else(|e| fail(format!("Failed to read {}: {}", query_path, e)));

    let schema = DBSchema::new(&info, &conf.overlays()).unwrap_or_else(|e| fail(e));
    let schema = Arc::new(schema);
    let roles = RoleRegistry::new(&conf, &schema).unwrap_or_else(|e| fail(e));
    let compiler = Compiler::new(schema.clone(), Arc::new(roles), CompilerConfig::from(&conf));

    let qc = compiler
        .compile(&query, &vars, &role)
        .unwrap_or_else(|e| fail(format!("Compile error: {}", e)));

    let presets: HashMap<String, String> = conf.vars.clone();
    let renderer = Renderer::new(Dialect::from_db_type(&info.typ), presets);
    let stmt = renderer
        .render(&qc, &schema)
        .unwrap_or_else(|e| fail(format!("Render error: {}", e)));

    println!("{}", stmt.sql);
    if !stmt.meta.is_empty() {
        println!();
        for (n, p) in stmt.meta.params().iter().enumerate() {
            let array = if p.array { "[]" } else { "" };
            println!("${}: {} {}{}", n + 1, p.name, p.typ, array);
        }
    }
}
