use anyhow::{Context, Result};
use query_expander::config::{self, SchemaConfig};
use query_expander::fetch::{csv_to_set, DataFetcher, FetchRequest, Representation, TimeWindow};
use query_expander::sql_compiler::{ParamValue, Statement};
use query_expander::SelectExpansion;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use sea_query::PostgresQueryBuilder;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CONFIG_FILE: &str = "schema_config.json";

/// 初始化日志，优先使用 RUST_LOG
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// 优先使用JSON配置，失败时使用内置目录
fn load_config() -> SchemaConfig {
    match SchemaConfig::from_json_file(CONFIG_FILE) {
        Ok(config) => {
            println!("✅ 成功从JSON配置文件加载实体定义: {}", CONFIG_FILE);
            config
        }
        Err(e) => {
            println!("⚠️ 无法加载JSON配置文件 ({}), 使用内置目录", e);
            SchemaConfig::default()
        }
    }
}

/// 交互会话状态
struct Session {
    scope: Vec<String>,
    request: FetchRequest,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            scope: vec!["station".to_string(), "parent".to_string()],
            request: FetchRequest::default(),
        }
    }
}

fn print_help() {
    println!("\n[命令]:");
    println!("  scope a,b,c            设置实体定义范围");
    println!("  select x,y             设置选择列表 (空或 * 表示全部)");
    println!("  filter <expr>          设置过滤表达式 (不带参数则清除)");
    println!("  repr flat|tree[,edge]  设置表示方式 (默认为节点)");
    println!("  show                   展开并编译当前会话");
    println!("  stations [types]       生成测站查询");
    println!("  types [types] [dtypes] 生成测站与数据类型查询");
    println!("  measurements [types] [dtypes] [from] [to]");
    println!("  stationtypes           生成测站类型查询");
    println!("  edges [types]          生成边查询 (需要边表示)");
    println!("  edgetypes              生成边类型查询 (需要边表示)");
    println!("  help | quit");
}

fn print_statement(statement: &Statement) {
    println!("\n[生成的 SQL]:");
    println!("{}", statement.sql);
    if !statement.params.is_empty() {
        println!("\n[参数]:");
        for (name, value) in statement.params.iter() {
            match value {
                ParamValue::Scalar(v) => println!("  :{} = {:?}", name, v),
                ParamValue::List(vs) => println!("  :{} = {:?}", name, vs),
            }
        }
    }
    match statement.to_positional(&PostgresQueryBuilder) {
        Ok((sql, values)) => {
            println!("\n[PostgreSQL]:");
            println!("{}", sql);
            println!("值: {:?}", values.0);
        }
        Err(e) => println!("✗ 无法转换占位符: {}", e),
    }
}

fn show(session: &Session, engine: &SelectExpansion) {
    let scope: Vec<&str> = session.scope.iter().map(String::as_str).collect();
    match engine.expand(
        &session.request.select,
        session.request.filter.as_deref(),
        &scope,
    ) {
        Ok(expansion) => {
            println!("✓ 展开成功");
            println!("字段: {:?}", expansion.used_target_names());
            println!("实体: {:?}", expansion.used_def_names());
            println!("SELECT: {}", expansion.select_sql());
            if expansion.has_where() {
                println!("WHERE: {}", expansion.where_sql());
            }
        }
        Err(e) => println!("✗ [{}] {}", e.code(), e),
    }
}

fn arg_set(args: &[&str], i: usize) -> Vec<String> {
    args.get(i).map(|a| csv_to_set(a)).unwrap_or_else(|| vec!["*".to_string()])
}

/// 处理一行输入，返回 false 表示退出
fn handle(line: &str, session: &mut Session, engine: &SelectExpansion) -> bool {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    let args: Vec<&str> = rest.split_whitespace().collect();

    match command {
        "quit" | "exit" => return false,
        "help" => print_help(),
        "scope" => {
            session.scope = csv_to_set(rest);
            println!("范围: {:?}", session.scope);
        }
        "select" => session.request.select = rest.to_string(),
        "filter" => {
            session.request.filter = (!rest.is_empty()).then(|| rest.to_string());
        }
        "repr" => match rest.parse::<Representation>() {
            Ok(representation) => session.request.representation = representation,
            Err(e) => println!("✗ [{}] {}", e.code(), e),
        },
        "show" => show(session, engine),
        "stations" | "types" | "measurements" | "stationtypes" | "edges" | "edgetypes" => {
            let fetcher = DataFetcher::new(engine, session.request.clone());
            let result = match command {
                "stations" => fetcher.fetch_stations(&arg_set(&args, 0)),
                "types" => fetcher.fetch_stations_and_types(&arg_set(&args, 0), &arg_set(&args, 1)),
                "stationtypes" => fetcher.fetch_station_types(),
                "edges" => fetcher.fetch_edges(&arg_set(&args, 0)),
                "edgetypes" => fetcher.fetch_edge_types(),
                _ => {
                    let window = TimeWindow {
                        from: args.get(2).map(|s| s.to_string()),
                        to: args.get(3).map(|s| s.to_string()),
                    };
                    fetcher.fetch_measurements(&arg_set(&args, 0), &arg_set(&args, 1), &window)
                }
            };
            match result {
                Ok(query) => {
                    print_statement(&query.statement);
                    if let Some(tree) = query.tree {
                        println!("\n[层级]: {:?} (入口: {})", tree.hierarchy, tree.entry_point);
                    }
                }
                Err(e) => println!("✗ [{}] {}", e.code(), e),
            }
        }
        other => {
            warn!(command = other, "unknown command");
            println!("✗ 未知命令: {} (输入 help 查看帮助)", other);
        }
    }
    true
}

fn main() -> Result<()> {
    init_tracing();
    println!("--- Query Expander: 过滤表达式到 SQL 编译器 ---");

    let engine = config::setup(|| load_config().build()).context("无法初始化查询引擎")?;
    info!(
        entities = engine.schema().iter().count(),
        operators = engine.operators().len(),
        "query engine ready"
    );

    print_help();
    let mut session = Session::default();
    let mut rl = DefaultEditor::new()?;
    loop {
        match rl.readline("qe> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line);
                if !handle(line, &mut session, engine) {
                    break;
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
