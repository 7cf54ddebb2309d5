#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use docview::index::{compile_definition, InvalidationPolicy, SIMPLE_LANGUAGE};
use docview::manager::{identity_of, ReplicatorConfig};
use docview::{Manager, ManagerOptions, QueryOptions};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "docview", version, about = "Incremental map/reduce views over JSON documents")]
struct Cli {
    /// Manager 配置（TOML）；缺省为内存存储
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 载入文档、定义视图、更新索引并打印结果
    Index {
        /// JSON 数组文件，每个元素是一个文档（`_id` 缺省时按位置编号）
        #[arg(long)]
        docs: Option<PathBuf>,
        /// simple 语言的 map 源码，例如 `emit(doc.type, doc._id)`
        #[arg(long)]
        map: String,
        /// `_count` / `_sum` / `_stats`
        #[arg(long)]
        reduce: Option<String>,
        #[arg(long, default_value = "db")]
        database: String,
        #[arg(long, default_value = "app/view")]
        view: String,
        /// 只返回该 key（JSON）
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        descending: bool,
        #[arg(long)]
        group: bool,
        #[arg(long)]
        include_docs: bool,
    },
    /// 校验复制配置并打印规范形式与身份
    Replicate {
        /// JSON 字符串或 `@file`
        properties: String,
    },
}

fn load_options(path: Option<&PathBuf>) -> anyhow::Result<ManagerOptions> {
    match path {
        Some(p) => ManagerOptions::from_toml_file(p)
            .with_context(|| format!("loading config {}", p.display())),
        None => Ok(ManagerOptions::in_memory()),
    }
}

fn read_json(arg: &str) -> anyhow::Result<Value> {
    let text = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?,
        None => arg.to_string(),
    };
    Ok(serde_json::from_str(&text)?)
}

fn run_index(
    options: ManagerOptions,
    docs: Option<PathBuf>,
    map: &str,
    reduce: Option<&str>,
    database: &str,
    view_name: &str,
    query: QueryOptions,
) -> anyhow::Result<()> {
    let manager = Manager::new(options)?;
    let db = manager.database_named(database, false)?;

    if let Some(path) = docs {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let Value::Array(items) = serde_json::from_str::<Value>(&text)? else {
            bail!("{} must contain a JSON array of documents", path.display());
        };
        let count = items.len();
        for (i, mut doc) in items.into_iter().enumerate() {
            let id = match doc.as_object_mut().and_then(|m| m.remove("_id")) {
                Some(Value::String(id)) => id,
                Some(other) => bail!("document #{} has a non-string _id: {}", i, other),
                None => format!("doc-{:06}", i),
            };
            db.put_document(&id, doc)?;
        }
        info!("Loaded {} documents into {}", count, database);
    }

    let view = db.view_named(view_name)?;
    let compiler = manager
        .shared()
        .compiler(SIMPLE_LANGUAGE)
        .context("simple compiler is not registered")?;
    let definition = compile_definition(compiler.as_ref(), map, reduce)?;
    view.set_definition(definition, InvalidationPolicy::Invalidate)?;

    let status = view.update_index()?;
    info!("Index update of {}: {}", view_name, status);

    for row in view.query(&query)? {
        match row.prefetched_document() {
            Some(doc) => println!("{}\t{}\t{}\t{}", row.key(), row.value(), row.doc_id().unwrap_or("-"), doc),
            None => println!("{}\t{}\t{}", row.key(), row.value(), row.doc_id().unwrap_or("-")),
        }
    }
    println!("{}", db.report());

    manager.close();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let options = load_options(cli.config.as_ref())?;

    match cli.command {
        Command::Index {
            docs,
            map,
            reduce,
            database,
            view,
            key,
            limit,
            descending,
            group,
            include_docs,
        } => {
            let mut query = QueryOptions::new()
                .descending(descending)
                .group(group)
                .include_docs(include_docs);
            if let Some(k) = key {
                query = query.keys(vec![read_json(&k)?]);
            }
            if let Some(n) = limit {
                query = query.limit(n);
            }
            // 同步索引在阻塞线程里跑，避免占住 async worker
            tokio::task::spawn_blocking(move || {
                run_index(options, docs, &map, reduce.as_deref(), &database, &view, query)
            })
            .await??;
        }
        Command::Replicate { properties } => {
            let props = read_json(&properties)?;
            let config = ReplicatorConfig::parse(&props)?;
            let canonical = config.canonical();
            println!("{}", serde_json::to_string_pretty(&canonical)?);
            println!("identity: {:016x}", identity_of(&canonical));
            println!("direction: {:?}  local: {}", config.direction(), config.local_database());
        }
    }
    Ok(())
}
