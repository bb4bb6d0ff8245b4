use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use snapdex::config::Config;
use snapdex::core::{ContentSource, IndexMode, MemoryContentStore, Mutation, StoreRef};
use snapdex::index::{IndexBackend, IndexTracker, MemoryBackend};
use snapdex::query::{IndexContext, QueryRegistry, QueryServer};
use snapdex::stats::IndexReport;
use snapdex::storage::{BackupCoordinator, BackupOutcome};

#[derive(Parser, Debug)]
#[command(name = "snapdex")]
#[command(about = "Snapshot-consistent search index with pluggable query languages")]
struct Args {
    /// 配置文件（默认 ~/.config/snapdex/config.toml）
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// HTTP 端口
    #[arg(short, long)]
    port: Option<u16>,

    /// 索引落盘目录
    #[arg(long, value_name = "DIR")]
    index_root: Option<PathBuf>,

    /// 纯内存索引（忽略 index root）
    #[arg(long)]
    in_memory: bool,

    /// 启动时重放的内容提交（JSON）
    #[arg(long, value_name = "FILE")]
    seed: Option<PathBuf>,

    /// 备份到目录后退出
    #[arg(long, value_name = "DIR")]
    backup: Option<PathBuf>,

    /// 打印索引状态后退出
    #[arg(long)]
    report: bool,
}

/// `{"stores": [{"name": "site", "mode": "asynchronous", "commits": [[{"op": "put", ...}]]}]}`
#[derive(Deserialize)]
struct Seed {
    stores: Vec<SeedStore>,
}

#[derive(Deserialize)]
struct SeedStore {
    name: String,
    #[serde(default)]
    mode: Option<IndexMode>,
    #[serde(default)]
    commits: Vec<Vec<Mutation>>,
}

fn load_seed(path: &Path) -> anyhow::Result<Seed> {
    let text = std::fs::read_to_string(path).with_context(|| format!("read seed {:?}", path))?;
    serde_json::from_str(&text).with_context(|| format!("parse seed {:?}", path))
}

/// 把 seed 提交写入内容存储（索引在 recover 之后再补齐）
fn replay_content(content: &MemoryContentStore, seed: &Seed) -> anyhow::Result<()> {
    for s in &seed.stores {
        let store = StoreRef::new(s.name.as_str());
        content.create_store(&store);
        for commit in &s.commits {
            content.commit(&store, commit.clone())?;
        }
        info!(
            "Seeded store {} up to snapshot {:?}",
            store,
            content.head(&store)
        );
    }
    Ok(())
}

/// 索引缺失则整树创建，落后则逐个快照追平
fn catch_up(
    tracker: &IndexTracker,
    content: &MemoryContentStore,
    seed: &Seed,
    default_mode: IndexMode,
) -> anyhow::Result<()> {
    for s in &seed.stores {
        let store = StoreRef::new(s.name.as_str());
        let mode = s.mode.unwrap_or(default_mode);
        if !tracker.has_index_been_created(&store) {
            tracker.create_index(&store, mode)?;
            continue;
        }
        let Some(head) = content.head(&store) else {
            continue;
        };
        let known = tracker
            .status()
            .into_iter()
            .find(|st| st.store == store.as_str())
            .and_then(|st| st.last_known)
            .unwrap_or(0);
        for dst in (known + 1)..=head {
            tracker.index(&store, dst - 1, dst, mode)?;
        }
        if head > known {
            info!("Store {} caught up {} -> {}", store, known, head);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut cfg = Config::load(args.config.as_deref())?;
    if let Some(root) = args.index_root {
        cfg.index.root = Some(root);
    }
    if args.in_memory {
        cfg.index.root = None;
    }
    if let Some(port) = args.port {
        cfg.server.port = port;
    }

    info!("Starting snapdex: index root {:?}", cfg.index.root);

    let backend: Arc<dyn IndexBackend> = match &cfg.index.root {
        Some(root) => Arc::new(MemoryBackend::open(root.clone())?),
        None => Arc::new(MemoryBackend::in_memory()),
    };
    let content = Arc::new(MemoryContentStore::new());
    let seed = args.seed.as_deref().map(load_seed).transpose()?;
    if let Some(seed) = &seed {
        replay_content(&content, seed)?;
    }

    let tracker = IndexTracker::start(content.clone(), backend.clone(), cfg.tracker_options())?;
    let recovered = tracker.recover()?;
    info!(
        "Recovered {} store(s), replayed {} pending task(s)",
        recovered.stores, recovered.replayed
    );
    if let Some(seed) = &seed {
        catch_up(&tracker, &content, seed, cfg.index.default_mode)?;
    }

    let backup = Arc::new(BackupCoordinator::new(tracker.clone()));

    if let Some(target) = args.backup {
        tracker.wait_idle(std::time::Duration::from_secs(60));
        match backup.backup(&target)? {
            BackupOutcome::Completed { files, bytes } => {
                info!("Backup written to {:?}: {} files, {} bytes", target, files, bytes)
            }
            BackupOutcome::AlreadyRunning => info!("Backup already running"),
        }
        return Ok(());
    }

    if args.report {
        tracker.wait_idle(std::time::Duration::from_secs(60));
        println!("{}", IndexReport::collect(&tracker));
        return Ok(());
    }

    let registry = Arc::new(QueryRegistry::with_builtin(IndexContext::new(backend.clone())));
    let mut server =
        QueryServer::new(registry, tracker.clone()).with_query_config(cfg.query.clone());
    if let Some(target) = cfg.backup.target.clone() {
        server = server.with_backup(backup.clone(), target);
    }
    let port = cfg.server.port;
    tokio::spawn(async move {
        if let Err(e) = server.run(port).await {
            tracing::error!("Query server stopped: {}", e);
        }
    });

    info!("snapdex ready. Query via: http://localhost:{}/search?q=keyword&store=<store>", port);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    tracker.wait_idle(std::time::Duration::from_secs(5));
    if let Err(e) = backend.flush() {
        tracing::warn!("Final flush failed: {}", e);
    }

    Ok(())
}
