use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::IndexMode;
use crate::index::TrackerOptions;
use crate::query::params::{SearchParameters, DEFAULT_LIMIT};

pub const CONFIG_FILE: &str = "config.toml";

/// 配置文件：缺省的 section / 字段一律取默认值
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub index: IndexConfig,
    pub worker: WorkerConfig,
    pub query: QueryConfig,
    pub server: ServerConfig,
    pub backup: BackupConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// None = 纯内存索引
    pub root: Option<PathBuf>,
    pub default_mode: IndexMode,
    /// 异步任务是否写 pending log（需要 root）
    pub pending_log: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            root: dirs::data_local_dir().map(|d| d.join("snapdex")),
            default_mode: IndexMode::Synchronous,
            pending_log: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub queue_capacity: usize,
    /// 0 = num_cpus
    pub threads: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            threads: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub default_limit: usize,
    pub max_permission_checks: Option<usize>,
    pub max_permission_check_time_millis: Option<u64>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_LIMIT,
            max_permission_checks: None,
            max_permission_check_time_millis: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 6060 }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub target: Option<PathBuf>,
}

impl QueryConfig {
    /// 请求未指定时套用的默认值
    pub fn apply(&self, params: &mut SearchParameters) {
        params.limit = self.default_limit;
        if params.max_permission_checks.is_none() {
            params.max_permission_checks = self.max_permission_checks;
        }
        if params.max_permission_check_time_millis.is_none() {
            params.max_permission_check_time_millis = self.max_permission_check_time_millis;
        }
    }
}

impl Config {
    /// `~/.config/snapdex/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("snapdex").join(CONFIG_FILE))
    }

    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        toml::from_str(text).context("invalid config")
    }

    /// 显式路径必须存在；默认路径不存在时使用默认配置
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let (path, required) = match explicit {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };
        if !path.exists() {
            if required {
                anyhow::bail!("config file {:?} does not exist", path);
            }
            tracing::debug!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {:?}", path))?;
        let cfg = Self::from_toml(&text).with_context(|| format!("in {:?}", path))?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(cfg)
    }

    pub fn tracker_options(&self) -> TrackerOptions {
        let mut opts = TrackerOptions {
            queue_capacity: self.worker.queue_capacity.max(1),
            ..Default::default()
        };
        if self.worker.threads > 0 {
            opts.worker_threads = self.worker.threads;
        }
        if self.index.pending_log {
            opts.pending_log_dir = self.index.root.as_ref().map(|r| r.join("pending"));
        }
        opts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("snapdex-config-{}-{}", tag, nanos))
    }

    #[test]
    fn partial_config_fills_defaults() {
        let cfg = Config::from_toml(
            r#"
            [index]
            root = "/var/lib/snapdex"
            default_mode = "asynchronous"

            [worker]
            threads = 3

            [backup]
            target = "/backups/snapdex"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.index.root, Some(PathBuf::from("/var/lib/snapdex")));
        assert_eq!(cfg.index.default_mode, IndexMode::Asynchronous);
        assert!(cfg.index.pending_log);
        assert_eq!(cfg.server.port, 6060);
        assert_eq!(cfg.query.default_limit, DEFAULT_LIMIT);

        let opts = cfg.tracker_options();
        assert_eq!(opts.worker_threads, 3);
        assert_eq!(opts.queue_capacity, 1024);
        assert_eq!(
            opts.pending_log_dir,
            Some(PathBuf::from("/var/lib/snapdex/pending"))
        );
    }

    #[test]
    fn pending_log_disabled_leaves_tracker_in_memory() {
        let cfg = Config::from_toml("[index]\npending_log = false\n").unwrap();
        assert_eq!(cfg.tracker_options().pending_log_dir, None);
        assert!(Config::from_toml("[server]\nport = \"x\"\n").is_err());
    }

    #[test]
    fn query_defaults_only_fill_unset_budgets() {
        let cfg = Config::from_toml("[query]\ndefault_limit = 50\nmax_permission_checks = 10\n").unwrap();
        let mut p = SearchParameters::default();
        cfg.query.apply(&mut p);
        assert_eq!(p.limit, 50);
        assert_eq!(p.max_permission_checks, Some(10));

        let mut p = SearchParameters {
            max_permission_checks: Some(2),
            ..Default::default()
        };
        cfg.query.apply(&mut p);
        assert_eq!(p.max_permission_checks, Some(2));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = unique_tmp_dir("load");
        assert!(Config::load(Some(&dir.join(CONFIG_FILE))).is_err());

        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(CONFIG_FILE);
        std::fs::write(&path, "[server]\nport = 7070\n").unwrap();
        assert_eq!(Config::load(Some(&path)).unwrap().server.port, 7070);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
