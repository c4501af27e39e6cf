use serde::Deserialize;
use std::path::Path;
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// 常驻源复活扫描的退避策略
    pub retry: RetryPolicy,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,

    /// ffmpeg 可执行文件路径
    /// 留空则自动探测: 可执行文件同级目录, 其次环境变量 PATH
    pub ffmpeg_binary: String,

    /// 源定义持久化文件
    pub data_file: String,

    /// 复活扫描间隔 (毫秒)
    pub supervisor_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:10019".to_string(),
            ffmpeg_binary: String::new(),
            data_file: "data.yaml".to_string(),
            supervisor_interval_ms: 3000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryPolicy {
    /// 初始退避时间 (秒)
    pub initial_backoff_sec: u64,
    /// 最大退避时间 (秒)
    pub max_backoff_sec: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff_sec: 2,
            max_backoff_sec: 60,
        }
    }
}

impl AppConfig {
    /// 加载配置文件; 文件不存在时退回默认值, 网关可以零配置运行
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let mut config = if path.as_ref().exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_yaml::from_str::<AppConfig>(&content)?
        } else {
            info!("config file {:?} not found, using defaults", path.as_ref());
            AppConfig::default()
        };
        if config.server.ffmpeg_binary.is_empty() {
            config.server.ffmpeg_binary = resolve_ffmpeg();
        }
        Ok(config)
    }
}

/// 未显式配置 ffmpeg 时的探测顺序: 可执行文件同级目录, 其次 PATH
fn resolve_ffmpeg() -> String {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join("ffmpeg");
            if sibling.exists() {
                info!("using sibling ffmpeg: {}", sibling.display());
                return sibling.to_string_lossy().into_owned();
            }
        }
    }
    info!("ffmpeg not found next to the executable, relying on PATH");
    "ffmpeg".to_string()
}
