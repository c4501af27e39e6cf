use crate::config::AppConfig;
use crate::store::{SourceRecord, SourceStore};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::process::Child;
use tokio::sync::broadcast;

/// 每个源的广播缓冲容量 (块数)
/// 慢观看端最多积压这么多块, 再多就会被踢出
pub const FEED_CAPACITY: usize = 512;

/// 已连接的观看端
/// 出站套接字由该观看端自己的 WebSocket 任务独占持有, 这里只记身份和时间
#[derive(Debug, Clone, Serialize)]
pub struct Viewer {
    pub key: String,
    pub time: DateTime<Utc>,
}

/// 运行时的源实例: 持久化定义 + 进程/观看端状态
pub struct Source {
    pub key: String,
    pub source: String,
    pub resolution: Option<String>,
    pub lazy: bool,
    /// 进程是否被认为在运行
    pub alive: bool,
    /// 当前进程实例的全局唯一代号, 用于甄别过期实例的退出事件
    pub generation: u64,
    /// 转码子进程句柄, 仅在 alive 期间持有
    pub process: Option<Child>,
    /// 广播端, 跨进程代存活; 观看端各持一个有界接收端
    pub feed: broadcast::Sender<Bytes>,
    /// 观看端表 (viewer key -> Viewer)
    pub viewers: HashMap<String, Viewer>,
}

impl Source {
    /// 从持久化行重建; alive=false, 观看端表为空
    pub fn from_record(record: SourceRecord) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            key: record.key,
            source: record.source,
            resolution: record.resolution,
            lazy: record.lazy,
            alive: false,
            generation: 0,
            process: None,
            feed,
            viewers: HashMap::new(),
        }
    }
}

/// 故障恢复状态 (仅常驻源)
pub struct RecoveryState {
    /// 连续失败次数
    pub crash_count: u32,
    /// 下次允许尝试重启的最早时间点
    pub next_retry_at: Option<Instant>,
}

/// 全局应用上下文
pub struct AppState {
    pub config: AppConfig,
    pub store: SourceStore,
    /// 源表 (key -> Source); 所有源/观看端状态变更都在这把锁下进行
    pub sources: Mutex<HashMap<String, Source>>,
    /// 恢复状态表 (key -> RecoveryState); 与 sources 同时持有时后取
    pub recovery: Mutex<HashMap<String, RecoveryState>>,
    /// 进程代号分配器
    pub generations: AtomicU64,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(config: AppConfig, store: SourceStore, records: Vec<SourceRecord>) -> SharedState {
        let sources = records
            .into_iter()
            .map(|r| (r.key.clone(), Source::from_record(r)))
            .collect();
        Arc::new(AppState {
            config,
            store,
            sources: Mutex::new(sources),
            recovery: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
        })
    }
}
