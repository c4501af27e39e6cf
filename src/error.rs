use thiserror::Error;

/// 网关核心操作的错误分类
///
/// 进程终止失败与单个观看端的投递失败不在此列, 它们在故障点
/// 记录日志并就地消化, 不会上抛给调用方。
#[derive(Debug, Error)]
pub enum RelayError {
    /// 创建时 key 已存在 (内存或持久层)
    #[error("same key: {0}")]
    DuplicateKey(String),

    /// 操作指向不存在的 key
    #[error("unknown key: {0}")]
    UnknownKey(String),

    /// 转码进程启动失败
    #[error("failed to spawn transcoder for [{key}]: {source}")]
    SpawnFailed {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// 系统可用内存低于启动阈值
    #[error("insufficient system memory ({avail} KB available)")]
    LowMemory { avail: u64 },

    /// 持久层 IO 失败
    #[error("store io: {0}")]
    StoreIo(#[from] std::io::Error),

    /// 持久层编解码失败
    #[error("store codec: {0}")]
    StoreCodec(#[from] serde_yaml::Error),
}
