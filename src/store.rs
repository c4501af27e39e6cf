use crate::error::RelayError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

/// 持久化的源定义行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub key: String,
    pub source: String,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub lazy: bool,
}

/// 源定义的持久层: 以 key 为主键的表, 落在单个 YAML 文件里
///
/// 引擎只依赖三个操作: 查重插入、全量扫描、按 key 删除。
/// 查重与插入在同一把锁下完成, 并发创建同一 key 时只有一个能成功。
pub struct SourceStore {
    path: PathBuf,
    records: Mutex<Vec<SourceRecord>>,
}

impl SourceStore {
    /// 打开存储文件并全量加载; 文件不存在视为空表
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, RelayError> {
        let path = path.as_ref().to_path_buf();
        let records = match fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => Vec::new(),
            Ok(content) => serde_yaml::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(RelayError::StoreIo(e)),
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// 全量快照, 启动加载用
    pub async fn all(&self) -> Vec<SourceRecord> {
        self.records.lock().await.clone()
    }

    /// 查重并插入; key 已存在时返回 DuplicateKey
    pub async fn create(&self, record: SourceRecord) -> Result<(), RelayError> {
        let mut records = self.records.lock().await;
        if records.iter().any(|r| r.key == record.key) {
            return Err(RelayError::DuplicateKey(record.key));
        }
        records.push(record);
        if let Err(e) = self.flush(&records).await {
            // 落盘失败回滚内存, 保持内存与文件一致
            records.pop();
            return Err(e);
        }
        Ok(())
    }

    /// 按 key 删除; key 不存在时为空操作
    pub async fn remove(&self, key: &str) -> Result<(), RelayError> {
        let mut records = self.records.lock().await;
        let pos = match records.iter().position(|r| r.key == key) {
            Some(pos) => pos,
            None => return Ok(()),
        };
        let removed = records.remove(pos);
        if let Err(e) = self.flush(&records).await {
            records.insert(pos, removed);
            return Err(e);
        }
        Ok(())
    }

    /// 整表写入临时文件后原子替换
    async fn flush(&self, records: &[SourceRecord]) -> Result<(), RelayError> {
        let content = serde_yaml::to_string(records)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("cam-relay-store-{}-{}.yaml", tag, std::process::id()))
    }

    fn record(key: &str) -> SourceRecord {
        SourceRecord {
            key: key.to_string(),
            source: "rtsp://camera.local/main".to_string(),
            resolution: None,
            lazy: false,
        }
    }

    #[tokio::test]
    async fn create_then_reload_round_trips() {
        let path = temp_path("round-trip");
        let _ = fs::remove_file(&path).await;

        let store = SourceStore::open(&path).await.unwrap();
        store
            .create(SourceRecord {
                key: "cam1".to_string(),
                source: "rtsp://camera.local/ch1".to_string(),
                resolution: Some("640x480".to_string()),
                lazy: true,
            })
            .await
            .unwrap();
        store.create(record("cam2")).await.unwrap();

        let reopened = SourceStore::open(&path).await.unwrap();
        let mut rows = reopened.all().await;
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key, "cam1");
        assert_eq!(rows[0].resolution.as_deref(), Some("640x480"));
        assert!(rows[0].lazy);
        assert_eq!(rows[1], record("cam2"));

        let _ = fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn duplicate_key_is_rejected() {
        let path = temp_path("duplicate");
        let _ = fs::remove_file(&path).await;

        let store = SourceStore::open(&path).await.unwrap();
        store.create(record("cam1")).await.unwrap();
        let err = store.create(record("cam1")).await;
        assert!(matches!(err, Err(RelayError::DuplicateKey(_))));
        assert_eq!(store.all().await.len(), 1);

        let _ = fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let path = temp_path("remove");
        let _ = fs::remove_file(&path).await;

        let store = SourceStore::open(&path).await.unwrap();
        store.create(record("cam1")).await.unwrap();
        store.remove("cam1").await.unwrap();
        store.remove("cam1").await.unwrap();
        store.remove("never-existed").await.unwrap();

        let reopened = SourceStore::open(&path).await.unwrap();
        assert!(reopened.all().await.is_empty());

        let _ = fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let path = temp_path("missing");
        let _ = fs::remove_file(&path).await;

        let store = SourceStore::open(&path).await.unwrap();
        assert!(store.all().await.is_empty());
    }
}
