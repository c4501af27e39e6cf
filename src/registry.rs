use crate::engine::Engine;
use crate::error::RelayError;
use crate::state::{SharedState, Source, Viewer};
use crate::store::SourceRecord;
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use tokio::process::Child;
use tokio::sync::broadcast;
use tracing::{error, info};

/// /streamer/list 的序列化模型
#[derive(Debug, Serialize)]
pub struct SourceModel {
    pub key: String,
    pub source: String,
    pub resolution: Option<String>,
    pub lazy: bool,
    pub alive: bool,
    pub players: Vec<Viewer>,
}

/// 源表的编排层: 把观看端增减与进程启停决策绑在同一把锁下
pub struct Registry;

impl Registry {
    /// 新建源: 先持久化 (查重与插入原子), 再登记内存; 常驻源随即启动
    pub async fn create(state: &SharedState, record: SourceRecord) -> Result<(), RelayError> {
        // 内存先行查重, 避免对持久层的无谓写入
        {
            let sources = state.sources.lock().unwrap();
            if sources.contains_key(&record.key) {
                return Err(RelayError::DuplicateKey(record.key));
            }
        }

        state.store.create(record.clone()).await?;

        let key = record.key.clone();
        let lazy = record.lazy;
        {
            let mut sources = state.sources.lock().unwrap();
            let src = sources
                .entry(key.clone())
                .or_insert_with(|| Source::from_record(record));
            if !lazy {
                // 启动失败不影响创建结果, 复活扫描会继续重试
                if let Err(e) = Engine::start(state, src) {
                    error!("initial start failed for [{}]: {}", key, e);
                    Engine::record_failure(state, &key);
                }
            }
        }

        info!("source [{}] created", key);
        Ok(())
    }

    /// 删除源: 摘除内存项, 无条件停进程, 删除持久行; 对未知 key 幂等
    pub async fn delete(state: &SharedState, key: &str) -> Result<(), RelayError> {
        let removed = {
            let mut sources = state.sources.lock().unwrap();
            sources.remove(key)
        };
        state.recovery.lock().unwrap().remove(key);

        if let Some(mut src) = removed {
            if let Some(child) = Engine::stop(&mut src) {
                Engine::kill(key, child).await;
            }
            info!(
                "source [{}] deleted ({} viewers dropped)",
                key,
                src.viewers.len()
            );
            // src 在此释放, feed 发送端随之关闭,
            // 该源的所有观看端任务会收到 Closed 并自行退出
        }

        state.store.remove(key).await?;
        Ok(())
    }

    /// 全量快照; 只短暂持有源表锁
    pub fn list(state: &SharedState) -> Vec<SourceModel> {
        let sources = state.sources.lock().unwrap();
        let mut list: Vec<SourceModel> = sources
            .values()
            .map(|src| SourceModel {
                key: src.key.clone(),
                source: src.source.clone(),
                resolution: src.resolution.clone(),
                lazy: src.lazy,
                alive: src.alive,
                players: src.viewers.values().cloned().collect(),
            })
            .collect();
        list.sort_by(|a, b| a.key.cmp(&b.key));
        list
    }

    /// 观看端接入: 登记并订阅广播; 懒源在此按需启动
    ///
    /// 订阅与登记在同一把锁下完成, 观看端不会错过启动后的首批数据
    pub fn viewer_connected(
        state: &SharedState,
        key: &str,
        viewer_key: &str,
    ) -> Result<broadcast::Receiver<Bytes>, RelayError> {
        let mut sources = state.sources.lock().unwrap();
        let src = sources
            .get_mut(key)
            .ok_or_else(|| RelayError::UnknownKey(key.to_string()))?;

        src.viewers.insert(
            viewer_key.to_string(),
            Viewer {
                key: viewer_key.to_string(),
                time: Utc::now(),
            },
        );
        let rx = src.feed.subscribe();

        if src.lazy && !src.alive {
            // 启动失败只记录, 观看端保持连接, 下一次接入会再次尝试
            if let Err(e) = Engine::start(state, src) {
                error!("demand start failed for [{}]: {}", key, e);
            }
        }

        info!(
            "viewer [{}] joined [{}] ({} viewers)",
            viewer_key,
            key,
            src.viewers.len()
        );
        Ok(rx)
    }

    /// 观看端断开: 只作用于其接入时绑定的源; 懒源在观看端清零时停止
    pub async fn viewer_disconnected(state: &SharedState, key: &str, viewer_key: &str) {
        let child = {
            let mut sources = state.sources.lock().unwrap();
            match sources.get_mut(key) {
                Some(src) => {
                    if src.viewers.remove(viewer_key).is_none() {
                        // 双重关闭竞争, 幂等处理
                        return;
                    }
                    info!(
                        "viewer [{}] left [{}] ({} viewers)",
                        viewer_key,
                        key,
                        src.viewers.len()
                    );
                    if src.lazy && src.viewers.is_empty() && src.alive {
                        info!("source [{}] has no viewers, stopping", key);
                        Engine::stop(src)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(child) = child {
            Engine::kill(key, child).await;
        }
    }

    /// 停机收尾: 终止所有在跑的转码进程
    pub async fn stop_all(state: &SharedState) {
        let children: Vec<(String, Child)> = {
            let mut sources = state.sources.lock().unwrap();
            sources
                .values_mut()
                .filter_map(|src| Engine::stop(src).map(|child| (src.key.clone(), child)))
                .collect()
        };
        for (key, child) in children {
            Engine::kill(&key, child).await;
        }
    }
}
