use crate::engine::Engine;
use crate::error::RelayError;
use crate::state::SharedState;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// 常驻源的复活扫描
///
/// 每隔固定间隔检查所有非懒源, 不在运行且已过退避窗口的重新启动。
/// 启动失败推进退避, 永不放弃。
pub async fn start_supervisor(state: SharedState, interval_ms: u64) {
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
    loop {
        interval.tick().await;
        run_sweep(&state);
    }
}

/// 单轮扫描, 拆出便于测试
pub fn run_sweep(state: &SharedState) {
    let now = Instant::now();

    // 阶段 1: 收集待复活的源
    let candidates: Vec<String> = {
        let sources = state.sources.lock().unwrap();
        sources
            .values()
            .filter(|src| !src.lazy && !src.alive)
            .map(|src| src.key.clone())
            .collect()
    };

    // 阶段 2: 跳过仍在退避窗口内的, 其余重新启动
    for key in candidates {
        let due = {
            let recovery = state.recovery.lock().unwrap();
            recovery
                .get(&key)
                .and_then(|rec| rec.next_retry_at)
                .map_or(true, |at| now >= at)
        };
        if !due {
            continue;
        }

        info!("supervisor: attempting to restart source [{}]", key);
        match Engine::start_source(state, &key) {
            Ok(()) => Engine::clear_recovery(state, &key),
            // 扫描间隙里被删除的源, 跳过即可
            Err(RelayError::UnknownKey(_)) => {}
            Err(e) => {
                error!("restart failed for [{}]: {}", key, e);
                Engine::record_failure(state, &key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::registry::Registry;
    use crate::state::AppState;
    use crate::store::{SourceRecord, SourceStore};
    use std::path::PathBuf;

    async fn test_state(tag: &str, ffmpeg: &str) -> (SharedState, PathBuf) {
        let path = std::env::temp_dir().join(format!(
            "cam-relay-supervisor-{}-{}.yaml",
            tag,
            std::process::id()
        ));
        let _ = tokio::fs::remove_file(&path).await;
        let mut config = AppConfig::default();
        config.server.ffmpeg_binary = ffmpeg.to_string();
        let store = SourceStore::open(&path).await.unwrap();
        (AppState::new(config, store, Vec::new()), path)
    }

    fn eager(key: &str) -> SourceRecord {
        SourceRecord {
            key: key.to_string(),
            source: "rtsp://camera.local/main".to_string(),
            resolution: None,
            lazy: false,
        }
    }

    #[tokio::test]
    async fn sweep_revives_dead_eager_source() {
        let (state, path) = test_state("revive", "yes").await;
        Registry::create(&state, eager("cam1")).await.unwrap();
        assert!(state.sources.lock().unwrap().get("cam1").unwrap().alive);

        // 模拟进程崩溃
        let child = {
            let mut sources = state.sources.lock().unwrap();
            Engine::stop(sources.get_mut("cam1").unwrap())
        };
        if let Some(child) = child {
            Engine::kill("cam1", child).await;
        }
        assert!(!state.sources.lock().unwrap().get("cam1").unwrap().alive);

        // 等读取任务观察到退出并记完账, 再清退避窗口, 本轮立即重启
        tokio::time::sleep(Duration::from_millis(300)).await;
        Engine::clear_recovery(&state, "cam1");

        run_sweep(&state);
        assert!(state.sources.lock().unwrap().get("cam1").unwrap().alive);

        // 收尾
        Registry::stop_all(&state).await;
        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn sweep_respects_backoff_window() {
        let (state, path) = test_state("backoff", "/nonexistent/ffmpeg-binary").await;
        Registry::create(&state, eager("cam1")).await.unwrap();

        // 创建时的首次启动已失败并进入退避
        let first_count = state
            .recovery
            .lock()
            .unwrap()
            .get("cam1")
            .map(|rec| rec.crash_count)
            .unwrap();
        assert_eq!(first_count, 1);

        // 退避窗口未过, 本轮不应再尝试
        run_sweep(&state);
        let count = state
            .recovery
            .lock()
            .unwrap()
            .get("cam1")
            .map(|rec| rec.crash_count)
            .unwrap();
        assert_eq!(count, first_count);

        // 窗口过期后重试, 失败计数推进
        state
            .recovery
            .lock()
            .unwrap()
            .get_mut("cam1")
            .unwrap()
            .next_retry_at = Some(Instant::now());
        run_sweep(&state);
        let count = state
            .recovery
            .lock()
            .unwrap()
            .get("cam1")
            .map(|rec| rec.crash_count)
            .unwrap();
        assert_eq!(count, first_count + 1);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn sweep_ignores_lazy_sources() {
        let (state, path) = test_state("lazy-skip", "yes").await;
        Registry::create(
            &state,
            SourceRecord {
                key: "cam1".to_string(),
                source: "rtsp://camera.local/main".to_string(),
                resolution: None,
                lazy: true,
            },
        )
        .await
        .unwrap();

        run_sweep(&state);
        assert!(!state.sources.lock().unwrap().get("cam1").unwrap().alive);

        let _ = tokio::fs::remove_file(&path).await;
    }
}
