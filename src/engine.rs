use crate::error::RelayError;
use crate::state::{RecoveryState, SharedState, Source};
use bytes::Bytes;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// 进程输出的固定读块大小
const READ_CHUNK: usize = 1024;

/// 启动前的最低可用内存阈值 (KB)
const MIN_FREE_MEM_KB: u64 = 5120;

pub struct Engine;

impl Engine {
    /// 按 key 启动源的转码进程
    pub fn start_source(state: &SharedState, key: &str) -> Result<(), RelayError> {
        let mut sources = state.sources.lock().unwrap();
        match sources.get_mut(key) {
            Some(src) => Self::start(state, src),
            None => Err(RelayError::UnknownKey(key.to_string())),
        }
    }

    /// 启动一个源的转码进程; 调用方需持有源表锁
    ///
    /// 已在运行时为空操作。spawn 是同步调用, 整个启动决策在锁内完成,
    /// 不会与并发的接入/断开事件交错。
    ///
    /// # 错误处理
    /// - 可用内存低于阈值时拒绝启动
    /// - spawn 失败时 alive 保持 false, 是否重试由调用方决定
    pub fn start(state: &SharedState, src: &mut Source) -> Result<(), RelayError> {
        if src.alive {
            return Ok(());
        }

        // 检查系统可用内存
        match sys_info::mem_info() {
            Ok(mem) if mem.avail < MIN_FREE_MEM_KB => {
                return Err(RelayError::LowMemory { avail: mem.avail });
            }
            Ok(_) => {}
            Err(e) => warn!("failed to check memory usage: {}", e),
        }

        let args = build_args(&src.source, src.resolution.as_deref());
        let mut cmd = Command::new(&state.config.server.ffmpeg_binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("failed to spawn transcoder for [{}]: {}", src.key, e);
                return Err(RelayError::SpawnFailed {
                    key: src.key.clone(),
                    source: e,
                });
            }
        };

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.start_kill();
                return Err(RelayError::SpawnFailed {
                    key: src.key.clone(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "transcoder stdout not captured",
                    ),
                });
            }
        };
        let stderr = child.stderr.take();

        // 代号全局递增, 旧实例的退出事件不可能与新实例撞号
        let generation = state.generations.fetch_add(1, Ordering::Relaxed) + 1;
        src.generation = generation;
        src.alive = true;
        src.process = Some(child);

        info!(
            "transcoder started for [{}] (generation {})",
            src.key, generation
        );

        tokio::spawn(pump_output(
            state.clone(),
            src.key.clone(),
            generation,
            stdout,
            src.feed.clone(),
        ));
        if let Some(stderr) = stderr {
            tokio::spawn(pump_stderr(src.key.clone(), stderr));
        }

        Ok(())
    }

    /// 摘除进程句柄并无条件清除 alive; 从未启动或已停止时为空操作
    ///
    /// 实际终止由调用方拿着返回的句柄在锁外执行
    pub fn stop(src: &mut Source) -> Option<Child> {
        src.alive = false;
        src.process.take()
    }

    /// 强制终止子进程; 终止失败只记录, 不上抛
    pub async fn kill(key: &str, mut child: Child) {
        if let Err(e) = child.kill().await {
            warn!("failed to terminate transcoder for [{}]: {}", key, e);
        } else {
            info!("transcoder for [{}] terminated", key);
        }
    }

    /// 读取任务观察到进程终结; 仅当代号仍是当前代号时转换 alive
    pub fn mark_exited(state: &SharedState, key: &str, generation: u64) {
        let mut sources = state.sources.lock().unwrap();
        if let Some(src) = sources.get_mut(key) {
            if src.generation != generation {
                debug!(
                    "stale exit for [{}] (generation {} superseded by {})",
                    key, generation, src.generation
                );
                return;
            }
            src.alive = false;
            src.process = None;
            warn!("transcoder for [{}] exited (generation {})", key, generation);
            if !src.lazy {
                Self::record_failure(state, key);
            }
        }
    }

    /// 记录一次启动失败或进程崩溃, 推进指数退避窗口
    pub fn record_failure(state: &SharedState, key: &str) {
        let policy = &state.config.retry;
        let mut recovery = state.recovery.lock().unwrap();
        let rec = recovery.entry(key.to_string()).or_insert(RecoveryState {
            crash_count: 0,
            next_retry_at: None,
        });

        let exp = rec.crash_count.min(16);
        let backoff = std::cmp::min(
            policy.max_backoff_sec,
            policy.initial_backoff_sec.saturating_mul(2u64.pow(exp)),
        );
        rec.crash_count += 1;
        rec.next_retry_at = Some(Instant::now() + Duration::from_secs(backoff));

        warn!(
            "source [{}] failure #{}, backing off for {}s",
            key, rec.crash_count, backoff
        );
    }

    /// 启动成功后清零退避状态
    pub fn clear_recovery(state: &SharedState, key: &str) {
        state.recovery.lock().unwrap().remove(key);
    }
}

/// 读取转码进程的输出并广播给所有观看端
///
/// 固定大小读块; 读到 EOF 或出错即认为该代进程终结,
/// alive 的 true→false 转换只发生在这里 (经 mark_exited 的代号判定)
async fn pump_output(
    state: SharedState,
    key: String,
    generation: u64,
    mut stdout: ChildStdout,
    feed: broadcast::Sender<Bytes>,
) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                // 无观看端时发送失败, 直接丢弃
                let _ = feed.send(Bytes::copy_from_slice(&buf[..n]));
            }
            Err(e) => {
                warn!("read error from transcoder for [{}]: {}", key, e);
                break;
            }
        }
    }
    Engine::mark_exited(&state, &key, generation);
}

/// 把转码进程的诊断输出转入日志, 不混进媒体流
async fn pump_stderr(key: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            warn!("[{}] ffmpeg: {}", key, line);
        }
    }
}

/// 构建 ffmpeg 调用参数
///
/// 非本地文件的源加 TCP 传输提示; 实时读入;
/// 固定输出 mpegts/mpeg1video/24fps/700k; 可选分辨率覆盖; 写到标准输出
pub fn build_args(source: &str, resolution: Option<&str>) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    if !Path::new(source).exists() {
        args.extend(["-rtsp_transport", "tcp"].map(String::from));
    }
    args.extend(
        [
            "-re", "-i", source, "-f", "mpegts", "-codec:v", "mpeg1video", "-nostats", "-r", "24",
            "-b:v", "700k",
        ]
        .map(String::from),
    );
    if let Some(res) = resolution {
        args.extend(["-s", res].map(String::from));
    }
    args.extend(["-", "-loglevel", "error"].map(String::from));
    args
}
