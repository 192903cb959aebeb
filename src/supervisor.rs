use crate::config::{RetryPolicy, TranscoderConfig};
use crate::engine::Engine;
use crate::error::SupervisorError;
use crate::source::{redacted, SourceDescriptor, SourceId};
use crate::state::{ManagedProcess, ProcessSnapshot, ProcessState};
use crate::store::SegmentStore;
use std::collections::HashMap;
use std::io;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use url::Url;

/// `ensure_started` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// 新启动了一个转码进程
    Spawned,
    /// 该源已在进程表中 (启动中、运行中或等待重启)
    AlreadyTracked,
}

/// 转码进程监管器
///
/// 进程表是唯一的共享可变状态，由对账循环和异步的退出观察任务共同修改，
/// 所有修改都在内部互斥锁下完成。锁内不执行阻塞的系统调用。
pub struct Supervisor {
    store: SegmentStore,
    transcoder: TranscoderConfig,
    retry: RetryPolicy,
    processes: Mutex<HashMap<SourceId, ManagedProcess>>,
    generations: AtomicU64,
    tasks: TaskTracker,
}

impl Supervisor {
    pub fn new(store: SegmentStore, transcoder: TranscoderConfig, retry: RetryPolicy) -> Arc<Self> {
        Arc::new(Self {
            store,
            transcoder,
            retry,
            processes: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
            tasks: TaskTracker::new(),
        })
    }

    fn table(&self) -> MutexGuard<'_, HashMap<SourceId, ManagedProcess>> {
        self.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// 进程表中的所有源 ID (升序)
    pub fn live_ids(&self) -> Vec<SourceId> {
        let mut ids: Vec<_> = self.table().keys().copied().collect();
        ids.sort();
        ids
    }

    /// 该源是否需要 `ensure_started` 真正去启动进程
    pub fn needs_start(&self, id: SourceId) -> bool {
        self.table()
            .get(&id)
            .map_or(true, |p| p.state == ProcessState::Degraded)
    }

    /// 该源当前进程所使用的接入地址
    pub fn tracked_uri(&self, id: SourceId) -> Option<Url> {
        self.table().get(&id).map(|p| p.uri.clone())
    }

    pub fn snapshot(&self) -> Vec<ProcessSnapshot> {
        let mut list: Vec<_> = self.table().values().map(ManagedProcess::snapshot).collect();
        list.sort_by_key(|p| p.id);
        list
    }

    /// 确保指定源有一个转码进程
    ///
    /// # 副作用
    /// - 创建源切片目录 (已有文件保留)
    /// - 启动子进程并挂载退出观察任务
    ///
    /// # 错误处理
    /// - 接入地址缺失或非法时返回 `Configuration`，不登记进程
    /// - 内存不足、目录创建失败、子进程启动失败时返回错误，不留下进程表项
    pub async fn ensure_started(
        self: &Arc<Self>,
        source: &SourceDescriptor,
    ) -> Result<StartOutcome, SupervisorError> {
        let uri = source.resolve_uri()?;
        let generation = self.next_generation();

        let cancel = {
            let mut table = self.table();
            match table.get_mut(&source.id) {
                Some(entry) if entry.state == ProcessState::Degraded => {
                    info!("Source [{}] leaving degraded state, retrying.", source.id);
                    entry.source = source.clone();
                    entry.uri = uri.clone();
                    entry.generation = generation;
                    entry.state = ProcessState::Starting;
                    entry.crash_count = 0;
                    entry.next_retry_at = None;
                    entry.cancel.clone()
                }
                Some(_) => return Ok(StartOutcome::AlreadyTracked),
                None => {
                    let entry = ManagedProcess::new(source.clone(), uri.clone(), generation);
                    let cancel = entry.cancel.clone();
                    table.insert(source.id, entry);
                    cancel
                }
            }
        };

        info!(
            "Starting source [{}] ({}). Input: {}",
            source.id,
            source.name,
            redacted(&uri)
        );
        self.launch(source.id, &uri, generation, cancel).await?;
        Ok(StartOutcome::Spawned)
    }

    /// 停止指定源的转码进程
    ///
    /// 立即从进程表移除，随后强制杀掉子进程并等待其退出。
    /// 切片目录保留。源不存在时返回 `None`。
    ///
    /// 若该源正处于启动中 (子进程尚未创建)，本函数不等待；
    /// 启动流程发现表项已移除后会自行杀掉刚创建的子进程。
    pub async fn stop(&self, id: SourceId) -> Option<ProcessSnapshot> {
        let mut entry = self.table().remove(&id)?;

        entry.state = ProcessState::Stopping;
        entry.cancel.cancel();
        if let Some(task) = entry.task.take() {
            if let Err(e) = task.await {
                warn!("Observer task for source [{}] failed: {}", id, e);
            }
        }

        entry.state = ProcessState::Stopped;
        entry.pid = None;
        info!("Source [{}] stopped.", id);
        Some(entry.snapshot())
    }

    /// 停止所有进程并等待全部后台任务结束
    pub async fn shutdown(&self) {
        let ids = self.live_ids();
        info!("Stopping {} managed transcoder(s)", ids.len());
        for id in ids {
            self.stop(id).await;
        }
        self.tasks.close();
        self.tasks.wait().await;
    }

    async fn launch(
        self: &Arc<Self>,
        id: SourceId,
        uri: &Url,
        generation: u64,
        cancel: CancellationToken,
    ) -> Result<(), SupervisorError> {
        let child = match self.spawn_transcoder(id, uri).await {
            Ok(child) => child,
            Err(e) => {
                self.discard(id, generation);
                return Err(e);
            }
        };
        let pid = child.id();

        // 观察任务在锁内挂载，保证它看到的表项已是 Running
        let orphan = {
            let mut table = self.table();
            match table.get_mut(&id).filter(|p| p.generation == generation) {
                Some(entry) => {
                    let this = Arc::clone(self);
                    let task = self
                        .tasks
                        .spawn(async move { this.observe(id, generation, child, cancel).await });
                    entry.state = ProcessState::Running;
                    entry.pid = pid;
                    entry.started_at = Instant::now();
                    entry.task = Some(task);
                    debug!("Source [{}] running as pid {:?}", id, pid);
                    None
                }
                None => Some(child),
            }
        };

        // 启动期间被 stop 移除：没有观察任务接管，在这里杀掉
        if let Some(mut child) = orphan {
            debug!("Source [{}] was stopped while starting, killing pid {:?}", id, pid);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill transcoder for source [{}]: {}", id, e);
            }
        }
        Ok(())
    }

    async fn spawn_transcoder(&self, id: SourceId, uri: &Url) -> Result<Child, SupervisorError> {
        Engine::check_memory(self.transcoder.min_free_memory_kb)?;

        self.store
            .prepare(id)
            .await
            .map_err(|source| SupervisorError::Store {
                path: self.store.source_dir(id),
                source,
            })?;

        let cmd = Engine::command(&self.transcoder, &self.store, id, uri.as_str());
        Engine::spawn(cmd, id, &self.tasks)
    }

    fn discard(&self, id: SourceId, generation: u64) {
        let mut table = self.table();
        if table.get(&id).is_some_and(|p| p.generation == generation) {
            table.remove(&id);
        }
    }

    /// 退出观察任务：取消时杀掉子进程，否则等待其退出并交给 `handle_exit`
    async fn observe(
        self: Arc<Self>,
        id: SourceId,
        generation: u64,
        mut child: Child,
        cancel: CancellationToken,
    ) {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill transcoder for source [{}]: {}", id, e);
                }
                return;
            }
        };
        self.handle_exit(id, generation, status);
    }

    /// 子进程退出回调
    ///
    /// 表项仍在且代数一致说明是意外退出：按退避策略安排重启。
    /// 表项已被 `stop` 移除时不做任何事。
    fn handle_exit(self: &Arc<Self>, id: SourceId, generation: u64, status: io::Result<ExitStatus>) {
        let mut table = self.table();
        let Some(entry) = table
            .get_mut(&id)
            .filter(|p| p.generation == generation)
        else {
            debug!("Source [{}] transcoder exited after stop", id);
            return;
        };

        let status = match status {
            Ok(s) => s.to_string(),
            Err(e) => format!("wait error: {}", e),
        };

        if entry.started_at.elapsed() >= self.retry.stable_after() {
            entry.crash_count = 0;
        }
        entry.pid = None;
        entry.task = None;

        if self.retry.exhausted(entry.crash_count) {
            entry.state = ProcessState::Degraded;
            entry.next_retry_at = None;
            error!(
                "Source [{}] exited with {} and reached max retry attempts ({}). Marked degraded.",
                id, status, self.retry.max_attempts
            );
            return;
        }

        let delay = self.retry.backoff(entry.crash_count);
        entry.crash_count += 1;
        entry.state = ProcessState::CrashedAwaitingRestart;
        entry.next_retry_at = Some(Instant::now() + delay);
        warn!(
            "Source [{}] exited unexpectedly with {}. Restart #{} in {}ms.",
            id,
            status,
            entry.crash_count,
            delay.as_millis()
        );

        let this = Arc::clone(self);
        let cancel = entry.cancel.clone();
        entry.task = Some(self.tasks.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => this.restart(id, generation).await,
                _ = cancel.cancelled() => {}
            }
        }));
    }

    async fn restart(self: Arc<Self>, id: SourceId, expected: u64) {
        let generation = self.next_generation();
        let (uri, cancel) = {
            let mut table = self.table();
            let Some(entry) = table.get_mut(&id).filter(|p| {
                p.generation == expected && p.state == ProcessState::CrashedAwaitingRestart
            }) else {
                return;
            };
            entry.generation = generation;
            entry.state = ProcessState::Starting;
            entry.next_retry_at = None;
            (entry.uri.clone(), entry.cancel.clone())
        };

        info!("Supervisor: Attempting to restart source [{}]", id);
        if let Err(e) = self.launch(id, &uri, generation, cancel).await {
            error!("Restart failed [{}]: {}", id, e);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::ConfigurationError;
    use std::path::Path;
    use std::time::Duration;

    const LONG_RUNNING: &str = "exec sleep 30";
    const CRASH: &str = "exit 1";

    /// 用 `/bin/sh -c` 代替 FFmpeg，每次启动向日志追加一行
    fn transcoder(log: &Path, body: &str) -> TranscoderConfig {
        let script = format!("echo \"$@\" >> '{}'; {}", log.display(), body);
        TranscoderConfig {
            ffmpeg_binary: "/bin/sh".to_string(),
            extra_args: vec!["-c".to_string(), script, "transcoder".to_string()],
            min_free_memory_kb: 0,
            ..TranscoderConfig::default()
        }
    }

    fn retry(backoff_ms: u64, max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: backoff_ms,
            max_backoff_ms: backoff_ms,
            stable_after_sec: 30,
        }
    }

    fn source(id: u64, uri: &str) -> SourceDescriptor {
        SourceDescriptor {
            id: SourceId(id),
            name: format!("cam-{}", id),
            connection_uri: Some(uri.to_string()),
            ip_address: None,
            stream_url: None,
            device: None,
        }
    }

    fn launches(log: &Path) -> usize {
        std::fs::read_to_string(log)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cond()
    }

    async fn setup(body: &str, retry: RetryPolicy) -> (tempfile::TempDir, Arc<Supervisor>) {
        let tmp = tempfile::tempdir().unwrap();
        let store = SegmentStore::init(tmp.path().join("hls")).await.unwrap();
        let supervisor = Supervisor::new(store, transcoder(&tmp.path().join("launches.log"), body), retry);
        (tmp, supervisor)
    }

    fn state_of(supervisor: &Supervisor, id: u64) -> Option<ProcessState> {
        supervisor
            .snapshot()
            .into_iter()
            .find(|p| p.id == SourceId(id))
            .map(|p| p.state)
    }

    #[tokio::test]
    async fn ensure_started_is_idempotent() {
        let (tmp, supervisor) = setup(LONG_RUNNING, retry(50, 0)).await;
        let log = tmp.path().join("launches.log");
        let cam = source(1, "rtsp://10.0.0.1/live");

        assert_eq!(supervisor.ensure_started(&cam).await.unwrap(), StartOutcome::Spawned);
        assert_eq!(
            supervisor.ensure_started(&cam).await.unwrap(),
            StartOutcome::AlreadyTracked
        );

        assert!(wait_until(Duration::from_secs(5), || launches(&log) == 1).await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(launches(&log), 1);
        assert_eq!(supervisor.live_ids(), vec![SourceId(1)]);
        assert_eq!(state_of(&supervisor, 1), Some(ProcessState::Running));
        assert!(!supervisor.needs_start(SourceId(1)));

        let args = std::fs::read_to_string(&log).unwrap();
        assert!(args.contains("rtsp://10.0.0.1/live"));
        assert!(args.contains("cctv_1/index.m3u8"));
        assert!(tmp.path().join("hls/cctv_1").is_dir());

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_uri_registers_nothing() {
        let (_tmp, supervisor) = setup(LONG_RUNNING, retry(50, 0)).await;
        let mut cam = source(2, "");
        cam.connection_uri = None;

        let err = supervisor.ensure_started(&cam).await.unwrap_err();
        assert!(matches!(
            err,
            SupervisorError::Configuration(ConfigurationError::MissingUri(SourceId(2)))
        ));

        let err = supervisor
            .ensure_started(&source(3, "::not-a-uri"))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Configuration(_)));
        assert!(supervisor.live_ids().is_empty());
    }

    #[tokio::test]
    async fn spawn_failure_leaves_no_entry() {
        let (_tmp, supervisor) = {
            let tmp = tempfile::tempdir().unwrap();
            let store = SegmentStore::init(tmp.path()).await.unwrap();
            let cfg = TranscoderConfig {
                ffmpeg_binary: tmp.path().join("missing-ffmpeg").to_string_lossy().into_owned(),
                min_free_memory_kb: 0,
                ..TranscoderConfig::default()
            };
            (tmp, Supervisor::new(store, cfg, retry(50, 0)))
        };

        let err = supervisor
            .ensure_started(&source(4, "rtsp://cam"))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn { id: SourceId(4), .. }));
        assert!(supervisor.live_ids().is_empty());
        assert!(supervisor.needs_start(SourceId(4)));
    }

    #[tokio::test]
    async fn stop_kills_process_and_keeps_directory() {
        let (tmp, supervisor) = setup(LONG_RUNNING, retry(50, 0)).await;
        let log = tmp.path().join("launches.log");

        supervisor.ensure_started(&source(1, "rtsp://cam")).await.unwrap();
        assert!(wait_until(Duration::from_secs(5), || launches(&log) == 1).await);
        let pid = supervisor.snapshot()[0].pid.unwrap();
        let marker = tmp.path().join("hls/cctv_1/segment_000.ts");
        std::fs::write(&marker, b"ts").unwrap();

        let stopped = supervisor.stop(SourceId(1)).await.unwrap();
        assert_eq!(stopped.state, ProcessState::Stopped);
        assert!(supervisor.live_ids().is_empty());
        assert!(supervisor.stop(SourceId(1)).await.is_none());

        // 停止后不应触发重启
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(launches(&log), 1);
        assert!(supervisor.live_ids().is_empty());
        assert!(marker.exists());

        let alive = std::process::Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .status()
            .unwrap();
        assert!(!alive.success());
    }

    #[tokio::test]
    async fn stop_during_start_leaves_no_process() {
        let tmp = tempfile::tempdir().unwrap();
        let pids = tmp.path().join("pids");
        let body = format!("echo $$ >> '{}'; exec sleep 30", pids.display());
        let (_hls, supervisor) = setup(&body, retry(50, 0)).await;
        let cam = source(8, "rtsp://cam");

        // 启动在创建目录时让出，stop 在子进程创建前移除表项
        let (started, stopped) =
            tokio::join!(supervisor.ensure_started(&cam), supervisor.stop(SourceId(8)));
        assert_eq!(started.unwrap(), StartOutcome::Spawned);
        assert_eq!(stopped.unwrap().state, ProcessState::Stopped);
        assert!(supervisor.live_ids().is_empty());
        assert!(supervisor.needs_start(SourceId(8)));

        tokio::time::sleep(Duration::from_millis(300)).await;
        let recorded = std::fs::read_to_string(&pids).unwrap_or_default();
        for pid in recorded.lines() {
            let alive = std::process::Command::new("kill")
                .arg("-0")
                .arg(pid)
                .status()
                .unwrap();
            assert!(!alive.success(), "pid {} survived stop", pid);
        }

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn crash_restarts_once_after_backoff() {
        let tmp_marker = tempfile::tempdir().unwrap();
        let first_run = tmp_marker.path().join("crashed-once");
        // 第一次启动崩溃，之后正常运行
        let body = format!(
            "if [ -f '{m}' ]; then exec sleep 30; else touch '{m}'; exit 1; fi",
            m = first_run.display()
        );
        let (tmp, supervisor) = setup(&body, retry(300, 0)).await;
        let log = tmp.path().join("launches.log");

        let started = Instant::now();
        supervisor.ensure_started(&source(9, "rtsp://cam")).await.unwrap();
        let marker = tmp.path().join("hls/cctv_9/keep.txt");
        std::fs::write(&marker, b"x").unwrap();

        assert!(wait_until(Duration::from_secs(5), || launches(&log) == 2).await);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(
            wait_until(Duration::from_secs(2), || {
                state_of(&supervisor, 9) == Some(ProcessState::Running)
            })
            .await
        );

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(launches(&log), 2);
        assert_eq!(supervisor.snapshot()[0].crash_count, 1);
        assert!(marker.exists());

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn stop_cancels_pending_restart() {
        let (tmp, supervisor) = setup(CRASH, retry(500, 0)).await;
        let log = tmp.path().join("launches.log");

        supervisor.ensure_started(&source(5, "rtsp://cam")).await.unwrap();
        assert!(
            wait_until(Duration::from_secs(5), || {
                state_of(&supervisor, 5) == Some(ProcessState::CrashedAwaitingRestart)
            })
            .await
        );
        // 等待重启期间仍算已登记
        assert_eq!(
            supervisor.ensure_started(&source(5, "rtsp://cam")).await.unwrap(),
            StartOutcome::AlreadyTracked
        );

        supervisor.stop(SourceId(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(launches(&log), 1);
        assert!(supervisor.live_ids().is_empty());
    }

    #[tokio::test]
    async fn degraded_after_max_attempts_until_next_start() {
        let (tmp, supervisor) = setup(CRASH, retry(50, 1)).await;
        let log = tmp.path().join("launches.log");
        let cam = source(6, "rtsp://cam");

        supervisor.ensure_started(&cam).await.unwrap();
        assert!(
            wait_until(Duration::from_secs(5), || {
                state_of(&supervisor, 6) == Some(ProcessState::Degraded)
            })
            .await
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(launches(&log), 2);
        assert_eq!(supervisor.live_ids(), vec![SourceId(6)]);
        assert!(supervisor.needs_start(SourceId(6)));

        assert_eq!(supervisor.ensure_started(&cam).await.unwrap(), StartOutcome::Spawned);
        assert!(wait_until(Duration::from_secs(5), || launches(&log) >= 3).await);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_every_process() {
        let (tmp, supervisor) = setup(LONG_RUNNING, retry(50, 0)).await;
        let log = tmp.path().join("launches.log");

        for id in 1..=3 {
            supervisor
                .ensure_started(&source(id, &format!("rtsp://cam-{}", id)))
                .await
                .unwrap();
        }
        assert!(wait_until(Duration::from_secs(5), || launches(&log) == 3).await);
        assert_eq!(supervisor.live_ids().len(), 3);

        supervisor.shutdown().await;
        assert!(supervisor.live_ids().is_empty());
        assert_eq!(supervisor.tracked_uri(SourceId(1)), None);
    }
}
