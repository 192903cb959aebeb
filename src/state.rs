use crate::source::{SourceDescriptor, SourceId};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

/// 受管进程的生命周期状态
///
/// `Stopping`/`Stopped` 只出现在被移出进程表之后的快照中
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Running,
    CrashedAwaitingRestart,
    /// 超过最大重试次数，等待下一轮对账再尝试
    Degraded,
    Stopping,
    Stopped,
}

/// 进程表中的一项 (Source ID -> ManagedProcess)
pub struct ManagedProcess {
    /// 启动时使用的源信息，崩溃重启时复用
    pub source: SourceDescriptor,
    /// 启动时解析出的接入地址，用于检测配置变更
    pub uri: Url,
    /// 每次启动递增，用于过滤过期的退出通知
    pub generation: u64,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub started_at: Instant,
    /// 连续崩溃次数
    pub crash_count: u32,
    /// 下次允许尝试重启的最早时间点
    pub next_retry_at: Option<Instant>,
    /// 取消后退出观察任务会杀掉子进程，或放弃待执行的重启
    pub cancel: CancellationToken,
    /// 退出观察任务或重启定时任务
    pub task: Option<JoinHandle<()>>,
}

impl ManagedProcess {
    pub fn new(source: SourceDescriptor, uri: Url, generation: u64) -> Self {
        Self {
            source,
            uri,
            generation,
            state: ProcessState::Starting,
            pid: None,
            started_at: Instant::now(),
            crash_count: 0,
            next_retry_at: None,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        ProcessSnapshot {
            id: self.source.id,
            state: self.state,
            pid: self.pid,
            crash_count: self.crash_count,
            next_retry_at: self.next_retry_at,
        }
    }
}

/// 进程表的只读视图
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub id: SourceId,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub crash_count: u32,
    pub next_retry_at: Option<Instant>,
}
