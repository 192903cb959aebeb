use crate::source::SourceDescriptor;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub transcoder: TranscoderConfig,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    pub registry: RegistryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen: String,

    /// HLS 切片存储根目录
    /// 建议配置为 /dev/shm/cctv-hls 以保护闪存寿命
    #[serde(default = "default_hls_root")]
    pub hls_root: String,
}

/// 转码进程的固定参数，所有源共用，不提供按源覆盖
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TranscoderConfig {
    pub ffmpeg_binary: String,
    /// 插入在可执行文件之后、生成参数之前的额外参数
    pub extra_args: Vec<String>,
    pub segment_duration_sec: u32,
    /// 播放列表保留的切片数量 (旧切片由 FFmpeg 删除)
    pub playlist_size: u32,
    pub frame_rate: u32,
    pub max_width: u32,
    pub video_bitrate_kbps: u32,
    /// 可用内存低于该值 (KB) 时拒绝启动新进程，0 表示不检查
    pub min_free_memory_kb: u64,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_binary: "ffmpeg".to_string(),
            extra_args: Vec::new(),
            segment_duration_sec: 2,
            playlist_size: 4,
            frame_rate: 25,
            max_width: 1280,
            video_bitrate_kbps: 1024,
            min_free_memory_kb: 5120,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// 两次对账之间的间隔
    pub interval_ms: u64,
    /// 同一轮对账中相邻两次新启动之间的间隔
    pub stagger_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            stagger_ms: 1_500,
        }
    }
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryPolicy {
    /// 最大重试次数 (0 表示无限重试)
    pub max_attempts: u32,
    /// 初始退避时间 (毫秒)
    pub initial_backoff_ms: u64,
    /// 最大退避时间 (毫秒)，与初始值相同时即为固定间隔
    pub max_backoff_ms: u64,
    /// 进程稳定运行超过该时长 (秒) 后崩溃计数清零
    pub stable_after_sec: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_backoff_ms: 2_000,
            max_backoff_ms: 2_000,
            stable_after_sec: 30,
        }
    }
}

impl RetryPolicy {
    /// 第 `crash_count` 次崩溃后的退避时间 (指数退避，封顶 `max_backoff_ms`)
    pub fn backoff(&self, crash_count: u32) -> Duration {
        let factor = 2u64.saturating_pow(crash_count);
        let ms = std::cmp::min(
            self.max_backoff_ms.max(self.initial_backoff_ms),
            self.initial_backoff_ms.saturating_mul(factor),
        );
        Duration::from_millis(ms)
    }

    pub fn exhausted(&self, crash_count: u32) -> bool {
        self.max_attempts > 0 && crash_count >= self.max_attempts
    }

    pub fn stable_after(&self) -> Duration {
        Duration::from_secs(self.stable_after_sec)
    }
}

/// 摄像头源列表的来源
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegistryConfig {
    /// 每次轮询时重新读取的 YAML / JSON 文件
    File { path: String },
    /// 直接写在配置文件中的源列表
    Static {
        #[serde(default)]
        sources: Vec<SourceDescriptor>,
    },
}

const MAX_FRAME_RATE: u32 = 120;
const MAX_SEGMENT_DURATION_SEC: u32 = 60;
const MAX_VIDEO_BITRATE_KBPS: u32 = 100_000;

fn default_hls_root() -> String {
    "./static/hls".to_string()
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.reconciler.interval_ms == 0 {
            anyhow::bail!("reconciler.interval_ms must be greater than zero");
        }
        if self.transcoder.segment_duration_sec == 0 || self.transcoder.playlist_size == 0 {
            anyhow::bail!("transcoder.segment_duration_sec and playlist_size must be non-zero");
        }
        let t = &self.transcoder;
        if t.frame_rate == 0 || t.frame_rate > MAX_FRAME_RATE {
            anyhow::bail!("transcoder.frame_rate must be within 1..={}", MAX_FRAME_RATE);
        }
        if t.segment_duration_sec > MAX_SEGMENT_DURATION_SEC {
            anyhow::bail!(
                "transcoder.segment_duration_sec must not exceed {}",
                MAX_SEGMENT_DURATION_SEC
            );
        }
        if t.video_bitrate_kbps == 0 || t.video_bitrate_kbps > MAX_VIDEO_BITRATE_KBPS {
            anyhow::bail!(
                "transcoder.video_bitrate_kbps must be within 1..={}",
                MAX_VIDEO_BITRATE_KBPS
            );
        }
        Ok(())
    }
}
