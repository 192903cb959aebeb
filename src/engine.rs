use crate::config::TranscoderConfig;
use crate::error::SupervisorError;
use crate::source::SourceId;
use crate::store::SegmentStore;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// FFmpeg 调用的构建与启动
pub struct Engine;

impl Engine {
    /// 构建转码命令
    ///
    /// 输入为单个接入地址，输出为源目录下的 `index.m3u8` 与 `segment_NNN.ts`。
    /// 编码参数固定：限制帧率、宽度与码率，GOP 等于一个切片时长，
    /// 播放列表只保留 `playlist_size` 个切片，旧切片由 FFmpeg 删除。
    pub fn command(
        cfg: &TranscoderConfig,
        store: &SegmentStore,
        id: SourceId,
        input: &str,
    ) -> Command {
        let fps = cfg.frame_rate.to_string();
        let gop = cfg.frame_rate.saturating_mul(cfg.segment_duration_sec).to_string();
        let bitrate = format!("{}k", cfg.video_bitrate_kbps);
        let bufsize = format!("{}k", cfg.video_bitrate_kbps.saturating_mul(2));
        let video_filter = format!(
            "scale='min({},iw)':-2,setpts=N/{}/TB",
            cfg.max_width, cfg.frame_rate
        );

        let mut cmd = Command::new(&cfg.ffmpeg_binary);
        cmd.args(&cfg.extra_args);
        cmd.arg("-hide_banner").arg("-y");

        // 输入
        if input.starts_with("rtsp://") || input.starts_with("rtsps://") {
            cmd.args(["-rtsp_transport", "tcp"]);
        }
        cmd.args(["-probesize", "10M", "-analyzeduration", "10M"]);
        cmd.args(["-fflags", "+genpts+discardcorrupt", "-err_detect", "ignore_err"]);
        cmd.arg("-i").arg(input);

        // 视频
        cmd.args(["-c:v", "libx264", "-preset", "veryfast", "-tune", "zerolatency"]);
        cmd.args(["-profile:v", "baseline", "-bf", "0", "-pix_fmt", "yuv420p"]);
        cmd.arg("-r").arg(&fps);
        cmd.arg("-vf").arg(video_filter);
        cmd.arg("-b:v").arg(&bitrate);
        cmd.arg("-maxrate").arg(&bitrate);
        cmd.arg("-bufsize").arg(bufsize);
        cmd.arg("-g").arg(&gop).arg("-keyint_min").arg(&gop);
        cmd.args(["-sc_threshold", "0"]);

        // 音频
        cmd.args(["-c:a", "aac", "-ac", "2", "-ar", "44100", "-af", "asetpts=N/SR/TB"]);

        // HLS 输出
        cmd.args(["-f", "hls"]);
        cmd.arg("-hls_time").arg(cfg.segment_duration_sec.to_string());
        cmd.arg("-hls_list_size").arg(cfg.playlist_size.to_string());
        cmd.args(["-hls_flags", "delete_segments+omit_endlist"]);
        cmd.arg("-hls_segment_filename").arg(store.segment_template(id));
        cmd.arg(store.manifest_path(id));

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    /// 启动子进程，并将 stderr 逐行转发到 debug 日志
    ///
    /// 转发任务挂在 `tasks` 上，子进程退出、管道关闭后结束
    pub fn spawn(
        mut cmd: Command,
        id: SourceId,
        tasks: &TaskTracker,
    ) -> Result<Child, SupervisorError> {
        let mut child = cmd
            .spawn()
            .map_err(|source| SupervisorError::Spawn { id, source })?;

        if let Some(stderr) = child.stderr.take() {
            tasks.spawn(forward_stderr(id, stderr));
        }
        Ok(child)
    }

    /// 检查系统内存是否足够启动新的转码进程
    ///
    /// 无法获取内存信息时仅记录警告而不阻断流程
    pub fn check_memory(min_free_kb: u64) -> Result<(), SupervisorError> {
        if min_free_kb == 0 {
            return Ok(());
        }
        match sys_info::mem_info() {
            Ok(mem) if mem.avail < min_free_kb => {
                Err(SupervisorError::InsufficientMemory(mem.avail))
            }
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("Failed to check memory usage: {}", e);
                Ok(())
            }
        }
    }
}

async fn forward_stderr(id: SourceId, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(source = %id, "[ffmpeg] {}", line),
            Ok(None) => break,
            Err(e) => {
                debug!(source = %id, "Transcoder stderr closed: {}", e);
                break;
            }
        }
    }
}
