use crate::source::SourceId;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

/// 目录名前缀，目录名 = 前缀 + 源 ID
pub const DIR_PREFIX: &str = "cctv_";
pub const MANIFEST_FILE: &str = "index.m3u8";
/// FFmpeg 切片文件名模板
pub const SEGMENT_TEMPLATE: &str = "segment_%03d.ts";

/// 按源划分目录的 HLS 切片存储
///
/// 只有转码子进程写入文件；本进程只负责创建目录。
/// 目录在进程停止后保留，重启时复用。
#[derive(Debug, Clone)]
pub struct SegmentStore {
    root: PathBuf,
}

impl SegmentStore {
    /// 创建根目录并规范化路径，失败视为启动期致命错误
    pub async fn init<P: AsRef<Path>>(root: P) -> io::Result<Self> {
        fs::create_dir_all(root.as_ref()).await?;
        let root = fs::canonicalize(root.as_ref()).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir_name(id: SourceId) -> String {
        format!("{}{}", DIR_PREFIX, id)
    }

    pub fn source_dir(&self, id: SourceId) -> PathBuf {
        self.root.join(Self::dir_name(id))
    }

    pub fn manifest_path(&self, id: SourceId) -> PathBuf {
        self.source_dir(id).join(MANIFEST_FILE)
    }

    pub fn segment_template(&self, id: SourceId) -> PathBuf {
        self.source_dir(id).join(SEGMENT_TEMPLATE)
    }

    /// 确保源目录存在；已有文件不会被清理
    pub async fn prepare(&self, id: SourceId) -> io::Result<PathBuf> {
        let dir = self.source_dir(id);
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }
}
