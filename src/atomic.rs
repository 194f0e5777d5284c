//! 临时写入与不覆盖发布的辅助方法。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::AccessError;

/// 目标同目录下的临时文件，完成写入后再发布到最终路径。
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: File,
}

impl AtomicFile {
    /// 在目标路径同目录创建临时文件。
    pub async fn new(target: &Path) -> Result<Self, AccessError> {
        let parent = target
            .parent()
            .ok_or_else(|| AccessError::InvalidPath(target.display().to_string()))?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "file".into());
        let temp_path = parent.join(format!(".{base}.tmp.{}", Uuid::new_v4()));
        let file = File::create(&temp_path)
            .await
            .map_err(|err| AccessError::Internal(err.to_string()))?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            file,
        })
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// 放弃并清理临时文件。
    pub async fn cleanup(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }

    /// 刷盘后以硬链接发布到目标路径；目标已存在时返回 Conflict，临时文件总会被移除。
    pub async fn finalize_new(mut self) -> Result<(), AccessError> {
        let synced = async {
            self.file.flush().await?;
            self.file.sync_all().await
        }
        .await;
        drop(self.file);
        if let Err(err) = synced {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(AccessError::Internal(err.to_string()));
        }

        let published = fs::hard_link(&self.temp_path, &self.target).await;
        let _ = fs::remove_file(&self.temp_path).await;
        match published {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(AccessError::Conflict(format!(
                    "The file with the same path ({}) already exists.",
                    self.target.display()
                )));
            }
            Err(err) => return Err(AccessError::Internal(err.to_string())),
        }

        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent).await;
        }
        Ok(())
    }
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn temp_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().to_string())
            .filter(|name| name.contains(".tmp."))
            .collect()
    }

    #[tokio::test]
    async fn finalize_publishes_complete_file() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("a.txt");
        let mut atomic = AtomicFile::new(&target).await.expect("create");
        atomic.file_mut().write_all(b"hello").await.expect("write");
        assert!(!target.exists());

        atomic.finalize_new().await.expect("finalize");
        assert_eq!(std::fs::read(&target).expect("read"), b"hello");
        assert!(temp_files(temp.path()).is_empty());
    }

    #[tokio::test]
    async fn finalize_never_overwrites() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("a.txt");
        std::fs::write(&target, b"original").expect("write");

        let mut atomic = AtomicFile::new(&target).await.expect("create");
        atomic.file_mut().write_all(b"replacement").await.expect("write");
        let result = atomic.finalize_new().await;

        assert!(matches!(result, Err(AccessError::Conflict(_))));
        assert_eq!(std::fs::read(&target).expect("read"), b"original");
        assert!(temp_files(temp.path()).is_empty());
    }

    #[tokio::test]
    async fn cleanup_leaves_nothing_behind() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("a.txt");
        let mut atomic = AtomicFile::new(&target).await.expect("create");
        atomic.file_mut().write_all(b"partial").await.expect("write");
        atomic.cleanup().await;

        assert!(!target.exists());
        assert!(temp_files(temp.path()).is_empty());
    }
}
