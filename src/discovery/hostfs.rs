//! Local Host Filesystem
//!
//! Lists discovery roots and wipes volume content with tokio's filesystem
//! API; filesystem capacity is read with `df` through the node executor.

use super::exec::shell_quote;
use crate::domain::{HostFs, NodeExecutorRef, NodeName};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Host filesystem of the local node
pub struct LocalHostFs {
    node: NodeName,
    executor: NodeExecutorRef,
}

impl LocalHostFs {
    pub fn new(node: NodeName, executor: NodeExecutorRef) -> Self {
        Self { node, executor }
    }
}

#[async_trait]
impl HostFs for LocalHostFs {
    async fn list_subdirs(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let list_err = |e: std::io::Error| Error::DiscoveryRoot {
            root: root.display().to_string(),
            reason: e.to_string(),
        };

        let mut entries = fs::read_dir(root).await.map_err(list_err)?;
        let mut dirs = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(list_err)? {
            let path = entry.path();
            // Follows symlinks so mount points linked into the root count
            match fs::metadata(&path).await {
                Ok(meta) if meta.is_dir() => dirs.push(path),
                Ok(_) => {}
                Err(e) => debug!(path = %path.display(), error = %e, "Skipping unreadable entry"),
            }
        }

        dirs.sort();
        Ok(dirs)
    }

    async fn capacity_bytes(&self, path: &Path) -> Result<u64> {
        let command = format!("df -Pk {}", shell_quote(&path.display().to_string()));
        let output = self.executor.exec(self.node.as_str(), &command).await?;

        if !output.success() {
            return Err(Error::ContentSetup {
                path: path.display().to_string(),
                reason: format!("df exited with {}: {}", output.code, output.stderr.trim()),
            });
        }

        parse_df_output(&output.stdout).map_err(|e| Error::ContentSetup {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    async fn clear(&self, path: &Path) -> Result<()> {
        let cleanup_err = |e: std::io::Error| Error::ContentCleanup {
            path: path.display().to_string(),
            reason: e.to_string(),
        };

        let mut entries = match fs::read_dir(path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(cleanup_err(e)),
        };

        while let Some(entry) = entries.next_entry().await.map_err(cleanup_err)? {
            let child = entry.path();
            let meta = fs::symlink_metadata(&child).await.map_err(cleanup_err)?;
            let removed = if meta.is_dir() {
                fs::remove_dir_all(&child).await
            } else {
                fs::remove_file(&child).await
            };
            match removed {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(cleanup_err(e)),
            }
        }

        debug!(path = %path.display(), "Cleared volume content");
        Ok(())
    }
}

/// Parse `df -Pk` output into a byte count
fn parse_df_output(stdout: &str) -> Result<u64> {
    let line = stdout
        .lines()
        .skip(1)
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| Error::CapacityParse("df printed no filesystem line".into()))?;

    let blocks = line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| Error::CapacityParse(format!("unexpected df line: {}", line)))?;

    let kib: u64 = blocks
        .parse()
        .map_err(|_| Error::CapacityParse(format!("invalid block count: {}", blocks)))?;
    kib.checked_mul(1024)
        .ok_or_else(|| Error::CapacityParse(format!("block count overflows: {}", blocks)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecOutput, NodeExecutor};
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Executor that answers every command with a canned output
    struct CannedExecutor {
        output: ExecOutput,
        commands: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NodeExecutor for CannedExecutor {
        async fn exec(&self, _node: &str, command: &str) -> Result<ExecOutput> {
            self.commands.lock().push(command.to_string());
            Ok(self.output.clone())
        }
    }

    fn host_fs(output: ExecOutput) -> (LocalHostFs, Arc<CannedExecutor>) {
        let executor = Arc::new(CannedExecutor {
            output,
            commands: Mutex::new(Vec::new()),
        });
        (LocalHostFs::new("node-1".into(), executor.clone()), executor)
    }

    #[test]
    fn test_parse_df_output() {
        let out = "Filesystem     1024-blocks    Used Available Capacity Mounted on\n\
                   /dev/sda1         10240      2048      8192      20% /\n";
        assert_eq!(parse_df_output(out).unwrap(), 10240 * 1024);
        assert_matches!(
            parse_df_output("Filesystem 1024-blocks\n"),
            Err(Error::CapacityParse(_))
        );
        assert_matches!(
            parse_df_output("header\n/dev/x abc 1 2 3% /\n"),
            Err(Error::CapacityParse(_))
        );
    }

    #[test]
    fn test_parse_df_output_overflow() {
        let out = format!("header\n/dev/x {} 0 0 0% /\n", u64::MAX / 512);
        assert_matches!(parse_df_output(&out), Err(Error::CapacityParse(_)));

        let out = format!("header\n/dev/x {} 0 0 0% /\n", u64::MAX / 1024);
        assert_eq!(parse_df_output(&out).unwrap(), (u64::MAX / 1024) * 1024);
    }

    #[tokio::test]
    async fn test_list_subdirs_only_directories() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("vol-b")).unwrap();
        std::fs::create_dir(root.path().join("vol-a")).unwrap();
        std::fs::write(root.path().join("not-a-volume"), b"x").unwrap();

        let (fs, _) = host_fs(ExecOutput::default());
        let dirs = fs.list_subdirs(root.path()).await.unwrap();

        assert_eq!(
            dirs,
            vec![root.path().join("vol-a"), root.path().join("vol-b")]
        );
    }

    #[tokio::test]
    async fn test_list_missing_root_is_discovery_error() {
        let root = TempDir::new().unwrap();
        let (fs, _) = host_fs(ExecOutput::default());

        let result = fs.list_subdirs(&root.path().join("missing")).await;
        assert_matches!(result, Err(Error::DiscoveryRoot { .. }));
    }

    #[tokio::test]
    async fn test_clear_removes_content_keeps_directory() {
        let root = TempDir::new().unwrap();
        let volume = root.path().join("vol-a");
        std::fs::create_dir_all(volume.join("nested/deeper")).unwrap();
        std::fs::write(volume.join("test-file"), b"test-file-content").unwrap();
        std::fs::write(volume.join("nested/deeper/data"), b"payload").unwrap();

        let (fs, _) = host_fs(ExecOutput::default());
        fs.clear(&volume).await.unwrap();

        assert!(volume.is_dir());
        assert_eq!(std::fs::read_dir(&volume).unwrap().count(), 0);

        // Clearing a vanished directory is not an error
        fs.clear(&root.path().join("gone")).await.unwrap();
    }

    #[tokio::test]
    async fn test_capacity_uses_df() {
        let (fs, executor) = host_fs(ExecOutput {
            stdout: "Filesystem 1024-blocks Used Available Capacity Mounted on\n\
                     tmpfs 2048 0 2048 0% /tmp\n"
                .into(),
            ..Default::default()
        });

        let bytes = fs.capacity_bytes(Path::new("/tmp/disks/vol-a")).await.unwrap();
        assert_eq!(bytes, 2048 * 1024);
        assert_eq!(executor.commands.lock()[0], "df -Pk '/tmp/disks/vol-a'");
    }

    #[tokio::test]
    async fn test_capacity_failure_is_setup_error() {
        let (fs, _) = host_fs(ExecOutput {
            code: 1,
            stderr: "df: /tmp/disks/vol-a: Permission denied".into(),
            ..Default::default()
        });

        let result = fs.capacity_bytes(Path::new("/tmp/disks/vol-a")).await;
        assert_matches!(result, Err(Error::ContentSetup { .. }));
    }
}
