use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::schema::{HostId, LogRecord};
use crate::storage_traits::GenerationLog;
use crate::StoreResult;

const LOG_EXTENSION: &str = "jsonl";

/// Filesystem-backed generation log: one JSON-lines file per host.
///
/// Layout: `<root>/generations/<host>.jsonl`
pub struct FsGenerationLog {
    dir: PathBuf,
}

impl FsGenerationLog {
    /// Create a log rooted at `root`. Creates `root/generations/` if needed.
    pub fn new(root: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = root.as_ref().join("generations");
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn log_path(&self, host: &HostId) -> PathBuf {
        self.dir.join(format!("{}.{}", host.as_str(), LOG_EXTENSION))
    }
}

#[async_trait]
impl GenerationLog for FsGenerationLog {
    async fn load(&self, host: &HostId) -> StoreResult<Vec<LogRecord>> {
        let path = self.log_path(host);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Io(e)),
        };

        // A crash mid-append can leave a final line without its newline.
        // Drop it so the next append starts on a clean line.
        let complete_len = match content.rfind('\n') {
            Some(idx) => idx + 1,
            None => 0,
        };
        if complete_len < content.len() {
            warn!(
                host = %host,
                bytes = content.len() - complete_len,
                "Truncating torn trailing record in generation log"
            );
            let file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
            file.set_len(complete_len as u64).await?;
            file.sync_all().await?;
        }

        let mut records = Vec::new();
        for (idx, line) in content[..complete_len].lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: LogRecord =
                serde_json::from_str(line).map_err(|e| StoreError::CorruptLog {
                    host: host.clone(),
                    line: idx + 1,
                    reason: e.to_string(),
                })?;
            records.push(record);
        }

        debug!(host = %host, records = records.len(), "Loaded generation log");
        Ok(records)
    }

    async fn append(&self, host: &HostId, records: &[LogRecord]) -> StoreResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(host))
            .await?;
        file.write_all(&buf).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn hosts(&self) -> StoreResult<Vec<HostId>> {
        let mut hosts = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match HostId::new(stem) {
                Ok(host) => hosts.push(host),
                Err(_) => warn!(path = %path.display(), "Ignoring log with invalid host name"),
            }
        }
        hosts.sort();
        Ok(hosts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ContentHash, GenerationStatus};
    use chrono::Utc;

    fn make_log() -> (tempfile::TempDir, FsGenerationLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = FsGenerationLog::new(dir.path()).unwrap();
        (dir, log)
    }

    fn record(sequence: u64) -> LogRecord {
        LogRecord {
            sequence,
            content_hash: ContentHash::from_bytes(b"artifact"),
            artifact_path: PathBuf::from("/nix/store/abc-system"),
            timestamp: Utc::now(),
            status: GenerationStatus::Pending,
            predecessor: None,
            restored_from: None,
        }
    }

    #[tokio::test]
    async fn missing_log_loads_empty() {
        let (_dir, log) = make_log();
        let host = HostId::new("web1").unwrap();
        assert!(log.load(&host).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn append_is_visible_to_a_fresh_handle() {
        let (dir, log) = make_log();
        let host = HostId::new("web1").unwrap();
        let original = record(1);
        log.append(&host, &[original.clone()]).await.unwrap();

        let reopened = FsGenerationLog::new(dir.path()).unwrap();
        let records = reopened.load(&host).await.unwrap();
        assert_eq!(records, vec![original]);
    }

    #[tokio::test]
    async fn torn_trailing_line_is_truncated() {
        let (dir, log) = make_log();
        let host = HostId::new("web1").unwrap();
        log.append(&host, &[record(1)]).await.unwrap();

        let path = dir.path().join("generations").join("web1.jsonl");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"sequence\":2,\"content_");
        std::fs::write(&path, &content).unwrap();

        let records = log.load(&host).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(std::fs::read_to_string(&path).unwrap().ends_with('\n'));
    }

    #[tokio::test]
    async fn corrupt_middle_line_is_an_error() {
        let (dir, log) = make_log();
        let host = HostId::new("web1").unwrap();
        let path = dir.path().join("generations").join("web1.jsonl");
        std::fs::write(&path, "not json\n").unwrap();

        let err = log.load(&host).await.unwrap_err();
        assert!(matches!(err, StoreError::CorruptLog { line: 1, .. }));
    }

    #[tokio::test]
    async fn hosts_lists_log_files() {
        let (_dir, log) = make_log();
        for name in ["web2", "web1"] {
            let host = HostId::new(name).unwrap();
            log.append(&host, &[record(1)]).await.unwrap();
        }
        let hosts = log.hosts().await.unwrap();
        let names: Vec<_> = hosts.iter().map(HostId::as_str).collect();
        assert_eq!(names, vec!["web1", "web2"]);
    }
}
