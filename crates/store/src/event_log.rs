use std::fs;
use std::io::{BufRead, BufReader};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

/// Append-only, crash-safe JSONL event log over any serializable record.
///
/// Grounds the Drive-Quality ratings log (§4.6), the relay's dedup/revocation
/// snapshots, and any other append-mostly JSONL substrate the orchestrator
/// keeps — each gets its own `EventLog<T>` rather than a bespoke file format.
#[derive(Debug, Clone)]
pub struct EventLog<T> {
    path: PathBuf,
    _marker: PhantomData<T>,
}

impl<T> EventLog<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), _marker: PhantomData }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, event: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let line = serde_json::to_string(event)?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        // Flush userspace buffers and fsync to disk so the entry survives a
        // process crash or power loss immediately after append.
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Atomically replace the event log with a new set of events.
    ///
    /// Crash-safety guarantee: the new content is written to a `.tmp` sibling
    /// file, `fsync`'d, then renamed over the original.  A crash at any point
    /// before the rename leaves the original file untouched.  A crash after
    /// the rename leaves a consistent new file.  The `.tmp` file is cleaned up
    /// on any error path.
    pub async fn overwrite(&self, events: &[T]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Derive `.tmp` path by appending `.tmp` to the full filename.
        let tmp_path = {
            let filename = self
                .path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| "events.jsonl".to_string());
            self.path.with_file_name(format!("{filename}.tmp"))
        };

        // Write to the temp file first.
        let write_result: Result<()> = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .await?;
            for event in events {
                let line = serde_json::to_string(event)?;
                file.write_all(line.as_bytes()).await?;
                file.write_all(b"\n").await?;
            }
            // Flush userspace buffers and sync to disk before rename.
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(err) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        // Atomic rename: if this returns Ok the new file is fully consistent.
        if let Err(err) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }

        Ok(())
    }

    /// Copy the live event log to a `.bak` sibling file.
    ///
    /// Called at the start of each sleep cycle so a consistent snapshot is
    /// available even if the cycle writes new entries or the process crashes
    /// mid-cycle.  If the source file does not yet exist the call is a no-op.
    pub fn backup(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }

        let bak_path = {
            let filename = self
                .path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| "events.jsonl".to_string());
            self.path.with_file_name(format!("{filename}.bak"))
        };

        fs::copy(&self.path, &bak_path)?;
        Ok(())
    }

    pub fn load(&self) -> Result<Vec<T>> {
        use std::fs::OpenOptions;
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = OpenOptions::new().read(true).open(&self.path)?;
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut corrupt_count = 0usize;

        for (line_idx, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<T>(&line) {
                Ok(event) => events.push(event),
                Err(err) => {
                    corrupt_count += 1;
                    tracing::warn!(
                        line = line_idx + 1,
                        error = %err,
                        path = %self.path.display(),
                        "corrupt JSONL record — skipping line (original preserved in .corrupt file)"
                    );
                    // Append the bad line to a sidecar file for forensics.
                    let corrupt_path = self.path.with_extension("jsonl.corrupt");
                    let mut bad = std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&corrupt_path)
                        .unwrap_or_else(|_| {
                            // If we can't open the sidecar, just continue.
                            // The warning above is the only signal the user gets.
                            std::fs::File::open("/dev/null").expect("/dev/null always exists")
                        });
                    use std::io::Write as _;
                    let _ = writeln!(bad, "{line}");
                }
            }
        }

        if corrupt_count > 0 {
            tracing::warn!(
                corrupt_lines = corrupt_count,
                path = %self.path.display(),
                "event log loaded with skipped corrupt lines — inspect .corrupt sidecar"
            );
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Record {
        id: u32,
        note: String,
    }

    #[tokio::test]
    async fn append_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::<Record>::new(dir.path().join("events.jsonl"));

        log.append(&Record { id: 1, note: "a".into() }).await.unwrap();
        log.append(&Record { id: 2, note: "b".into() }).await.unwrap();

        let loaded = log.load().unwrap();
        assert_eq!(loaded, vec![
            Record { id: 1, note: "a".into() },
            Record { id: 2, note: "b".into() },
        ]);
    }

    #[tokio::test]
    async fn load_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::<Record>::new(dir.path().join("missing.jsonl"));
        assert!(log.load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn overwrite_replaces_contents_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::<Record>::new(dir.path().join("events.jsonl"));
        log.append(&Record { id: 1, note: "a".into() }).await.unwrap();

        log.overwrite(&[Record { id: 9, note: "z".into() }]).await.unwrap();

        let loaded = log.load().unwrap();
        assert_eq!(loaded, vec![Record { id: 9, note: "z".into() }]);
        assert!(!dir.path().join("events.jsonl.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_line_is_skipped_and_sidecared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let log = EventLog::<Record>::new(&path);
        log.append(&Record { id: 1, note: "a".into() }).await.unwrap();
        tokio::fs::write(&path, format!(
            "{}\nnot json at all\n",
            serde_json::to_string(&Record { id: 1, note: "a".into() }).unwrap()
        ))
        .await
        .unwrap();

        let loaded = log.load().unwrap();
        assert_eq!(loaded, vec![Record { id: 1, note: "a".into() }]);
        assert!(path.with_extension("jsonl.corrupt").exists());
    }

    #[test]
    fn backup_of_missing_file_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::<Record>::new(dir.path().join("missing.jsonl"));
        assert!(log.backup().is_ok());
    }
}
