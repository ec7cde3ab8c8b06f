//! Output directory polling for segmented sessions.
//!
//! The transcoder owns the playlist and segment files; the watcher only
//! notices when they appear or change and copies them to the object store.
//! Each poll stages changed segments before the playlist, so the stored
//! playlist never references a segment that has not been stored yet.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use cr_core::{Result, SessionId};

use crate::storage::{object_key, ObjectStore};

/// Size and mtime of a file at the time it was last staged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

/// What one poll did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Segments written to the store in this poll.
    pub segments_staged: usize,
    /// Whether the playlist was written in this poll.
    pub playlist_staged: bool,
    /// Files whose upload failed; they are retried on the next poll.
    pub failed: usize,
}

/// Stages one session's playlist and segments to an [`ObjectStore`].
pub struct SegmentWatcher {
    session_id: SessionId,
    dir: PathBuf,
    playlist_name: String,
    segment_extension: String,
    key_prefix: String,
    store: Arc<dyn ObjectStore>,
    stamps: HashMap<String, FileStamp>,
    segments_total: u64,
}

impl SegmentWatcher {
    pub fn new(
        session_id: SessionId,
        dir: impl Into<PathBuf>,
        playlist_name: impl Into<String>,
        segment_extension: impl Into<String>,
        key_prefix: impl Into<String>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            session_id,
            dir: dir.into(),
            playlist_name: playlist_name.into(),
            segment_extension: segment_extension.into().trim_start_matches('.').to_string(),
            key_prefix: key_prefix.into(),
            store,
            stamps: HashMap::new(),
            segments_total: 0,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether the transcoder has written its playlist yet.
    pub async fn playlist_exists(&self) -> bool {
        tokio::fs::try_exists(self.dir.join(&self.playlist_name))
            .await
            .unwrap_or(false)
    }

    /// Distinct segment files staged since the watcher started.
    pub fn segments_staged(&self) -> u64 {
        self.segments_total
    }

    /// Scan the directory once and stage every new or changed file.
    ///
    /// Upload failures are logged and counted; the file's stamp is not
    /// recorded so the next poll tries again. Stamps of files that are gone
    /// from the directory are dropped.
    pub async fn poll_once(&mut self) -> Result<PollReport> {
        let mut report = PollReport::default();
        let mut segments = Vec::new();
        let mut playlist = None;
        let mut present = HashSet::new();

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Ok(meta) = entry.metadata().await else {
                // Deleted between listing and stat (segment rotation).
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            present.insert(name.clone());
            let stamp = FileStamp {
                len: meta.len(),
                modified: meta.modified().ok(),
            };

            if name == self.playlist_name {
                playlist = Some((name, stamp));
            } else if self.is_segment(&name) {
                segments.push((name, stamp));
            }
        }

        segments.sort_by(|a, b| segment_order(&a.0).cmp(&segment_order(&b.0)));

        self.stamps.retain(|name, _| present.contains(name));

        for (name, stamp) in segments {
            let first_time = !self.stamps.contains_key(&name);
            match self.stage_if_changed(&name, stamp).await {
                Ok(true) => {
                    report.segments_staged += 1;
                    if first_time {
                        self.segments_total += 1;
                    }
                }
                Ok(false) => {}
                Err(()) => report.failed += 1,
            }
        }

        if let Some((name, stamp)) = playlist {
            match self.stage_if_changed(&name, stamp).await {
                Ok(staged) => report.playlist_staged = staged,
                Err(()) => report.failed += 1,
            }
        }

        if report.segments_staged > 0 || report.playlist_staged {
            tracing::debug!(
                session_id = %self.session_id,
                segments = report.segments_staged,
                playlist = report.playlist_staged,
                "Staged segment output"
            );
        }

        Ok(report)
    }

    fn is_segment(&self, name: &str) -> bool {
        Path::new(name)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(self.segment_extension.as_str()))
    }

    /// `Ok(true)` if uploaded, `Ok(false)` if unchanged or vanished, `Err` if
    /// the upload failed.
    async fn stage_if_changed(&mut self, name: &str, stamp: FileStamp) -> std::result::Result<bool, ()> {
        if self.stamps.get(name) == Some(&stamp) {
            return Ok(false);
        }

        let data = match tokio::fs::read(self.dir.join(name)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, "Failed to read {name}: {e}");
                return Err(());
            }
        };

        let key = object_key(&self.key_prefix, &self.session_id, name);
        match self.store.put(&key, Bytes::from(data)).await {
            Ok(()) => {
                self.stamps.insert(name.to_string(), stamp);
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, "Failed to stage {key}: {e}");
                Err(())
            }
        }
    }
}

/// Sort key that orders `stream2.ts` before `stream10.ts`.
fn segment_order(name: &str) -> (u64, &str) {
    let stem = name.rsplit_once('.').map_or(name, |(s, _)| s);
    let digits: String = stem
        .chars()
        .rev()
        .take_while(char::is_ascii_digit)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    (digits.parse().unwrap_or(u64::MAX), name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records the order of puts and can be told to fail.
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryObjectStore,
        puts: Mutex<Vec<String>>,
        fail: Mutex<bool>,
    }

    #[async_trait]
    impl ObjectStore for RecordingStore {
        async fn put(&self, key: &str, data: Bytes) -> Result<()> {
            if *self.fail.lock() {
                return Err(cr_core::Error::storage("injected failure"));
            }
            self.puts.lock().push(key.to_string());
            self.inner.put(key, data).await
        }
        async fn get(&self, key: &str) -> Result<Option<Bytes>> {
            self.inner.get(key).await
        }
        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list(prefix).await
        }
        async fn delete_many(&self, keys: &[String]) -> Result<usize> {
            self.inner.delete_many(keys).await
        }
    }

    fn watcher(dir: &Path, store: Arc<RecordingStore>) -> (SegmentWatcher, SessionId) {
        let id = SessionId::new();
        (
            SegmentWatcher::new(id, dir, "stream.m3u8", "ts", "hls_media", store),
            id,
        )
    }

    fn names(store: &RecordingStore) -> Vec<String> {
        store
            .puts
            .lock()
            .iter()
            .map(|k| k.rsplit('/').next().unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test]
    async fn missing_dir_is_empty_poll() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordingStore::default());
        let (mut w, _) = watcher(&dir.path().join("absent"), store);
        assert!(!w.playlist_exists().await);
        assert_eq!(w.poll_once().await.unwrap(), PollReport::default());
    }

    #[tokio::test]
    async fn segments_staged_before_playlist() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stream.m3u8"), "#EXTM3U\n").unwrap();
        std::fs::write(dir.path().join("stream10.ts"), "b").unwrap();
        std::fs::write(dir.path().join("stream2.ts"), "a").unwrap();
        std::fs::write(dir.path().join("ffmpeg.log"), "noise").unwrap();

        let store = Arc::new(RecordingStore::default());
        let (mut w, id) = watcher(dir.path(), store.clone());
        assert!(w.playlist_exists().await);

        let report = w.poll_once().await.unwrap();
        assert_eq!(report.segments_staged, 2);
        assert!(report.playlist_staged);
        assert_eq!(names(&store), vec!["stream2.ts", "stream10.ts", "stream.m3u8"]);
        assert_eq!(w.segments_staged(), 2);

        let key = format!("hls_media/{id}/stream2.ts");
        assert_eq!(
            store.get(&key).await.unwrap(),
            Some(Bytes::from_static(b"a"))
        );
    }

    #[tokio::test]
    async fn unchanged_files_not_restaged() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stream.m3u8"), "#EXTM3U\n").unwrap();
        std::fs::write(dir.path().join("stream0.ts"), "a").unwrap();

        let store = Arc::new(RecordingStore::default());
        let (mut w, _) = watcher(dir.path(), store.clone());
        w.poll_once().await.unwrap();
        let second = w.poll_once().await.unwrap();
        assert_eq!(second, PollReport::default());
        assert_eq!(store.puts.lock().len(), 2);

        // A new segment plus a rewritten (longer) playlist.
        std::fs::write(dir.path().join("stream1.ts"), "b").unwrap();
        std::fs::write(dir.path().join("stream.m3u8"), "#EXTM3U\n#EXTINF:2.0,\n").unwrap();
        let third = w.poll_once().await.unwrap();
        assert_eq!(third.segments_staged, 1);
        assert!(third.playlist_staged);
        assert_eq!(w.segments_staged(), 2);
        assert_eq!(store.inner.len(), 3);
    }

    #[tokio::test]
    async fn rotated_segments_are_forgotten() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stream.m3u8"), "#EXTM3U\n").unwrap();
        std::fs::write(dir.path().join("stream0.ts"), "a").unwrap();
        std::fs::write(dir.path().join("stream1.ts"), "b").unwrap();

        let store = Arc::new(RecordingStore::default());
        let (mut w, _) = watcher(dir.path(), store.clone());
        w.poll_once().await.unwrap();
        assert_eq!(w.stamps.len(), 3);

        // The transcoder deletes the oldest segment and writes a new one.
        std::fs::remove_file(dir.path().join("stream0.ts")).unwrap();
        std::fs::write(dir.path().join("stream2.ts"), "c").unwrap();
        let report = w.poll_once().await.unwrap();
        assert_eq!(report.segments_staged, 1);

        assert_eq!(w.stamps.len(), 3);
        assert!(!w.stamps.contains_key("stream0.ts"));
        assert_eq!(w.segments_staged(), 3);
    }

    #[tokio::test]
    async fn failed_upload_retried_next_poll() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stream0.ts"), "a").unwrap();

        let store = Arc::new(RecordingStore::default());
        *store.fail.lock() = true;
        let (mut w, _) = watcher(dir.path(), store.clone());

        let report = w.poll_once().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(w.segments_staged(), 0);

        *store.fail.lock() = false;
        let report = w.poll_once().await.unwrap();
        assert_eq!(report.segments_staged, 1);
        assert_eq!(report.failed, 0);
    }

    #[test]
    fn numeric_segment_order() {
        let mut names = vec!["s10.ts", "s9.ts", "s100.ts", "s1.ts", "other.ts"];
        names.sort_by(|a, b| segment_order(a).cmp(&segment_order(b)));
        assert_eq!(names, vec!["s1.ts", "s9.ts", "s10.ts", "s100.ts", "other.ts"]);
    }
}
