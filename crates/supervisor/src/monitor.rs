use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, trace, warn};

use crate::error::SideFileError;
use crate::progress::{self, Chunk, DoneFile, CHUNKS_FILE, DONE_FILE};
use crate::status::ChunkDelta;
use crate::watch::{FsEvent, FsEventKind};

/// Locations of the files av1an writes while encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidePaths {
    pub done: PathBuf,
    pub chunks: PathBuf,
    pub log: PathBuf,
}

impl SidePaths {
    pub fn new(temp: &Path, log: PathBuf) -> Self {
        Self {
            done: temp.join(DONE_FILE),
            chunks: temp.join(CHUNKS_FILE),
            log,
        }
    }
}

/// What a file event changed
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorUpdate {
    /// The chunk manifest was loaded
    Chunks(usize),
    /// Chunks that finished since the last update, oldest id first
    Completed(Vec<ChunkDelta>),
    /// New contents of the log file
    Log(String),
}

/// Rebuilds encode progress from av1an's side files
#[derive(Debug)]
pub struct ProgressMonitor {
    paths: SidePaths,
    done: DoneFile,
    total_frames: u64,
    chunks: Vec<Chunk>,
    /// Completed ids already reported by this run
    seen: HashSet<String>,
    /// Completed ids found on disk before this run started
    resumed: HashSet<String>,
    resumed_frames: u64,
    log: Option<String>,
}

impl ProgressMonitor {
    pub fn new(paths: SidePaths) -> Self {
        Self {
            paths,
            done: DoneFile::default(),
            total_frames: 0,
            chunks: Vec::new(),
            seen: HashSet::new(),
            resumed: HashSet::new(),
            resumed_frames: 0,
            log: None,
        }
    }

    pub fn paths(&self) -> &SidePaths {
        &self.paths
    }

    pub fn done(&self) -> &DoneFile {
        &self.done
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn resumed_frames(&self) -> u64 {
        self.resumed_frames
    }

    pub fn log(&self) -> Option<&str> {
        self.log.as_deref()
    }

    /// Load whatever an interrupted earlier run left behind. Chunks found
    /// completed here are never reported as new.
    pub fn load_existing(&mut self) {
        if self.paths.done.exists() {
            match DoneFile::read(&self.paths.done) {
                Ok(done) => {
                    self.resumed = done.done.keys().cloned().collect();
                    self.total_frames = self.total_frames.max(done.frames);
                    self.resumed_frames = done.frames_done();
                    info!(
                        "Resuming with {} completed chunk(s), {} frame(s) done",
                        self.resumed.len(),
                        self.resumed_frames
                    );
                    self.done = done;
                }
                Err(e) => warn!("Ignoring unreadable done-file from previous run: {}", e),
            }
        }

        if self.paths.chunks.exists() {
            self.load_chunks();
        }

        if self.paths.log.exists() {
            self.read_log();
        }
    }

    /// Apply one file event
    pub fn handle(&mut self, event: &FsEvent) -> Option<MonitorUpdate> {
        let path = event.path.as_path();
        if path == self.paths.chunks {
            // a manifest caught half-written on creation is retried on the next write
            let wanted = event.kind == FsEventKind::Created || self.chunks.is_empty();
            if wanted && self.load_chunks() {
                return Some(MonitorUpdate::Chunks(self.chunks.len()));
            }
            None
        } else if path == self.paths.done {
            match DoneFile::read(path) {
                Ok(done) => {
                    let completed = self.apply_done(done);
                    (!completed.is_empty()).then_some(MonitorUpdate::Completed(completed))
                }
                Err(e) => {
                    // av1an rewrites the file non-atomically
                    trace!("Done-file not readable yet: {}", e);
                    None
                }
            }
        } else if path == self.paths.log {
            self.read_log().map(MonitorUpdate::Log)
        } else {
            None
        }
    }

    /// Take a freshly parsed done-file and return the chunks that completed
    /// since the last call
    pub fn apply_done(&mut self, done: DoneFile) -> Vec<ChunkDelta> {
        if done.frames > self.total_frames {
            debug!("Total frames now {}", done.frames);
            self.total_frames = done.frames;
        }

        let mut completed: Vec<ChunkDelta> = done
            .done
            .iter()
            .filter(|(id, _)| !self.seen.contains(*id) && !self.resumed.contains(*id))
            .map(|(id, record)| ChunkDelta {
                id: id.clone(),
                frames: record.frames,
                size_bytes: record.size_bytes,
            })
            .collect();
        completed.sort_by(|a, b| chunk_order(&a.id).cmp(&chunk_order(&b.id)));

        for delta in &completed {
            self.seen.insert(delta.id.clone());
        }
        self.done = done;
        completed
    }

    fn load_chunks(&mut self) -> bool {
        match progress::read_chunks(&self.paths.chunks) {
            Ok(chunks) => {
                debug!("Loaded {} chunk(s) from {}", chunks.len(), self.paths.chunks.display());
                self.chunks = chunks;
                true
            }
            Err(SideFileError::Parse { source, .. }) => {
                trace!("Chunk manifest not readable yet: {}", source);
                false
            }
            Err(e) => {
                debug!("{}", e);
                false
            }
        }
    }

    fn read_log(&mut self) -> Option<String> {
        match fs::read(&self.paths.log) {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                self.log = Some(text.clone());
                Some(text)
            }
            Err(e) => {
                debug!("Failed to read log {}: {}", self.paths.log.display(), e);
                None
            }
        }
    }
}

/// Numeric ids sort numerically, anything else after them by name
fn chunk_order(id: &str) -> (u64, &str) {
    (id.parse().unwrap_or(u64::MAX), id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(dir: &Path) -> ProgressMonitor {
        ProgressMonitor::new(SidePaths::new(dir, dir.join("log.log")))
    }

    fn modified(path: PathBuf) -> FsEvent {
        FsEvent {
            path,
            kind: FsEventKind::Modified,
        }
    }

    fn created(path: PathBuf) -> FsEvent {
        FsEvent {
            path,
            kind: FsEventKind::Created,
        }
    }

    fn ids(update: Option<MonitorUpdate>) -> Vec<String> {
        match update {
            Some(MonitorUpdate::Completed(deltas)) => deltas.into_iter().map(|d| d.id).collect(),
            other => panic!("expected completed chunks, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_write_keeps_previous_progress() {
        let dir = tempfile::tempdir().unwrap();
        let done_path = dir.path().join(DONE_FILE);
        let mut monitor = monitor(dir.path());

        fs::write(&done_path, r#"{"frames":100,"done":{"0":{"frames":50,"size_bytes":1000}}}"#).unwrap();
        assert_eq!(ids(monitor.handle(&modified(done_path.clone()))), vec!["0"]);

        fs::write(&done_path, r#"{"frames":100,"done":{"0":{"frames":50,"si"#).unwrap();
        assert_eq!(monitor.handle(&modified(done_path.clone())), None);

        assert_eq!(monitor.total_frames(), 100);
        assert_eq!(monitor.done().frames_done(), 50);
        assert_eq!(monitor.done().done["0"].size_bytes, 1000);
    }

    #[test]
    fn test_completed_ids_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let done_path = dir.path().join(DONE_FILE);
        let mut monitor = monitor(dir.path());

        fs::write(&done_path, r#"{"frames":90,"done":{"2":{"frames":30,"size_bytes":10}}}"#).unwrap();
        assert_eq!(ids(monitor.handle(&created(done_path.clone()))), vec!["2"]);

        // rewrite with the same content reports nothing
        assert_eq!(monitor.handle(&modified(done_path.clone())), None);

        fs::write(
            &done_path,
            r#"{"frames":90,"done":{"2":{"frames":30,"size_bytes":10},"10":{"frames":30,"size_bytes":10},"1":{"frames":30,"size_bytes":10}}}"#,
        )
        .unwrap();
        assert_eq!(ids(monitor.handle(&modified(done_path))), vec!["1", "10"]);
    }

    #[test]
    fn test_resumed_chunks_are_not_new() {
        let dir = tempfile::tempdir().unwrap();
        let done_path = dir.path().join(DONE_FILE);
        fs::write(&done_path, r#"{"frames":100,"done":{"0":{"frames":40,"size_bytes":800}}}"#).unwrap();

        let mut monitor = monitor(dir.path());
        monitor.load_existing();
        assert_eq!(monitor.resumed_frames(), 40);
        assert_eq!(monitor.total_frames(), 100);

        fs::write(
            &done_path,
            r#"{"frames":100,"done":{"0":{"frames":40,"size_bytes":800},"1":{"frames":60,"size_bytes":900}}}"#,
        )
        .unwrap();
        assert_eq!(ids(monitor.handle(&modified(done_path))), vec!["1"]);
        assert_eq!(monitor.done().frames_done(), 100);
    }

    #[test]
    fn test_total_frames_only_grows() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = monitor(dir.path());
        monitor.apply_done(DoneFile {
            frames: 200,
            ..Default::default()
        });
        monitor.apply_done(DoneFile {
            frames: 0,
            ..Default::default()
        });
        assert_eq!(monitor.total_frames(), 200);
    }

    #[test]
    fn test_chunk_manifest_loaded_on_creation() {
        let dir = tempfile::tempdir().unwrap();
        let chunks_path = dir.path().join(CHUNKS_FILE);
        let mut monitor = monitor(dir.path());

        // half-written at creation time
        fs::write(&chunks_path, r#"[{"index":0,"frame_ra"#).unwrap();
        assert_eq!(monitor.handle(&created(chunks_path.clone())), None);

        fs::write(&chunks_path, r#"[{"index":0,"frame_rate":24.0}]"#).unwrap();
        assert_eq!(
            monitor.handle(&modified(chunks_path.clone())),
            Some(MonitorUpdate::Chunks(1))
        );

        // later rewrites are ignored once loaded
        fs::write(&chunks_path, r#"[{"frame_rate":30.0},{"frame_rate":30.0}]"#).unwrap();
        assert_eq!(monitor.handle(&modified(chunks_path)), None);
        assert_eq!(monitor.chunks()[0].frame_rate, 24.0);
    }

    #[test]
    fn test_log_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("log.log");
        let mut monitor = monitor(dir.path());

        fs::write(&log_path, "INFO encoding chunk 0\n").unwrap();
        assert_eq!(
            monitor.handle(&modified(log_path)),
            Some(MonitorUpdate::Log("INFO encoding chunk 0\n".to_string()))
        );
        assert_eq!(monitor.log(), Some("INFO encoding chunk 0\n"));
    }

    #[test]
    fn test_unrelated_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut monitor = monitor(dir.path());
        let other = dir.path().join("encode").join("00000.ivf");
        assert_eq!(monitor.handle(&created(other)), None);
    }
}
