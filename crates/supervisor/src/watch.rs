//! Recursive change watch over directory trees.
//!
//! Each root, a directory or a single file, is re-scanned on a fixed interval
//! and every file whose size or modification time moved since the previous
//! scan is reported. New files are reported as `Created`. The watch holds a background task and must be
//! released with [`WatchHandle::close`]; dropping the handle aborts the task.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use log::{debug, trace, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
    Created,
    Modified,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub path: PathBuf,
    pub kind: FsEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

type Snapshot = HashMap<PathBuf, FileStamp>;

fn scan(roots: &[PathBuf]) -> Snapshot {
    let mut files = HashMap::new();
    for entry in roots
        .iter()
        .flat_map(|root| WalkDir::new(root).follow_links(false))
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        // the file may vanish between listing and stat
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        files.insert(
            entry.path().to_path_buf(),
            FileStamp {
                len: metadata.len(),
                modified: metadata.modified().ok(),
            },
        );
    }
    files
}

fn diff(previous: &Snapshot, current: &Snapshot) -> Vec<FsEvent> {
    let mut events: Vec<FsEvent> = current
        .iter()
        .filter_map(|(path, stamp)| match previous.get(path) {
            None => Some(FsEvent {
                path: path.clone(),
                kind: FsEventKind::Created,
            }),
            Some(old) if old != stamp => Some(FsEvent {
                path: path.clone(),
                kind: FsEventKind::Modified,
            }),
            Some(_) => None,
        })
        .collect();
    events.sort_by(|a, b| a.path.cmp(&b.path));
    events
}

async fn scan_blocking(roots: Vec<PathBuf>) -> Snapshot {
    match tokio::task::spawn_blocking(move || scan(&roots)).await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!("Directory scan task failed: {}", e);
            Snapshot::new()
        }
    }
}

/// Handle to a running watch
pub struct WatchHandle {
    roots: Vec<PathBuf>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl WatchHandle {
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Run one final scan, deliver its events and stop the watch. The event
    /// receiver sees the end of the stream once this returns.
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Watch task for {:?} failed: {}", self.roots, e);
                }
            }
        }
        debug!("Released watch on {:?}", self.roots);
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Start watching `roots` recursively. Files that already exist are taken as
/// the baseline and are not reported. Roots that do not exist yet are picked
/// up once they appear.
pub async fn watch_paths(
    roots: Vec<PathBuf>,
    interval: Duration,
) -> (WatchHandle, mpsc::UnboundedReceiver<FsEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let mut previous = scan_blocking(roots.clone()).await;
    debug!(
        "Watching {:?} ({} existing files, every {:?})",
        roots,
        previous.len(),
        interval
    );

    let task_roots = roots.clone();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            let closing = tokio::select! {
                _ = ticker.tick() => false,
                _ = &mut shutdown_rx => true,
            };

            let current = scan_blocking(task_roots.clone()).await;
            for event in diff(&previous, &current) {
                trace!("{:?}: {}", event.kind, event.path.display());
                if tx.send(event).is_err() {
                    return;
                }
            }
            previous = current;

            if closing {
                return;
            }
        }
    });

    (
        WatchHandle {
            roots,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        },
        rx,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn stamp(len: u64) -> FileStamp {
        FileStamp {
            len,
            modified: None,
        }
    }

    #[test]
    fn test_diff_reports_created_and_modified() {
        let mut previous = Snapshot::new();
        previous.insert(PathBuf::from("/t/a"), stamp(1));
        previous.insert(PathBuf::from("/t/b"), stamp(1));
        let mut current = previous.clone();
        current.insert(PathBuf::from("/t/b"), stamp(2));
        current.insert(PathBuf::from("/t/c"), stamp(0));
        current.remove(Path::new("/t/a"));

        assert_eq!(
            diff(&previous, &current),
            vec![
                FsEvent {
                    path: PathBuf::from("/t/b"),
                    kind: FsEventKind::Modified
                },
                FsEvent {
                    path: PathBuf::from("/t/c"),
                    kind: FsEventKind::Created
                },
            ]
        );
    }

    #[test]
    fn test_scan_is_recursive() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("split")).unwrap();
        fs::write(dir.path().join("done.json"), "{}").unwrap();
        fs::write(dir.path().join("split").join("0.ivf"), "x").unwrap();

        let snapshot = scan(&[dir.path().to_path_buf()]);
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains_key(&dir.path().join("split").join("0.ivf")));
    }

    #[test]
    fn test_scan_single_file_root() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join("temp");
        fs::create_dir_all(&temp).unwrap();
        fs::write(temp.join("done.json"), "{}").unwrap();
        fs::write(dir.path().join("log.log"), "x").unwrap();
        fs::write(dir.path().join("other.txt"), "x").unwrap();

        let snapshot = scan(&[temp.clone(), dir.path().join("log.log"), dir.path().join("missing")]);
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains_key(&dir.path().join("log.log")));
        assert!(!snapshot.contains_key(&dir.path().join("other.txt")));
    }

    #[tokio::test]
    async fn test_watch_reports_new_files_and_stops_on_close() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("existing.txt"), "old").unwrap();

        let (handle, mut rx) = watch_paths(vec![dir.path().to_path_buf()], Duration::from_millis(20)).await;
        fs::write(dir.path().join("chunks.json"), "[]").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.path, dir.path().join("chunks.json"));
        assert_eq!(event.kind, FsEventKind::Created);

        handle.close().await;
        // drain whatever the final scan delivered, then the stream ends
        while let Some(event) = rx.recv().await {
            assert_ne!(event.path, dir.path().join("existing.txt"));
        }
    }

    #[tokio::test]
    async fn test_close_delivers_final_changes() {
        let dir = tempfile::tempdir().unwrap();
        // long interval: only the closing scan can see the write
        let (handle, mut rx) = watch_paths(vec![dir.path().to_path_buf()], Duration::from_secs(3600)).await;
        fs::write(dir.path().join("done.json"), "{}").unwrap();
        handle.close().await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.path, dir.path().join("done.json"));
        assert!(rx.recv().await.is_none());
    }
}
