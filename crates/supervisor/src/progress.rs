//! av1an's progress side files: `done.json` and `chunks.json`.
//!
//! av1an rewrites `done.json` in place every time a chunk finishes, so a
//! read can land in the middle of a write. Every read here is fallible and
//! callers are expected to wait for the next change instead of failing.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SideFileError;

pub const DONE_FILE: &str = "done.json";
pub const CHUNKS_FILE: &str = "chunks.json";

/// Completion record of one chunk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneRecord {
    pub frames: u64,
    pub size_bytes: u64,
}

/// Contents of `done.json`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneFile {
    /// Total frames of the whole encode, 0 until av1an has planned the chunks
    #[serde(default)]
    pub frames: u64,
    #[serde(default)]
    pub done: BTreeMap<String, DoneRecord>,
}

impl DoneFile {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn read(path: &Path) -> Result<Self, SideFileError> {
        let text = fs::read_to_string(path).map_err(|source| SideFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text).map_err(|source| SideFileError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Sum of frames over all completed chunks
    pub fn frames_done(&self) -> u64 {
        self.done.values().map(|r| r.frames).sum()
    }

    /// Sum of encoded bytes over all completed chunks
    pub fn bytes_done(&self) -> u64 {
        self.done.values().map(|r| r.size_bytes).sum()
    }
}

/// One entry of `chunks.json`. Only the frame rate is required; the rest of
/// av1an's chunk description is ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    #[serde(default)]
    pub index: Option<u64>,
    #[serde(default)]
    pub start_frame: Option<u64>,
    #[serde(default)]
    pub end_frame: Option<u64>,
    pub frame_rate: f64,
}

impl Chunk {
    pub fn frames(&self) -> Option<u64> {
        match (self.start_frame, self.end_frame) {
            (Some(start), Some(end)) if end >= start => Some(end - start),
            _ => None,
        }
    }
}

pub fn parse_chunks(text: &str) -> Result<Vec<Chunk>, serde_json::Error> {
    serde_json::from_str(text)
}

pub fn read_chunks(path: &Path) -> Result<Vec<Chunk>, SideFileError> {
    let text = fs::read_to_string(path).map_err(|source| SideFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_chunks(&text).map_err(|source| SideFileError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_done_file() {
        let done = DoneFile::parse(
            r#"{"frames":100,"done":{"0":{"frames":50,"size_bytes":1000},"3":{"frames":20,"size_bytes":300}},"audio_done":true}"#,
        )
        .unwrap();
        assert_eq!(done.frames, 100);
        assert_eq!(done.frames_done(), 70);
        assert_eq!(done.bytes_done(), 1300);
    }

    #[test]
    fn test_truncated_done_file_is_an_error() {
        assert!(DoneFile::parse(r#"{"frames":100,"done":{"0":{"frames":5"#).is_err());
        assert!(DoneFile::parse("").is_err());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = DoneFile::read(&dir.path().join(DONE_FILE)).unwrap_err();
        assert!(matches!(err, SideFileError::Io { .. }));
    }

    #[test]
    fn test_parse_chunks_ignores_extra_fields() {
        let chunks = parse_chunks(
            r#"[{"index":0,"start_frame":0,"end_frame":48,"frame_rate":23.976,"passes":1,"encoder":"svt_av1"},
                {"index":1,"frame_rate":23.976}]"#,
        )
        .unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].frames(), Some(48));
        assert_eq!(chunks[1].frames(), None);
        assert!((chunks[1].frame_rate - 23.976).abs() < 1e-9);
    }
}
