//! Throughput, bitrate and ETA derived from a job's status history and the
//! latest done-file.
//!
//! Every derived figure is `None` while its divisor is zero or unknown, so
//! callers never see `NaN` or infinities. In particular nothing but the
//! cumulative counters is reported before the first chunk completes.

use chrono::{DateTime, Utc};

use crate::progress::{Chunk, DoneFile};
use crate::status::{ChunkDelta, ProgressSnapshot, StatusHistory};

/// Everything the estimates are computed from
#[derive(Debug, Clone, Copy)]
pub struct EstimateInput<'a> {
    pub history: &'a StatusHistory,
    pub done: &'a DoneFile,
    /// Largest total frame count seen so far
    pub total_frames: u64,
    pub chunks: &'a [Chunk],
    /// Frames of the newest batch of chunks completed in the current run
    /// window
    pub batch_frames: u64,
    pub fallback_framerate: f64,
    pub now: DateTime<Utc>,
}

/// Frame rate of the first chunk, or the fallback
pub fn framerate(chunks: &[Chunk], fallback: f64) -> f64 {
    chunks
        .first()
        .map(|c| c.frame_rate)
        .filter(|fps| fps.is_finite() && *fps > 0.0)
        .unwrap_or(fallback)
}

/// Completed frames, never more than the known total
pub fn frames_completed(done: &DoneFile, total_frames: u64) -> u64 {
    let frames = done.frames_done();
    if total_frames > 0 {
        frames.min(total_frames)
    } else {
        frames
    }
}

/// Bits per second over every completed chunk
pub fn bitrate(done: &DoneFile, framerate: f64) -> Option<f64> {
    let frames = done.frames_done();
    if frames == 0 || framerate <= 0.0 {
        return None;
    }
    let seconds = frames as f64 / framerate;
    Some(done.bytes_done() as f64 * 8.0 / seconds)
}

/// Frames of the newest batch of chunks divided by the seconds since the
/// current run window opened. The window opens at the latest start or resume.
pub fn frames_per_second(
    history: &StatusHistory,
    batch_frames: u64,
    now: DateTime<Utc>,
) -> Option<f64> {
    let start = history.run_window_start()?;
    let opened = history.events()[start].time;

    let elapsed = (now - opened).num_milliseconds() as f64 / 1000.0;
    if batch_frames == 0 || elapsed <= 0.0 {
        return None;
    }
    Some(batch_frames as f64 / elapsed)
}

pub fn estimated_seconds(total_frames: u64, frames_completed: u64, fps: Option<f64>) -> Option<f64> {
    let fps = fps.filter(|f| *f > 0.0)?;
    if total_frames == 0 {
        return None;
    }
    Some(total_frames.saturating_sub(frames_completed) as f64 / fps)
}

pub fn estimated_size(total_frames: u64, framerate: f64, bitrate: Option<f64>) -> Option<f64> {
    let bitrate = bitrate?;
    if total_frames == 0 || framerate <= 0.0 {
        return None;
    }
    Some(total_frames as f64 / framerate * bitrate / 8.0)
}

/// Full progress snapshot. `completed` are the chunks newly reported by
/// this snapshot. The newest of them becomes the snapshot's last chunk,
/// otherwise `last_chunk` is carried over.
pub fn snapshot(
    input: &EstimateInput<'_>,
    completed: Vec<ChunkDelta>,
    last_chunk: Option<ChunkDelta>,
) -> ProgressSnapshot {
    let rate = framerate(input.chunks, input.fallback_framerate);
    let frames = frames_completed(input.done, input.total_frames);
    let bitrate = bitrate(input.done, rate);
    let fps = frames_per_second(input.history, input.batch_frames, input.now);
    let last_chunk = completed.last().cloned().or(last_chunk);

    ProgressSnapshot {
        frames_completed: frames,
        bytes_completed: input.done.bytes_done(),
        total_frames: input.total_frames,
        bitrate,
        frames_per_second: fps,
        estimated_seconds: estimated_seconds(input.total_frames, frames, fps),
        estimated_size_in_bytes: estimated_size(input.total_frames, rate, bitrate),
        last_chunk,
        completed_chunks: completed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::DoneRecord;
    use crate::status::StateTag;
    use chrono::Duration;
    use proptest::prelude::*;

    fn done(frames: u64, records: &[(&str, u64, u64)]) -> DoneFile {
        DoneFile {
            frames,
            done: records
                .iter()
                .map(|(id, f, b)| (id.to_string(), DoneRecord { frames: *f, size_bytes: *b }))
                .collect(),
        }
    }

    fn chunk(rate: f64) -> Chunk {
        Chunk {
            index: Some(0),
            start_frame: None,
            end_frame: None,
            frame_rate: rate,
        }
    }

    #[test]
    fn test_framerate_prefers_first_chunk() {
        assert_eq!(framerate(&[], 25.0), 25.0);
        assert_eq!(framerate(&[chunk(24.0), chunk(30.0)], 25.0), 24.0);
        assert_eq!(framerate(&[chunk(0.0)], 25.0), 25.0);
    }

    #[test]
    fn test_bitrate_over_all_completed_frames() {
        // 48 frames at 24 fps = 2 s, 2000 bytes = 16000 bits
        let file = done(100, &[("0", 24, 1000), ("1", 24, 1000)]);
        assert_eq!(bitrate(&file, 24.0), Some(8000.0));
        assert_eq!(bitrate(&done(100, &[]), 24.0), None);
    }

    #[test]
    fn test_estimated_size_scales_bitrate_to_total() {
        // 96 frames at 24 fps = 4 s at 8000 bps = 4000 bytes
        assert_eq!(estimated_size(96, 24.0, Some(8000.0)), Some(4000.0));
        assert_eq!(estimated_size(0, 24.0, Some(8000.0)), None);
        assert_eq!(estimated_size(96, 24.0, None), None);
    }

    fn delta(id: &str, frames: u64) -> ChunkDelta {
        ChunkDelta {
            id: id.to_string(),
            frames,
            size_bytes: 1000,
        }
    }

    #[test]
    fn test_fps_uses_current_window() {
        let start = Utc::now();
        let mut history = StatusHistory::new();
        history.push_at(start, StateTag::Idle, None, None);
        history.push_at(start, StateTag::Encoding, None, None);

        // nothing completed yet
        assert_eq!(frames_per_second(&history, 0, start + Duration::seconds(5)), None);
        // zero elapsed time
        assert_eq!(frames_per_second(&history, 50, start), None);
        // 50 frames in 10 s
        assert_eq!(
            frames_per_second(&history, 50, start + Duration::seconds(10)),
            Some(5.0)
        );
    }

    #[test]
    fn test_fps_counts_newest_batch_only() {
        let start = Utc::now();
        let first_file = done(200, &[("0", 50, 1000)]);
        let mut history = StatusHistory::new();
        history.push_at(start, StateTag::Idle, None, None);
        history.push_at(start, StateTag::Encoding, None, None);
        let first = snapshot(
            &EstimateInput {
                history: &history,
                done: &first_file,
                total_frames: 200,
                chunks: &[],
                batch_frames: 50,
                fallback_framerate: 25.0,
                now: start + Duration::seconds(10),
            },
            vec![delta("0", 50)],
            None,
        );
        assert_eq!(first.frames_per_second, Some(5.0));
        history.push_at(start + Duration::seconds(10), StateTag::Encoding, Some(first), None);

        // second batch of 50 frames, 20 s after the window opened
        let second_file = done(200, &[("0", 50, 1000), ("1", 50, 1000)]);
        let second = snapshot(
            &EstimateInput {
                history: &history,
                done: &second_file,
                total_frames: 200,
                chunks: &[],
                batch_frames: 50,
                fallback_framerate: 25.0,
                now: start + Duration::seconds(20),
            },
            vec![delta("1", 50)],
            None,
        );
        assert_eq!(second.frames_per_second, Some(2.5));
        assert_eq!(second.frames_completed, 100);
        assert_eq!(second.estimated_seconds, Some(40.0));
        assert_eq!(second.last_chunk.map(|c| c.id), Some("1".to_string()));
    }

    #[test]
    fn test_fps_window_reopens_on_resume() {
        let start = Utc::now();
        let mut history = StatusHistory::new();
        history.push_at(start, StateTag::Encoding, None, None);
        history.push_at(start + Duration::seconds(20), StateTag::Paused, None, None);
        history.push_at(start + Duration::seconds(60), StateTag::Encoding, None, None);

        // 50 frames in the 10 s since resume
        assert_eq!(
            frames_per_second(&history, 50, start + Duration::seconds(70)),
            Some(5.0)
        );
    }

    #[test]
    fn test_last_chunk_falls_back_when_nothing_new() {
        let history = StatusHistory::new();
        let file = done(100, &[("0", 50, 1000)]);
        let input = EstimateInput {
            history: &history,
            done: &file,
            total_frames: 100,
            chunks: &[],
            batch_frames: 0,
            fallback_framerate: 25.0,
            now: Utc::now(),
        };
        let snap = snapshot(&input, Vec::new(), Some(delta("0", 50)));
        assert!(snap.completed_chunks.is_empty());
        assert_eq!(snap.last_chunk.map(|c| c.id), Some("0".to_string()));
    }

    #[test]
    fn test_eta_sentinels() {
        assert_eq!(estimated_seconds(100, 50, Some(5.0)), Some(10.0));
        assert_eq!(estimated_seconds(100, 50, None), None);
        assert_eq!(estimated_seconds(100, 50, Some(0.0)), None);
        assert_eq!(estimated_seconds(0, 50, Some(5.0)), None);
    }

    #[test]
    fn test_snapshot_before_any_chunk_has_no_rates() {
        let history = StatusHistory::new();
        let file = DoneFile::default();
        let input = EstimateInput {
            history: &history,
            done: &file,
            total_frames: 0,
            chunks: &[],
            batch_frames: 0,
            fallback_framerate: 25.0,
            now: Utc::now(),
        };
        let snap = snapshot(&input, Vec::new(), None);
        assert_eq!(snap.frames_completed, 0);
        assert_eq!(snap.bitrate, None);
        assert_eq!(snap.frames_per_second, None);
        assert_eq!(snap.estimated_seconds, None);
        assert_eq!(snap.estimated_size_in_bytes, None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Completed frames never exceed a known total, and every estimate is finite
        #[test]
        fn prop_completed_frames_clamped(
            total in 1u64..10_000,
            records in prop::collection::vec((0u64..5_000, 0u64..1_000_000), 0..20),
            elapsed in 0i64..100_000,
            batch in 0u64..5_000,
        ) {
            let file = DoneFile {
                frames: total,
                done: records
                    .iter()
                    .enumerate()
                    .map(|(i, (f, b))| (i.to_string(), DoneRecord { frames: *f, size_bytes: *b }))
                    .collect(),
            };
            let start = Utc::now();
            let mut history = StatusHistory::new();
            history.push_at(start, StateTag::Encoding, None, None);
            let input = EstimateInput {
                history: &history,
                done: &file,
                total_frames: total,
                chunks: &[],
                batch_frames: batch,
                fallback_framerate: 25.0,
                now: start + Duration::milliseconds(elapsed),
            };
            let snap = snapshot(&input, Vec::new(), None);

            prop_assert!(snap.frames_completed <= total);
            for value in [
                snap.bitrate,
                snap.frames_per_second,
                snap.estimated_seconds,
                snap.estimated_size_in_bytes,
            ]
            .into_iter()
            .flatten()
            {
                prop_assert!(value.is_finite());
            }
        }
    }
}
