use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of a job at one point in its history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StateTag {
    Idle,
    SceneDetection,
    Encoding,
    Paused,
    Done,
    Cancelled,
    Error,
}

impl StateTag {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StateTag::Done | StateTag::Cancelled | StateTag::Error)
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            StateTag::SceneDetection | StateTag::Encoding | StateTag::Paused
        )
    }
}

/// Completion deltas of a single chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDelta {
    pub id: String,
    pub frames: u64,
    pub size_bytes: u64,
}

/// Cumulative progress at the time of an event.
///
/// Derived rates are `None` until they can be computed without dividing by
/// zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub frames_completed: u64,
    pub bytes_completed: u64,
    pub total_frames: u64,
    /// Bits per second over all completed frames
    pub bitrate: Option<f64>,
    pub frames_per_second: Option<f64>,
    pub estimated_seconds: Option<f64>,
    pub estimated_size_in_bytes: Option<f64>,
    pub last_chunk: Option<ChunkDelta>,
    /// Chunks first reported by this snapshot, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub completed_chunks: Vec<ChunkDelta>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Spawn,
    AbnormalExit,
}

/// Failure recorded on an `error` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFailure {
    pub kind: FailureKind,
    pub exit_code: Option<i32>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub time: DateTime<Utc>,
    pub state: StateTag,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
}

/// Append-only, time-ordered record of a job's states
#[derive(Debug, Clone, Default)]
pub struct StatusHistory {
    events: Vec<StatusEvent>,
}

impl StatusHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event stamped now
    pub fn push(
        &mut self,
        state: StateTag,
        progress: Option<ProgressSnapshot>,
        error: Option<JobFailure>,
    ) -> &StatusEvent {
        self.push_at(Utc::now(), state, progress, error)
    }

    /// Append an event at `time`. A time earlier than the latest event (clock
    /// adjustments) is raised to the latest event's time.
    pub fn push_at(
        &mut self,
        time: DateTime<Utc>,
        state: StateTag,
        progress: Option<ProgressSnapshot>,
        error: Option<JobFailure>,
    ) -> &StatusEvent {
        let time = match self.events.last() {
            Some(last) if last.time > time => last.time,
            _ => time,
        };
        self.events.push(StatusEvent {
            time,
            state,
            progress,
            error,
        });
        &self.events[self.events.len() - 1]
    }

    pub fn events(&self) -> &[StatusEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn latest(&self) -> Option<&StatusEvent> {
        self.events.last()
    }

    pub fn latest_state(&self) -> Option<StateTag> {
        self.events.last().map(|e| e.state)
    }

    pub fn is_cancelled(&self) -> bool {
        self.latest_state() == Some(StateTag::Cancelled)
    }

    /// Most recent progress snapshot, if any
    pub fn latest_progress(&self) -> Option<&ProgressSnapshot> {
        self.events.iter().rev().find_map(|e| e.progress.as_ref())
    }

    /// Index of the event that opened the current run: the latest `idle`
    /// event or `encoding` event without progress (a start or a resume).
    pub fn run_window_start(&self) -> Option<usize> {
        self.events.iter().rposition(|e| {
            e.state == StateTag::Idle || (e.state == StateTag::Encoding && e.progress.is_none())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    #[test]
    fn test_window_start_tracks_resume() {
        let mut history = StatusHistory::new();
        history.push(StateTag::Idle, None, None);
        assert_eq!(history.run_window_start(), Some(0));

        history.push(StateTag::Encoding, None, None);
        assert_eq!(history.run_window_start(), Some(1));

        let snapshot = ProgressSnapshot {
            frames_completed: 10,
            bytes_completed: 100,
            total_frames: 100,
            bitrate: None,
            frames_per_second: None,
            estimated_seconds: None,
            estimated_size_in_bytes: None,
            last_chunk: None,
            completed_chunks: Vec::new(),
        };
        history.push(StateTag::Encoding, Some(snapshot), None);
        assert_eq!(history.run_window_start(), Some(1));
        assert_eq!(history.latest_progress().map(|p| p.frames_completed), Some(10));

        history.push(StateTag::Paused, None, None);
        history.push(StateTag::Encoding, None, None);
        assert_eq!(history.run_window_start(), Some(4));
    }

    #[test]
    fn test_terminal_and_cancellable_states() {
        assert!(StateTag::Cancelled.is_terminal());
        assert!(!StateTag::Paused.is_terminal());
        assert!(StateTag::Paused.is_cancellable());
        assert!(!StateTag::Idle.is_cancellable());
        assert!(!StateTag::Done.is_cancellable());
    }

    #[test]
    fn test_event_serializes_with_kebab_state() {
        let mut history = StatusHistory::new();
        let event = history.push(StateTag::SceneDetection, None, None).clone();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["state"], "scene-detection");
        assert!(json.get("progress").is_none());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Event times never go backwards, whatever clock readings arrive
        #[test]
        fn prop_history_is_time_ordered(offsets in prop::collection::vec(-5_000i64..5_000, 1..40)) {
            let base = Utc::now();
            let mut history = StatusHistory::new();
            for (i, offset) in offsets.iter().enumerate() {
                let state = if i % 2 == 0 { StateTag::Encoding } else { StateTag::Paused };
                history.push_at(base + Duration::milliseconds(*offset), state, None, None);
            }

            prop_assert_eq!(history.len(), offsets.len());
            for pair in history.events().windows(2) {
                prop_assert!(pair[0].time <= pair[1].time);
            }
        }
    }
}
