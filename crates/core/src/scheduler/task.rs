use std::{fmt, str::FromStr, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    analysis::{Spectrogram, Waveform},
    WaveviewError,
};

/// Opaque identifier of a generation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which artifacts a task produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Waveform,
    Spectrogram,
    Both,
}

impl TaskKind {
    pub fn wants_waveform(self) -> bool {
        matches!(self, TaskKind::Waveform | TaskKind::Both)
    }

    pub fn wants_spectrogram(self) -> bool {
        matches!(self, TaskKind::Spectrogram | TaskKind::Both)
    }
}

impl FromStr for TaskKind {
    type Err = WaveviewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "waveform" => Ok(TaskKind::Waveform),
            "spectrogram" => Ok(TaskKind::Spectrogram),
            "both" => Ok(TaskKind::Both),
            other => Err(WaveviewError::validation(format!("unknown task kind `{other}`"))),
        }
    }
}

/// Admission priority. Declaration order is the rank: `High` runs first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    pub fn outranks(self, other: Priority) -> bool {
        self.rank() < other.rank()
    }
}

impl FromStr for Priority {
    type Err = WaveviewError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(WaveviewError::validation(format!("unknown priority `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

/// Output size of the requested artifacts. `height` only applies to
/// spectrograms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: usize,
    pub height: usize,
}

impl Dimensions {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }
}

/// Parameters for [`super::TaskScheduler::add_request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    pub resource_key: String,
    /// Reference handed to the audio source, e.g. a path or URL.
    pub source: String,
    pub kind: TaskKind,
    pub priority: Priority,
    /// `None` uses the configured default size.
    pub dimensions: Option<Dimensions>,
}

impl TaskRequest {
    pub fn new(resource_key: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            resource_key: resource_key.into(),
            source: source.into(),
            kind: TaskKind::Both,
            priority: Priority::Normal,
            dimensions: None,
        }
    }

    pub fn kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn dimensions(mut self, width: usize, height: usize) -> Self {
        self.dimensions = Some(Dimensions::new(width, height));
        self
    }
}

/// Snapshot of a task as stored in the scheduler's live table.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub resource_key: String,
    pub source: String,
    pub kind: TaskKind,
    pub priority: Priority,
    pub status: TaskStatus,
    /// 0 to 100, never decreasing while running.
    pub progress: u8,
    pub dimensions: Dimensions,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    #[serde(skip)]
    pub(crate) sequence: u64,
    #[serde(skip)]
    pub(crate) cancellation: CancellationToken,
}

impl Task {
    pub(crate) fn new(request: TaskRequest, dimensions: Dimensions, sequence: u64) -> Self {
        Self {
            id: TaskId::new(),
            resource_key: request.resource_key,
            source: request.source,
            kind: request.kind,
            priority: request.priority,
            status: TaskStatus::Pending,
            progress: 0,
            dimensions,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
            sequence,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// Counts of tasks in the live table by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Artifacts delivered on completion. Only the requested kinds are set.
#[derive(Debug, Clone, Default)]
pub struct Artifacts {
    pub waveform: Option<Arc<Waveform>>,
    pub spectrogram: Option<Arc<Spectrogram>>,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    pub resource_key: String,
    pub progress: u8,
}

#[derive(Debug, Clone)]
pub struct CompletionEvent {
    pub task_id: TaskId,
    pub resource_key: String,
    pub kind: TaskKind,
    pub artifacts: Artifacts,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub task_id: TaskId,
    pub resource_key: String,
    pub error: Arc<WaveviewError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_rank_orders_high_first() {
        assert!(Priority::High.outranks(Priority::Normal));
        assert!(Priority::Normal.outranks(Priority::Low));
        assert!(!Priority::Low.outranks(Priority::Low));
        assert!(Priority::High < Priority::Low);
    }

    #[test]
    fn kinds_select_artifacts() {
        assert!(TaskKind::Both.wants_waveform() && TaskKind::Both.wants_spectrogram());
        assert!(!TaskKind::Waveform.wants_spectrogram());
        assert!(!TaskKind::Spectrogram.wants_waveform());
    }

    #[test]
    fn parses_names() {
        assert_eq!("Both".parse::<TaskKind>().unwrap(), TaskKind::Both);
        assert_eq!("low".parse::<Priority>().unwrap(), Priority::Low);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn serialized_task_omits_token() {
        let task = Task::new(TaskRequest::new("a.wav", "/tmp/a.wav"), Dimensions::new(8, 4), 0);
        let json = serde_json::to_value(&task).unwrap();

        assert_eq!(json["status"], "pending");
        assert_eq!(json["priority"], "normal");
        assert!(json.get("cancellation").is_none());
    }
}
