use crate::errors::ArgumentError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

// Helper functions for optional durations, persisted as milliseconds
fn serialize_opt_duration_ms<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
        None => serializer.serialize_none(),
    }
}

fn deserialize_opt_duration_ms<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let ms = Option::<u64>::deserialize(deserializer)?;
    Ok(ms.map(Duration::from_millis))
}

// ============================================================================
// Trigger Models
// ============================================================================

/// Closed set of trigger kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    /// Fire once at an absolute timestamp
    At,
    /// Fire once after a delay counted from creation
    In,
    /// Fire on every tick of a cron rule
    Cron,
    /// Fire repeatedly at a fixed interval
    Every,
    /// Fire on matching data-change events
    Event,
}

impl TriggerType {
    pub fn is_one_shot(&self) -> bool {
        matches!(self, TriggerType::At | TriggerType::In)
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerType::At => write!(f, "at"),
            TriggerType::In => write!(f, "in"),
            TriggerType::Cron => write!(f, "cron"),
            TriggerType::Every => write!(f, "every"),
            TriggerType::Event => write!(f, "event"),
        }
    }
}

impl FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Accept the "@at" spelling used by older trigger documents
        match s.trim_start_matches('@') {
            "at" => Ok(TriggerType::At),
            "in" => Ok(TriggerType::In),
            "cron" => Ok(TriggerType::Cron),
            "every" => Ok(TriggerType::Every),
            "event" => Ok(TriggerType::Event),
            other => Err(format!("Invalid trigger type: {}", other)),
        }
    }
}

/// Execution limits attached to a trigger and copied onto every job it spawns
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Maximum number of attempts; 0 means "use the worker default"
    #[serde(default)]
    pub max_exec_count: u32,
    /// Cumulative time budget across all attempts
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_opt_duration_ms",
        deserialize_with = "deserialize_opt_duration_ms",
        rename = "max_exec_time_ms"
    )]
    pub max_exec_time: Option<Duration>,
    /// Time budget for one attempt
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_opt_duration_ms",
        deserialize_with = "deserialize_opt_duration_ms",
        rename = "timeout_ms"
    )]
    pub timeout: Option<Duration>,
}

impl JobOptions {
    /// Fill every unset field from `defaults`
    pub fn with_defaults(&self, defaults: &JobOptions) -> JobOptions {
        JobOptions {
            max_exec_count: if self.max_exec_count == 0 {
                defaults.max_exec_count.max(1)
            } else {
                self.max_exec_count
            },
            max_exec_time: self.max_exec_time.or(defaults.max_exec_time),
            timeout: self.timeout.or(defaults.timeout),
        }
    }

    /// Per-attempt limit; a zero duration disables it
    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.timeout.filter(|d| !d.is_zero())
    }

    /// Cumulative limit; a zero duration disables it
    pub fn overall_limit(&self) -> Option<Duration> {
        self.max_exec_time.filter(|d| !d.is_zero())
    }
}

/// Immutable persisted description of a trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerInfos {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub domain: String,
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    #[serde(rename = "worker")]
    pub worker_type: String,
    pub arguments: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debounce: Option<String>,
    #[serde(default)]
    pub message: serde_json::Value,
    #[serde(default)]
    pub options: JobOptions,
    /// Anchor for relative `in` triggers, fixed at first construction
    pub created_at: DateTime<Utc>,
}

impl TriggerInfos {
    pub fn builder(trigger_type: TriggerType, worker_type: impl Into<String>) -> TriggerInfosBuilder {
        TriggerInfosBuilder {
            domain: String::new(),
            trigger_type,
            worker_type: worker_type.into(),
            arguments: String::new(),
            debounce: None,
            message: serde_json::Value::Null,
            options: JobOptions::default(),
        }
    }

    /// Check the arguments against the trigger type
    pub fn validate(&self) -> Result<(), ArgumentError> {
        crate::schedule::validate_arguments(
            self.trigger_type,
            &self.arguments,
            self.debounce.as_deref(),
        )
    }

    /// Job request carrying this trigger's payload, without an event
    pub fn job_request(&self) -> JobRequest {
        JobRequest {
            domain: self.domain.clone(),
            worker_type: self.worker_type.clone(),
            message: self.message.clone(),
            event: None,
            debounced: false,
            options: self.options.clone(),
            trigger_id: Some(self.id),
        }
    }
}

/// Builder for [`TriggerInfos`]; `build` validates the arguments
#[derive(Debug, Clone)]
pub struct TriggerInfosBuilder {
    domain: String,
    trigger_type: TriggerType,
    worker_type: String,
    arguments: String,
    debounce: Option<String>,
    message: serde_json::Value,
    options: JobOptions,
}

impl TriggerInfosBuilder {
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn arguments(mut self, arguments: impl Into<String>) -> Self {
        self.arguments = arguments.into();
        self
    }

    pub fn debounce(mut self, debounce: impl Into<String>) -> Self {
        self.debounce = Some(debounce.into());
        self
    }

    pub fn message(mut self, message: serde_json::Value) -> Self {
        self.message = message;
        self
    }

    pub fn options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Result<TriggerInfos, ArgumentError> {
        let infos = TriggerInfos {
            id: Uuid::new_v4(),
            rev: None,
            domain: self.domain,
            trigger_type: self.trigger_type,
            worker_type: self.worker_type,
            arguments: self.arguments,
            debounce: self.debounce.filter(|d| !d.is_empty()),
            message: self.message,
            options: self.options,
            created_at: Utc::now(),
        };
        infos.validate()?;
        Ok(infos)
    }
}

// ============================================================================
// Change Events
// ============================================================================

/// Kind of document change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verb {
    Created,
    Updated,
    Deleted,
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verb::Created => write!(f, "CREATED"),
            Verb::Updated => write!(f, "UPDATED"),
            Verb::Deleted => write!(f, "DELETED"),
        }
    }
}

impl FromStr for Verb {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATED" => Ok(Verb::Created),
            "UPDATED" => Ok(Verb::Updated),
            "DELETED" => Ok(Verb::Deleted),
            other => Err(format!("Invalid verb: {}", other)),
        }
    }
}

/// Notification delivered by the change feed and carried on event jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub domain: String,
    pub verb: Verb,
    pub doctype: String,
    pub doc: serde_json::Value,
    #[serde(default, rename = "old", skip_serializing_if = "Option::is_none")]
    pub old_doc: Option<serde_json::Value>,
}

// ============================================================================
// Job Models
// ============================================================================

/// Transient request to create a job, produced by a trigger or a client
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub domain: String,
    pub worker_type: String,
    pub message: serde_json::Value,
    pub event: Option<ChangeEvent>,
    pub debounced: bool,
    pub options: JobOptions,
    pub trigger_id: Option<Uuid>,
}

impl JobRequest {
    pub fn new(
        domain: impl Into<String>,
        worker_type: impl Into<String>,
        message: serde_json::Value,
    ) -> Self {
        Self {
            domain: domain.into(),
            worker_type: worker_type.into(),
            message,
            event: None,
            debounced: false,
            options: JobOptions::default(),
            trigger_id: None,
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Done,
    Errored,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Done => write!(f, "done"),
            JobState::Errored => write!(f, "errored"),
        }
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "done" => Ok(JobState::Done),
            "errored" => Ok(JobState::Errored),
            _ => Err(format!("Invalid job state: {}", s)),
        }
    }
}

/// Persisted unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub domain: String,
    #[serde(rename = "worker")]
    pub worker_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<Uuid>,
    #[serde(default)]
    pub message: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<ChangeEvent>,
    #[serde(default)]
    pub debounced: bool,
    pub options: JobOptions,
    pub state: JobState,
    pub queued_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Number of attempts started so far
    #[serde(default)]
    pub attempts: u32,
    /// Wall time spent running, summed over attempts
    #[serde(default)]
    pub exec_time_ms: u64,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Job {
    /// New `queued` job for the request, with options already resolved
    pub fn from_request(request: JobRequest, options: JobOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            rev: None,
            domain: request.domain,
            worker_type: request.worker_type,
            trigger_id: request.trigger_id,
            message: request.message,
            event: request.event,
            debounced: request.debounced,
            options,
            state: JobState::Queued,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            attempts: 0,
            exec_time_ms: 0,
            next_retry_at: None,
            error_kind: None,
            last_error: None,
        }
    }

    /// `done`, or `errored` with no retry pending
    pub fn is_terminal(&self) -> bool {
        match self.state {
            JobState::Done => true,
            JobState::Errored => self.next_retry_at.is_none(),
            JobState::Queued | JobState::Running => false,
        }
    }

    pub fn exec_time(&self) -> Duration {
        Duration::from_millis(self.exec_time_ms)
    }
}

/// Real-time notification emitted on every job state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStateEvent {
    pub domain: String,
    pub job_id: Uuid,
    pub worker_type: String,
    pub state: JobState,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl From<&Job> for JobStateEvent {
    fn from(job: &Job) -> Self {
        Self {
            domain: job.domain.clone(),
            job_id: job.id,
            worker_type: job.worker_type.clone(),
            state: job.state,
            attempts: job.attempts,
            error: job.last_error.clone(),
            at: Utc::now(),
        }
    }
}
