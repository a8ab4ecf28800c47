use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Job instance state machine.
///
/// `Submitted -> Attributed -> Running -> {Ended, Crashed, Killed}`, plus
/// `Submitted <-> Holded` and `{Submitted, Attributed} -> Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    Submitted,
    Attributed,
    Running,
    Holded,
    Ended,
    Crashed,
    Killed,
    Cancelled,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            State::Ended | State::Crashed | State::Killed | State::Cancelled
        )
    }

    /// States that count against a highlander definition.
    pub fn is_active(self) -> bool {
        matches!(self, State::Attributed | State::Running)
    }

    pub fn can_transition_to(self, next: State) -> bool {
        use State::*;
        matches!(
            (self, next),
            (Submitted, Attributed)
                | (Submitted, Holded)
                | (Holded, Submitted)
                | (Submitted, Cancelled)
                | (Attributed, Cancelled)
                | (Attributed, Running)
                | (Attributed, Crashed)
                | (Running, Ended)
                | (Running, Crashed)
                | (Running, Killed)
        )
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Submitted => "SUBMITTED",
            State::Attributed => "ATTRIBUTED",
            State::Running => "RUNNING",
            State::Holded => "HOLDED",
            State::Ended => "ENDED",
            State::Crashed => "CRASHED",
            State::Killed => "KILLED",
            State::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// How a job definition is launched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PayloadKind {
    /// A payload registered in-process under this name.
    InProcess { name: String },
    /// An external program, run as a child process.
    External { program: String, args: Vec<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: i64,
    pub application_name: String,
    pub description: Option<String>,
    pub payload: PayloadKind,
    pub queue_id: i64,
    pub priority: i32,
    /// At most one active instance cluster-wide.
    pub highlander: bool,
    pub can_be_restarted: bool,
    /// Alert threshold, in minutes. Exceeding it never kills the instance.
    pub max_time_running_min: Option<u32>,
    pub application: Option<String>,
    pub module: Option<String>,
    pub keywords: Vec<String>,
    pub parameters: HashMap<String, String>,
}

impl JobDefinition {
    pub fn new(
        id: i64,
        application_name: impl Into<String>,
        payload: PayloadKind,
        queue_id: i64,
    ) -> Self {
        Self {
            id,
            application_name: application_name.into(),
            description: None,
            payload,
            queue_id,
            priority: 0,
            highlander: false,
            can_be_restarted: true,
            max_time_running_min: None,
            application: None,
            module: None,
            keywords: Vec::new(),
            parameters: HashMap::new(),
        }
    }

    pub fn highlander(mut self) -> Self {
        self.highlander = true;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_max_time_running(mut self, minutes: u32) -> Self {
        self.max_time_running_min = Some(minutes);
        self
    }
}

/// A live execution request. The database row is authoritative; this is a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: i64,
    pub job_def_id: i64,
    pub application_name: String,
    pub queue_id: i64,
    pub state: State,
    pub node_id: Option<i64>,
    /// Monotonic enqueue order, assigned by the database.
    pub position: i64,
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
    pub attributed_at: Option<DateTime<Utc>>,
    pub begun_at: Option<DateTime<Utc>>,
    pub run_after: Option<DateTime<Utc>>,
    pub parameters: HashMap<String, String>,
    pub session_id: Option<String>,
    pub user_name: Option<String>,
    pub application: Option<String>,
    pub module: Option<String>,
    pub parent_id: Option<i64>,
    pub progress: Option<i32>,
    pub kill_requested: bool,
}

impl JobInstance {
    /// A `Submitted` instance of `definition` with the definition's defaults. `position`
    /// follows `id`.
    pub fn new(id: i64, definition: &JobDefinition) -> Self {
        Self {
            id,
            job_def_id: definition.id,
            application_name: definition.application_name.clone(),
            queue_id: definition.queue_id,
            state: State::Submitted,
            node_id: None,
            position: id,
            priority: definition.priority,
            enqueued_at: Utc::now(),
            attributed_at: None,
            begun_at: None,
            run_after: None,
            parameters: definition.parameters.clone(),
            session_id: None,
            user_name: None,
            application: definition.application.clone(),
            module: definition.module.clone(),
            parent_id: None,
            progress: None,
            kill_requested: false,
        }
    }

    /// Same instance, bound to `node_id` in `state`, as a crashed node would leave it.
    pub fn bound_to(mut self, node_id: i64, state: State) -> Self {
        self.node_id = Some(node_id);
        self.state = state;
        self.attributed_at = Some(self.enqueued_at);
        if state == State::Running {
            self.begun_at = Some(self.enqueued_at);
        }
        self
    }
}

/// A request to create a job instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequest {
    pub application_name: String,
    /// Overrides the definition's default queue.
    pub queue_id: Option<i64>,
    /// Overrides the definition's default priority.
    pub priority: Option<i32>,
    pub run_after: Option<DateTime<Utc>>,
    /// Create the instance parked in `Holded`.
    pub start_held: bool,
    pub parameters: HashMap<String, String>,
    pub session_id: Option<String>,
    pub user_name: Option<String>,
    pub application: Option<String>,
    pub module: Option<String>,
    pub parent_id: Option<i64>,
}

impl JobRequest {
    pub fn new(application_name: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
            ..Default::default()
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn on_queue(mut self, queue_id: i64) -> Self {
        self.queue_id = Some(queue_id);
        self
    }

    pub fn run_after(mut self, at: DateTime<Utc>) -> Self {
        self.run_after = Some(at);
        self
    }

    pub fn held(mut self) -> Self {
        self.start_held = true;
        self
    }
}

/// Immutable terminal record of a job instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct History {
    pub id: i64,
    pub job_def_id: i64,
    pub application_name: String,
    pub queue_id: i64,
    pub node_id: Option<i64>,
    pub state: State,
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
    pub attributed_at: Option<DateTime<Utc>>,
    pub begun_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    pub parameters: HashMap<String, String>,
    pub session_id: Option<String>,
    pub user_name: Option<String>,
    pub parent_id: Option<i64>,
    pub progress: Option<i32>,
}

impl History {
    pub fn from_instance(ji: &JobInstance, state: State, ended_at: DateTime<Utc>) -> Self {
        Self {
            id: ji.id,
            job_def_id: ji.job_def_id,
            application_name: ji.application_name.clone(),
            queue_id: ji.queue_id,
            node_id: ji.node_id,
            state,
            priority: ji.priority,
            enqueued_at: ji.enqueued_at,
            attributed_at: ji.attributed_at,
            begun_at: ji.begun_at,
            ended_at,
            parameters: ji.parameters.clone(),
            session_id: ji.session_id.clone(),
            user_name: ji.user_name.clone(),
            parent_id: ji.parent_id,
            progress: ji.progress,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub job_instance_id: i64,
    pub text: String,
}

/// A file produced by a job instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deliverable {
    pub id: i64,
    pub job_instance_id: i64,
    pub path: std::path::PathBuf,
    pub original_name: String,
    pub label: String,
}

/// The computed terminal state of an instance, ready to be written as History.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub instance: JobInstance,
    pub state: State,
    pub ended_at: DateTime<Utc>,
    /// Messages recorded together with the History row.
    pub messages: Vec<String>,
}

impl Outcome {
    pub fn new(instance: JobInstance, state: State) -> Self {
        Self {
            instance,
            state,
            ended_at: Utc::now(),
            messages: Vec::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.messages.push(message.into());
        self
    }

    pub fn history(&self) -> History {
        History::from_instance(&self.instance, self.state, self.ended_at)
    }
}
