use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a hosted instance.
///
/// Instances cycle `Stopped → Starting → Running → Stopping → Stopped` and
/// are restarted rather than destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl InstanceState {
    pub fn is_serving(&self) -> bool {
        matches!(self, InstanceState::Running)
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: InstanceState) -> bool {
        matches!(
            (self, next),
            (InstanceState::Stopped, InstanceState::Starting)
                | (InstanceState::Starting, InstanceState::Running)
                | (InstanceState::Starting, InstanceState::Stopped)
                | (InstanceState::Running, InstanceState::Stopping)
                | (InstanceState::Stopping, InstanceState::Stopped)
        )
    }

    /// Collapse the states of a backend's instances into one.
    ///
    /// Unanimous states are reported as-is. Mixed sets report a transition
    /// in progress first, and `Running` when some instances serve while
    /// others are stopped.
    pub fn aggregate<I>(states: I) -> InstanceState
    where
        I: IntoIterator<Item = InstanceState>,
    {
        let mut seen = [false; 4];
        for state in states {
            seen[state as usize] = true;
        }
        let distinct = seen.iter().filter(|s| **s).count();
        if distinct == 0 {
            return InstanceState::Stopped;
        }
        if distinct == 1 {
            return [
                InstanceState::Stopped,
                InstanceState::Starting,
                InstanceState::Running,
                InstanceState::Stopping,
            ]
            .into_iter()
            .find(|s| seen[*s as usize])
            .unwrap_or(InstanceState::Stopped);
        }
        if seen[InstanceState::Starting as usize] {
            InstanceState::Starting
        } else if seen[InstanceState::Stopping as usize] {
            InstanceState::Stopping
        } else {
            InstanceState::Running
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::Stopped => write!(f, "STOPPED"),
            InstanceState::Starting => write!(f, "STARTING"),
            InstanceState::Running => write!(f, "RUNNING"),
            InstanceState::Stopping => write!(f, "STOPPING"),
        }
    }
}

/// Identity of one instance: (module, version, instance number).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub module: String,
    pub version: String,
    pub number: u32,
}

impl InstanceKey {
    pub fn new(module: impl Into<String>, version: impl Into<String>, number: u32) -> Self {
        Self {
            module: module.into(),
            version: version.into(),
            number,
        }
    }
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.number, self.version, self.module)
    }
}

/// Point-in-time view of a single instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub number: u32,
    pub address: String,
    pub state: InstanceState,
    pub started_at: Option<DateTime<Utc>>,
}

/// Point-in-time view of a backend and its instances.
///
/// This is a copy; mutating it has no effect on the hosted instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendState {
    pub name: String,
    pub address: String,
    pub state: InstanceState,
    /// Sorted by ascending instance number.
    pub instances: Vec<InstanceSnapshot>,
}
