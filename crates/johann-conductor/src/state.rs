use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    /// Waiting on a dependency before being queued.
    Deferred,
    Queued,
    Started,
    Progress,
    Retry,
    Failure,
    Success,
}

impl TaskState {
    pub const ALL: [TaskState; 8] = [
        TaskState::Success,
        TaskState::Pending,
        TaskState::Deferred,
        TaskState::Queued,
        TaskState::Started,
        TaskState::Progress,
        TaskState::Retry,
        TaskState::Failure,
    ];

    /// Position in the escalation order, low to high.
    pub fn severity(self) -> u8 {
        match self {
            TaskState::Success => 0,
            TaskState::Pending => 1,
            TaskState::Deferred => 2,
            TaskState::Queued => 3,
            TaskState::Started => 4,
            TaskState::Progress => 5,
            TaskState::Retry => 6,
            TaskState::Failure => 7,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Success | TaskState::Failure)
    }

    pub fn escalate(self, other: TaskState) -> TaskState {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Deferred => "DEFERRED",
            TaskState::Queued => "QUEUED",
            TaskState::Started => "STARTED",
            TaskState::Progress => "PROGRESS",
            TaskState::Retry => "RETRY",
            TaskState::Failure => "FAILURE",
            TaskState::Success => "SUCCESS",
        }
    }
}

impl Ord for TaskState {
    fn cmp(&self, other: &Self) -> Ordering {
        self.severity().cmp(&other.severity())
    }
}

impl PartialOrd for TaskState {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("{} is not a valid TaskState", s))
    }
}

/// Rolls child states up into one: SUCCESS only when every child succeeded
/// (vacuously for no children), otherwise the most severe child state.
pub fn aggregate_states<I>(states: I) -> TaskState
where
    I: IntoIterator<Item = TaskState>,
{
    let mut all_success = true;
    let mut worst = TaskState::Success;
    for state in states {
        if state != TaskState::Success {
            all_success = false;
        }
        worst = worst.escalate(state);
    }
    if all_success {
        TaskState::Success
    } else {
        worst
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_is_a_strict_total_order() {
        for a in TaskState::ALL {
            for b in TaskState::ALL {
                if a == b {
                    assert_eq!(a.cmp(&b), Ordering::Equal);
                } else {
                    assert_ne!(a.severity(), b.severity(), "{} vs {}", a, b);
                    assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
                }
            }
        }
        let mut sorted = TaskState::ALL.to_vec();
        sorted.sort();
        assert_eq!(sorted, TaskState::ALL.to_vec());
    }

    #[test]
    fn success_is_the_unique_minimum() {
        for state in TaskState::ALL {
            if state != TaskState::Success {
                assert!(TaskState::Success < state);
                assert_eq!(TaskState::Success.escalate(state), state);
            }
        }
    }

    #[test]
    fn aggregate_all_success_is_success_in_any_order() {
        assert_eq!(aggregate_states(vec![TaskState::Success; 4]), TaskState::Success);
        assert_eq!(aggregate_states(Vec::new()), TaskState::Success);
    }

    #[test]
    fn aggregate_with_failure_and_terminal_children_is_failure() {
        let orders = [
            vec![TaskState::Failure, TaskState::Success, TaskState::Success],
            vec![TaskState::Success, TaskState::Failure, TaskState::Success],
            vec![TaskState::Success, TaskState::Success, TaskState::Failure],
        ];
        for states in orders {
            assert_eq!(aggregate_states(states), TaskState::Failure);
        }
    }

    #[test]
    fn aggregate_takes_most_severe_non_success() {
        let states = vec![TaskState::Success, TaskState::Progress, TaskState::Pending];
        assert_eq!(aggregate_states(states), TaskState::Progress);
    }

    #[test]
    fn parses_wire_names() {
        assert_eq!("RETRY".parse::<TaskState>().expect("retry"), TaskState::Retry);
        assert!("retry".parse::<TaskState>().is_err());
        let json = serde_json::to_string(&TaskState::Deferred).expect("serialize");
        assert_eq!(json, "\"DEFERRED\"");
    }
}
