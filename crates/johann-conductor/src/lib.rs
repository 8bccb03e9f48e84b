pub mod agent;
pub mod broker;
pub mod builtins;
pub mod bundle;
pub mod conductor;
pub mod config;
pub mod docker;
pub mod error;
pub mod host;
pub mod host_control;
pub mod loader;
pub mod measure;
pub mod orchestra;
pub mod player;
pub mod score;
pub mod special_args;
pub mod state;
pub mod stored;
pub mod task;
pub mod tuning;

pub use broker::LocalBroker;
pub use bundle::CodeVersion;
pub use conductor::{Conductor, RollCallUpdate};
pub use config::JohannConfig;
pub use error::{JohannError, JohannResponse, JohannResult};
pub use host::{Host, HostRegistry};
pub use host_control::{HostControl, HostControlRegistry, MemoryHostControl};
pub use orchestra::Orchestra;
pub use score::{Score, SharedScore};
pub use state::TaskState;
pub use task::{TaskBroker, TaskHandler, TaskRegistry};

/// Prefix for log lines about a score, measure, player or host. Absent
/// parts are skipped.
pub fn log_prefix(score: Option<&str>, measure: Option<&str>, player: Option<&str>, host: Option<&str>) -> String {
    [score, measure, player, host]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_prefix_skips_missing_parts() {
        assert_eq!(log_prefix(Some("s"), Some("m"), Some("p"), Some("h")), "s.m.p.h");
        assert_eq!(log_prefix(Some("s"), None, Some("p"), None), "s.p");
        assert_eq!(log_prefix(None, None, None, None), "");
    }
}
