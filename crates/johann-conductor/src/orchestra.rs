use std::sync::Arc;

use crate::config::JohannConfig;
use crate::host::HostRegistry;
use crate::host_control::HostControlRegistry;
use crate::task::TaskBroker;

/// Everything a score needs from the process it plays in. Cloning shares the
/// underlying registries.
#[derive(Clone)]
pub struct Orchestra {
    pub config: Arc<JohannConfig>,
    pub hosts: HostRegistry,
    pub controls: HostControlRegistry,
    pub broker: Arc<dyn TaskBroker>,
}

impl Orchestra {
    pub fn new(
        config: Arc<JohannConfig>,
        hosts: HostRegistry,
        controls: HostControlRegistry,
        broker: Arc<dyn TaskBroker>,
    ) -> Self {
        Orchestra {
            config,
            hosts,
            controls,
            broker,
        }
    }
}
