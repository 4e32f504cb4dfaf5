//! Service lifecycle shared by the discovery service and the upgrade manager.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl ServiceState {
    /// A start request only does work from `Stopped`.
    pub fn can_start(self) -> bool {
        self == Self::Stopped
    }

    /// A stop request only does work from `Running`.
    pub fn can_stop(self) -> bool {
        self == Self::Running
    }
}
