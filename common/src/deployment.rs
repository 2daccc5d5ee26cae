use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// States a deployment moves through while being driven towards a running,
/// publicly exposed application.
///
/// The wire representation is the SCREAMING_SNAKE_CASE string of the variant.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Display, Serialize, EnumString)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[strum(ascii_case_insensitive)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum Status {
    /// Accepted by the platform, waiting for a worker to pick it up
    Queued,

    /// Source tree is being inspected for language and framework
    Analyzing,

    /// A container image is being produced and pushed to the registry
    Building,

    /// Cloud infrastructure is being instantiated for the application
    Provisioning,

    /// The workload is being installed into the cluster
    Deploying,

    /// Workload is healthy and reachable from the internet
    Exposed,

    /// Partially created infrastructure is being compensated away
    RollingBack,

    /// Terminal failure; the error field carries the most recent cause
    Failed,
}

impl Status {
    /// Happy-path order of the pipeline. `RollingBack` and `Failed` are off
    /// the path and return `None`.
    pub fn pipeline_index(&self) -> Option<usize> {
        match self {
            Status::Queued => Some(0),
            Status::Analyzing => Some(1),
            Status::Building => Some(2),
            Status::Provisioning => Some(3),
            Status::Deploying => Some(4),
            Status::Exposed => Some(5),
            Status::RollingBack | Status::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Exposed | Status::Failed)
    }

    /// Whether moving from `self` to `next` is an edge of the transition
    /// graph. Every status update the orchestrator makes is checked against
    /// this predicate before it is attempted against the store.
    pub fn can_transition_to(&self, next: Status) -> bool {
        match (self, next) {
            (Status::Queued, Status::Analyzing)
            | (Status::Analyzing, Status::Building)
            | (Status::Building, Status::Provisioning)
            | (Status::Provisioning, Status::Deploying)
            | (Status::Deploying, Status::Exposed) => true,
            // Compensation only exists once provisioning has started
            (current, Status::RollingBack) => {
                matches!(current, Status::Provisioning | Status::Deploying)
            }
            (current, Status::Failed) => !current.is_terminal(),
            _ => false,
        }
    }
}
