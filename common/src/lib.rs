pub mod deployment;
pub mod job;
pub mod log;

use uuid::Uuid;

pub use deployment::Status;
pub use job::{Job, JobKind};
pub use log::Item as LogItem;

pub type DeploymentId = Uuid;
pub type BuildId = Uuid;
pub type InfrastructureId = Uuid;
