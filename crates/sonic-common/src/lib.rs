pub mod condition;
pub mod error;
pub mod identity;
pub mod model;
pub mod placement;
pub mod pool;
pub mod server;
pub mod telemetry;
pub mod util;

pub use condition::{Condition, ConditionKey, ConditionKind};
pub use error::{ControlError, PlacementError};
pub use identity::{encode, is_valid_identifier, model_label_key, parse_model_label_key};
pub use model::{ModelConfig, ModelSpec};
pub use placement::{
    Action, CommittedEntry, CommittedPlacement, Epoch, LabelState, PlacementDecision,
    ReconciliationTask, TaskState,
};
pub use pool::{AddressPool, PoolEndpoint, PoolEvent, PoolEventKind};
pub use server::{ClusterSnapshot, HealthStatus, ModelTraffic, ServerInstance, ServerSample, ServerTarget};
pub use util::now_ms;
