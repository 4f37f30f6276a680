//! Task dispatch: the claim loop, per-type handlers and the control API.

pub mod api;
pub mod handlers;
pub mod stats;
pub mod types;
pub mod worker;

pub use api::router;
pub use handlers::{ConversionHandler, DeployHandler, HandlerRegistry, TaskHandler, prepare_job};
pub use types::{ApiState, Dispatcher, HostStats, NewTask, TaskOutcome, TaskServer};
