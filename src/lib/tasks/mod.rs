pub mod libsql_store;
pub mod state;
pub mod store;
pub mod types;

pub use libsql_store::LibSqlTaskStore;
pub use store::{InMemoryTaskStore, TaskStore};
pub use types::{DeploymentInfo, FileRef, State, Task, TaskType, TaskUpdate};
