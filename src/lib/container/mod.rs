pub mod docker;
pub mod engine;
pub mod runner;
pub mod types;

pub use docker::DockerEngine;
pub use engine::ContainerEngine;
pub use runner::ContainerRunner;
pub use types::{BuildOutput, ContainerSpec, PortMapping, RunOutput};
