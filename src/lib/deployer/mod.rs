pub mod deployer;
pub mod ports;
pub mod repo;
pub mod types;

pub use deployer::Deployer;
pub use ports::{PortProbe, SystemPortProbe};
pub use repo::{GitCli, RepoFetcher, validate_url};
pub use types::{PortStatus, RunningDeployment};
