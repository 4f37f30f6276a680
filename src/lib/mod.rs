//! Container-backed task processing engine.
//!
//! Tasks are claimed from a durable [`queue::WorkQueue`], routed by type through
//! the [`worker::Dispatcher`] and executed inside containers via the
//! [`container::ContainerRunner`]. `github-deploy` tasks go through the
//! [`deployer::Deployer`], which keeps the resulting container alive until its
//! time-to-live runs out.

pub mod config;
pub mod container;
pub mod db;
pub mod deployer;
pub mod error;
pub mod queue;
pub mod tasks;
pub mod telemetry;
pub mod worker;

pub use error::{Error, Result};
