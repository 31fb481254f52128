//! Communicator bootstrap and collective dispatch for a pool of workers.
//!
//! A [`Comms`] controller turns the workers a [`TaskScheduler`] knows about
//! into a ranked clique: it optionally bootstraps a TCP point-to-point mesh,
//! distributes a clique id and ranks, and has every worker register a
//! [`worker::Handle`] under the session id. Later work names the session id;
//! each worker looks up its handle and runs the requested [`Operation`].
//!
//! Collective data movement sits behind [`engine::CollectiveEngine`]; the
//! in-process [`engine::LocalCollectiveEngine`] and [`LocalCluster`] make the
//! whole stack runnable inside one tokio runtime.

pub mod bootstrap;
pub mod clique;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod rpc;
pub mod scheduler;
pub mod transport;
pub mod types;
pub mod worker;

pub use config::CommsConfig;
pub use controller::{Comms, CommsOptions, WorkerInfo};
pub use dispatch::{CollectiveKind, Operation, dispatch};
pub use error::{CohortError, Result};
pub use scheduler::{LocalCluster, LocalClusterBuilder, TaskScheduler, wait_all};
pub use types::{CliqueId, DataType, Rank, ReduceOp, SessionId, WorkerAddress};
