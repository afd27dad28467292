//! Multi-process data-parallel training.
//!
//! - `group`: TCP process group and the `Communicator` seam
//! - `session`: scoped setup/teardown of a group for one worker
//! - `ddp`: the distributed trainer
//! - `launcher`: spawning and joining worker processes

pub mod ddp;
pub mod group;
pub mod launcher;
pub mod session;

pub use ddp::DistributedTrainer;
pub use group::{Communicator, Rendezvous, TcpProcessGroup, free_port};
pub use launcher::WorkerLauncher;
pub use session::{ProcessGroupSession, device_for_rank};
