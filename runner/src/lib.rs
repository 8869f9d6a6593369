//! Coordinator/worker runtime executing external programs on a cluster of ranks
//!
//! Rank 0 runs the [`master::Coordinator`], driven by an orchestrator that decides which worker
//! thread of which rank runs a task. Every other rank runs [`slave::run_slave`]: one transport
//! thread multiplexing the transfers of a pool of worker threads, each one staging files and
//! running the commands of its tasks.

pub mod config;
pub mod exec;
pub mod logging;
pub mod master;
pub mod messages;
pub mod slave;
pub mod staging;
pub mod step;
pub mod transport;
