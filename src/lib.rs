//! CPU-first convolutional network training and inference engine.
//!
//! A network is an ordered list of *bridges*, each realizing one layer
//! over 4-D CRDB tensors ([`cube::LogicalCube`]). Bridges own their
//! forward/backward kernels, talk to a [`driver::DeviceDriver`] for
//! primitive math, and are wrapped in a
//! [`bridges::ParallelizedBridge`] that shards the mini-batch across
//! workers. The [`solver::Solver`] streams mini-batches from a
//! [`corpus::Corpus`] and applies stochastic gradient descent.

pub mod bridges;
pub mod config;
pub mod corpus;
pub mod cube;
pub mod driver;
pub mod errors;
pub mod kernels;
pub mod layer;
pub mod net;
pub mod report;
pub mod solver;

pub use config::Phase;
pub use cube::LogicalCube;
pub use errors::{CnError, CnResult};
