//! Network reconciliation core for amphora-based load balancers.
//!
//! Computes per-amphora network deltas from load balancer membership and
//! applies them through a [`driver::NetworkDriver`] as compensable saga
//! steps, together with the VIP lifecycle around them.

pub mod audit;
pub mod config;
pub mod delta;
pub mod driver;
pub mod error;
pub mod model;
pub mod retry;
pub mod step;
pub mod steps;
pub mod store;
pub mod test_util;

pub use delta::{Delta, DeltaCalculator, SubnetChange};
pub use error::{NetworkError, Result};
pub use step::{Step, StepContext};
