//! State repository for load balancer, amphora and member-port records.
//!
//! Steps only ever touch persistence through [`StateRepository`], one short
//! transaction per call, so no transaction stays open across a driver call.

mod error;
mod sqlite_store;
mod traits;

pub use error::{Result, StoreError};
pub use sqlite_store::SqliteRepository;
pub use traits::{AmphoraStore, LoadBalancerStore, MemberPortStore, StateRepository};
