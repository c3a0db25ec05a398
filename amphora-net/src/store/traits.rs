//! Repository trait definitions.

use async_trait::async_trait;

use super::error::Result;
use crate::model::{Amphora, AmphoraMemberPort, LoadBalancer};

/// Store trait for load balancer records.
#[async_trait]
pub trait LoadBalancerStore: Send + Sync {
    /// Get a load balancer with its amphorae. `NotFound` if absent.
    async fn get_load_balancer(&self, id: &str) -> Result<LoadBalancer>;

    /// Insert or replace a load balancer and its amphorae.
    async fn put_load_balancer(&self, lb: &LoadBalancer) -> Result<()>;
}

/// Store trait for amphora records.
#[async_trait]
pub trait AmphoraStore: Send + Sync {
    /// Get an amphora by ID. `NotFound` if absent.
    async fn get_amphora(&self, id: &str) -> Result<Amphora>;

    /// Record the VRRP and HA port ids of an amphora.
    async fn update_amphora_ports(
        &self,
        amphora_id: &str,
        vrrp_port_id: Option<&str>,
        ha_port_id: Option<&str>,
    ) -> Result<()>;
}

/// Store trait for amphora member-port bindings.
#[async_trait]
pub trait MemberPortStore: Send + Sync {
    /// Persist the ownership record of a member port.
    async fn create_member_port(&self, binding: &AmphoraMemberPort) -> Result<()>;

    /// Remove the binding of a port. `NotFound` if no record exists.
    async fn delete_member_port(&self, port_id: &str) -> Result<()>;

    /// Port ids bound to an amphora, oldest first.
    async fn get_member_port_ids(&self, amphora_id: &str) -> Result<Vec<String>>;
}

/// Composite repository used by the steps.
pub trait StateRepository: LoadBalancerStore + AmphoraStore + MemberPortStore + Send + Sync {}

impl<T> StateRepository for T where T: LoadBalancerStore + AmphoraStore + MemberPortStore + Send + Sync {}
