//! Network driver capability surface.
//!
//! The driver performs atomic operations against the cloud network
//! substrate. Implementations report missing resources with the classified
//! not-found variants of [`NetworkError`](crate::error::NetworkError) where
//! they can, or with `NotFound` carrying the substrate's message otherwise.

pub mod memory;

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{
    AdditionalVip, Amphora, AmphoraNetworkConfig, FixedIp, Interface, LoadBalancer, Network,
    Port, SecurityGroup, Subnet, Vip, VnicType,
};

pub use memory::InMemoryDriver;

/// Parameters of a port creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreatePortRequest {
    pub network_id: String,
    pub name: String,
    /// Subnets (and optionally addresses) to allocate from. Empty lets the
    /// substrate pick.
    pub fixed_ips: Vec<FixedIp>,
    /// Extra addresses the port may carry traffic for (allowed address pairs).
    pub secondary_ips: Vec<IpAddr>,
    pub security_group_ids: Vec<String>,
    pub qos_policy_id: Option<String>,
    pub vnic_type: VnicType,
}

impl CreatePortRequest {
    pub fn new(network_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            network_id: network_id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn fixed_ips(mut self, fixed_ips: Vec<FixedIp>) -> Self {
        self.fixed_ips = fixed_ips;
        self
    }

    pub fn secondary_ips(mut self, ips: Vec<IpAddr>) -> Self {
        self.secondary_ips = ips;
        self
    }

    pub fn security_group_ids(mut self, ids: Vec<String>) -> Self {
        self.security_group_ids = ids;
        self
    }

    pub fn qos_policy_id(mut self, id: Option<String>) -> Self {
        self.qos_policy_id = id;
        self
    }

    pub fn vnic_type(mut self, vnic_type: VnicType) -> Self {
        self.vnic_type = vnic_type;
        self
    }
}

/// Operations against the cloud network substrate.
#[async_trait]
pub trait NetworkDriver: Send + Sync {
    /// Interfaces currently attached to a compute instance.
    async fn get_plugged_networks(&self, compute_id: &str) -> Result<Vec<Interface>>;

    async fn get_subnet(&self, subnet_id: &str) -> Result<Subnet>;

    async fn get_network(&self, network_id: &str) -> Result<Network>;

    async fn get_port(&self, port_id: &str) -> Result<Port>;

    /// Create a port. Fails with `NotFound("Network ...")` when the network
    /// does not exist.
    async fn create_port(&self, request: CreatePortRequest) -> Result<Port>;

    /// Delete a port. Deleting an absent port succeeds.
    async fn delete_port(&self, port_id: &str) -> Result<()>;

    /// Set a port administratively down, best effort.
    async fn admin_down_port(&self, port_id: &str) -> Result<()>;

    async fn set_port_admin_state_up(&self, port_id: &str, up: bool) -> Result<Port>;

    /// Attach a port to the amphora's compute instance. Fails with
    /// `NotFound("Instance ...")` when the instance is gone.
    async fn plug_port(&self, amphora: &Amphora, port: &Port) -> Result<()>;

    async fn plug_fixed_ip(&self, port_id: &str, subnet_id: &str) -> Result<Port>;

    async fn unplug_fixed_ip(&self, port_id: &str, subnet_id: &str) -> Result<Port>;

    /// Detach a network from a compute instance. `NetworkNotFound` when the
    /// instance has no interface on it.
    async fn unplug_network(&self, compute_id: &str, network_id: &str) -> Result<()>;

    async fn allocate_vip(&self, lb: &LoadBalancer) -> Result<(Vip, Vec<AdditionalVip>)>;

    async fn deallocate_vip(&self, vip: &Vip) -> Result<()>;

    /// Bind the VIP to the amphora's base port through allowed address
    /// pairs. Returns the amphora with its VRRP/HA fields filled in.
    async fn plug_aap_port(
        &self,
        lb: &LoadBalancer,
        vip: &Vip,
        amphora: &Amphora,
        subnet: &Subnet,
    ) -> Result<Amphora>;

    async fn unplug_aap_port(&self, vip: &Vip, amphora: &Amphora, subnet: &Subnet) -> Result<()>;

    /// Remove the VIP wiring from every amphora of the load balancer.
    async fn unplug_vip(&self, lb: &LoadBalancer, vip: &Vip) -> Result<()>;

    async fn update_vip(&self, lb: &LoadBalancer, for_delete: bool) -> Result<()>;

    /// (Re)compute the VIP security group. Returns its id when security
    /// groups are enabled.
    async fn update_vip_sg(&self, lb: &LoadBalancer, vip: &Vip) -> Result<Option<String>>;

    async fn update_aap_port_sg(&self, lb: &LoadBalancer, amphora: &Amphora, vip: &Vip)
    -> Result<()>;

    /// Apply a QoS policy to a port; `None` clears it.
    async fn apply_qos_on_port(&self, qos_policy_id: Option<&str>, port_id: &str) -> Result<()>;

    /// Look up a security group by name. `SecurityGroupNotFound` if absent.
    async fn get_security_group(&self, name: &str) -> Result<SecurityGroup>;

    /// Whether this deployment manages security groups at all.
    fn sec_grp_enabled(&self) -> bool;

    async fn get_network_configs(
        &self,
        lb: &LoadBalancer,
        amphora: Option<&Amphora>,
    ) -> Result<HashMap<String, AmphoraNetworkConfig>>;
}
