//! Domain records shared by the delta calculator, the steps and the driver.
//!
//! These mirror what the network substrate and the state repository hand
//! back. Everything is plain data with serde derives so step outputs can be
//! persisted by an orchestrator between execute and revert.

use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// Port name prefix for ports created for backend member connectivity.
pub const MEMBER_PORT_PREFIX: &str = "lb-member-";

/// Port name prefix for the VIP-bearing base port of an amphora.
pub const BASE_PORT_PREFIX: &str = "lb-vrrp-";

/// Security group name prefix for a load balancer's VIP.
pub const VIP_SECURITY_GROUP_PREFIX: &str = "lb-";

/// Name of the member-connectivity port created for an amphora.
pub fn member_port_name(amphora_id: &str) -> String {
    format!("{MEMBER_PORT_PREFIX}{amphora_id}")
}

/// Name of the VIP base port created for an amphora.
pub fn base_port_name(amphora_id: &str) -> String {
    format!("{BASE_PORT_PREFIX}{amphora_id}")
}

/// Deterministic name of the VIP security group of a load balancer.
pub fn vip_security_group_name(load_balancer_id: &str) -> String {
    format!("{VIP_SECURITY_GROUP_PREFIX}{load_balancer_id}")
}

/// Virtual NIC type requested for a port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VnicType {
    #[default]
    Normal,
    /// SR-IOV direct attach.
    Direct,
}

impl VnicType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VnicType::Normal => "normal",
            VnicType::Direct => "direct",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisioningStatus {
    #[default]
    Active,
    PendingCreate,
    PendingUpdate,
    PendingDelete,
    Deleted,
    Error,
}

/// Lifecycle status of an amphora. Only `Allocated` amphorae are reconciled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AmphoraStatus {
    #[default]
    Allocated,
    Booting,
    Ready,
    PendingCreate,
    PendingDelete,
    Deleted,
    Error,
}

/// Operational status reported by the network substrate for a port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PortStatus {
    #[default]
    Active,
    Build,
    Down,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: String,
    #[serde(default)]
    pub subnet_id: Option<String>,
    #[serde(default)]
    pub provisioning_status: ProvisioningStatus,
    #[serde(default)]
    pub vnic_type: VnicType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub id: String,
    #[serde(default)]
    pub members: Vec<Member>,
}

/// The primary virtual IP of a load balancer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vip {
    #[serde(default)]
    pub ip_address: Option<IpAddr>,
    pub subnet_id: String,
    pub network_id: String,
    #[serde(default)]
    pub port_id: Option<String>,
    #[serde(default)]
    pub qos_policy_id: Option<String>,
    /// Security groups supplied by the user, on top of the managed one.
    #[serde(default)]
    pub sg_ids: Vec<String>,
    #[serde(default)]
    pub vnic_type: VnicType,
    /// Owning load balancer, attached when the driver needs the backref.
    #[serde(default)]
    pub load_balancer_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalVip {
    #[serde(default)]
    pub ip_address: Option<IpAddr>,
    pub subnet_id: String,
    #[serde(default)]
    pub network_id: Option<String>,
    #[serde(default)]
    pub port_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Amphora {
    pub id: String,
    #[serde(default)]
    pub load_balancer_id: Option<String>,
    #[serde(default)]
    pub compute_id: Option<String>,
    #[serde(default)]
    pub status: AmphoraStatus,
    /// Address on the management network.
    #[serde(default)]
    pub lb_network_ip: Option<IpAddr>,
    #[serde(default)]
    pub vrrp_port_id: Option<String>,
    #[serde(default)]
    pub vrrp_ip: Option<IpAddr>,
    #[serde(default)]
    pub ha_port_id: Option<String>,
    #[serde(default)]
    pub ha_ip: Option<IpAddr>,
    #[serde(default)]
    pub vrrp_id: Option<u32>,
}

impl Amphora {
    pub fn is_allocated(&self) -> bool {
        self.status == AmphoraStatus::Allocated
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub id: String,
    pub vip: Vip,
    #[serde(default)]
    pub additional_vips: Vec<AdditionalVip>,
    #[serde(default)]
    pub pools: Vec<Pool>,
    #[serde(default)]
    pub amphorae: Vec<Amphora>,
}

impl LoadBalancer {
    /// Allocated amphorae, the only ones that take part in reconciliation.
    pub fn allocated_amphorae(&self) -> impl Iterator<Item = &Amphora> {
        self.amphorae.iter().filter(|amp| amp.is_allocated())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: String,
    pub network_id: String,
    #[serde(default)]
    pub cidr: Option<IpNet>,
    #[serde(default)]
    pub gateway_ip: Option<IpAddr>,
    /// IPv6 address mode, e.g. "slaac".
    #[serde(default)]
    pub ipv6_address_mode: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub subnets: Vec<String>,
    #[serde(default)]
    pub mtu: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedIp {
    pub subnet_id: String,
    #[serde(default)]
    pub ip_address: Option<IpAddr>,
    #[serde(default)]
    pub subnet: Option<Subnet>,
}

impl FixedIp {
    pub fn for_subnet(subnet_id: impl Into<String>) -> Self {
        Self {
            subnet_id: subnet_id.into(),
            ..Default::default()
        }
    }
}

/// A network attachment of a compute instance, actual or desired.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    pub network_id: String,
    #[serde(default)]
    pub port_id: Option<String>,
    #[serde(default)]
    pub fixed_ips: Vec<FixedIp>,
    #[serde(default)]
    pub vnic_type: VnicType,
}

impl Interface {
    pub fn has_subnet(&self, subnet_id: &str) -> bool {
        self.fixed_ips.iter().any(|ip| ip.subnet_id == subnet_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub network_id: String,
    #[serde(default)]
    pub fixed_ips: Vec<FixedIp>,
    #[serde(default = "default_admin_state_up")]
    pub admin_state_up: bool,
    #[serde(default)]
    pub status: PortStatus,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub qos_policy_id: Option<String>,
    #[serde(default)]
    pub security_group_ids: Vec<String>,
    #[serde(default)]
    pub vnic_type: VnicType,
    /// Addresses other than the fixed IPs this port may carry traffic for.
    #[serde(default)]
    pub allowed_address_pairs: Vec<IpAddr>,
    /// Filled in on demand with the network detail.
    #[serde(default)]
    pub network: Option<Network>,
}

fn default_admin_state_up() -> bool {
    true
}

impl Port {
    pub fn has_subnet(&self, subnet_id: &str) -> bool {
        self.fixed_ips.iter().any(|ip| ip.subnet_id == subnet_id)
    }

    pub fn has_ip(&self, addr: IpAddr) -> bool {
        self.fixed_ips.iter().any(|ip| ip.ip_address == Some(addr))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
}

/// Ownership record of a port created for backend member connectivity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmphoraMemberPort {
    pub amphora_id: String,
    pub port_id: String,
    pub network_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityZone {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub management_network: Option<String>,
}

/// Network detail of one amphora as seen by the driver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmphoraNetworkConfig {
    pub amphora_id: String,
    #[serde(default)]
    pub vip_subnet: Option<Subnet>,
    #[serde(default)]
    pub vip_port: Option<Port>,
    #[serde(default)]
    pub vrrp_subnet: Option<Subnet>,
    #[serde(default)]
    pub vrrp_port: Option<Port>,
    #[serde(default)]
    pub ha_subnet: Option<Subnet>,
    #[serde(default)]
    pub ha_port: Option<Port>,
}
