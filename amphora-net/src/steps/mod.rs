//! Saga steps driving the network substrate.
//!
//! Every step gets its collaborators through [`Services`] at construction
//! time; nothing is looked up globally.

pub mod network;
pub mod port;
pub mod qos;
pub mod reconcile;
pub mod security_group;
pub mod vip;

use std::sync::Arc;

use crate::audit::AuditLog;
use crate::driver::NetworkDriver;
use crate::error::Result;
use crate::model::{Amphora, LoadBalancer, Port};
use crate::store::StateRepository;

pub use network::{
    CalculateAmphoraDelta, CalculateDelta, GetMemberPorts, GetPlumbedNetworks, PlugPorts,
    RetrievePortIdsExceptLbNetwork, UnplugNetworks,
};
pub use port::{
    AdminDownPort, CreateSriovBasePort, CreateVipBasePort, DeleteAmphoraMemberPorts, DeletePort,
    PortDeletion,
};
pub use qos::{ApplyQos, ApplyQosOnAmphora, LoadBalancerUpdate, VipUpdate};
pub use reconcile::{ApplyDelta, ApplyDeltas, DeltaPhase};
pub use security_group::{GetVipSecurityGroupId, UpdateAmphoraSecurityGroup, UpdateVipSecurityGroup};
pub use vip::{
    AllocateVip, AllocatedVip, BuildAmphoraData, DeallocateVip, GetAmphoraNetworkConfigs,
    GetAmphoraNetworkConfigsByIds, GetAmphoraeNetworkConfigs, GetSubnetFromVip, PlugVipToAmphora,
    UnplugVip, UpdateVip, UpdateVipForDelete,
};

/// Collaborators shared by the steps.
#[derive(Clone)]
pub struct Services {
    pub driver: Arc<dyn NetworkDriver>,
    pub repo: Arc<dyn StateRepository>,
    pub audit: Arc<AuditLog>,
}

impl Services {
    pub fn new(driver: Arc<dyn NetworkDriver>, repo: Arc<dyn StateRepository>) -> Self {
        Self {
            driver,
            repo,
            audit: AuditLog::shared("amphora-net"),
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    /// Current persisted state of a load balancer.
    pub(crate) async fn load_balancer(&self, id: &str) -> Result<LoadBalancer> {
        Ok(self.repo.get_load_balancer(id).await?)
    }

    pub(crate) async fn amphora(&self, id: &str) -> Result<Amphora> {
        Ok(self.repo.get_amphora(id).await?)
    }

    /// Resolve network and subnet detail of a port.
    pub(crate) async fn fill_port_info(&self, port: &mut Port) -> Result<()> {
        port.network = Some(self.driver.get_network(&port.network_id).await?);
        for fixed_ip in &mut port.fixed_ips {
            fixed_ip.subnet = Some(self.driver.get_subnet(&fixed_ip.subnet_id).await?);
        }
        Ok(())
    }
}
