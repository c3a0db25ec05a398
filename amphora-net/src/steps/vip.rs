//! VIP lifecycle steps.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::Services;
use crate::error::{NetworkError, Result};
use crate::model::{AdditionalVip, Amphora, AmphoraNetworkConfig, LoadBalancer, Port, Subnet, Vip};
use crate::step::{Step, StepContext};

/// Result of a VIP allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedVip {
    pub vip: Vip,
    pub additional_vips: Vec<AdditionalVip>,
}

/// Allocates the VIP and additional VIPs of a load balancer.
///
/// The revert releases exactly the VIP returned by `execute`. In failover
/// flows the VIP is still owned by the load balancer, so the failover
/// variant's revert leaves it alone.
pub struct AllocateVip {
    services: Services,
    failover: bool,
}

impl AllocateVip {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            failover: false,
        }
    }

    pub fn for_failover(services: Services) -> Self {
        Self {
            services,
            failover: true,
        }
    }
}

#[async_trait]
impl Step for AllocateVip {
    type Input = String;
    type Output = AllocatedVip;

    fn name(&self) -> &'static str {
        if self.failover {
            "allocate-vip-for-failover"
        } else {
            "allocate-vip"
        }
    }

    async fn execute(&self, _ctx: &StepContext, lb_id: &String) -> Result<AllocatedVip> {
        let lb = self.services.load_balancer(lb_id).await?;
        debug!(
            "Allocating vip with port id {:?}, subnet id {}, ip address {:?} for load balancer {}",
            lb.vip.port_id, lb.vip.subnet_id, lb.vip.ip_address, lb.id
        );

        let (vip, additional_vips) = self.services.driver.allocate_vip(&lb).await?;
        info!(
            "Allocated vip with port id {:?}, subnet id {}, ip address {:?} for load balancer {}",
            vip.port_id, vip.subnet_id, vip.ip_address, lb.id
        );
        for extra in &additional_vips {
            debug!(
                "Allocated an additional VIP: subnet={} ip_address={:?}",
                extra.subnet_id, extra.ip_address
            );
        }
        if let Some(port_id) = &vip.port_id {
            self.services.audit.vip_allocated(&lb.id, port_id);
        }
        Ok(AllocatedVip {
            vip,
            additional_vips,
        })
    }

    async fn revert(&self, _ctx: &StepContext, lb_id: &String, output: &AllocatedVip) {
        let vip = &output.vip;
        if self.failover {
            info!(
                "Failover revert is not deallocating vip {:?} because this is a failover",
                vip.ip_address
            );
            return;
        }

        warn!("Deallocating vip {:?}", vip.ip_address);
        match self.services.driver.deallocate_vip(vip).await {
            Ok(()) => {
                if let Some(port_id) = &vip.port_id {
                    self.services.audit.vip_deallocated(lb_id, port_id);
                }
            }
            Err(e) => {
                error!(
                    "Failed to deallocate VIP. Resources may still be in use from vip {:?} due to error: {}",
                    vip.ip_address, e
                );
                let id = vip.port_id.as_deref().unwrap_or(lb_id);
                self.services.audit.resource_leaked("vip", id, &e.to_string());
            }
        }
    }
}

/// Releases the VIP of a load balancer. Terminal, no revert.
pub struct DeallocateVip {
    services: Services,
}

impl DeallocateVip {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for DeallocateVip {
    type Input = String;
    type Output = ();

    fn name(&self) -> &'static str {
        "deallocate-vip"
    }

    async fn execute(&self, _ctx: &StepContext, lb_id: &String) -> Result<()> {
        let lb = self.services.load_balancer(lb_id).await?;
        debug!("Deallocating VIP {:?}", lb.vip.ip_address);

        // The driver needs the owning load balancer.
        let vip = Vip {
            load_balancer_id: Some(lb.id.clone()),
            ..lb.vip.clone()
        };
        self.services.driver.deallocate_vip(&vip).await?;
        if let Some(port_id) = &vip.port_id {
            self.services.audit.vip_deallocated(&lb.id, port_id);
        }
        Ok(())
    }
}

pub struct PlugVipInput {
    pub load_balancer_id: String,
    pub amphora_id: String,
    pub subnet_id: String,
}

/// Binds the VIP to an amphora's base port through allowed address pairs.
/// Returns the amphora with its VRRP/HA port data.
pub struct PlugVipToAmphora {
    services: Services,
}

impl PlugVipToAmphora {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for PlugVipToAmphora {
    type Input = PlugVipInput;
    type Output = Amphora;

    fn name(&self) -> &'static str {
        "plug-vip-amphora"
    }

    async fn execute(&self, _ctx: &StepContext, input: &PlugVipInput) -> Result<Amphora> {
        debug!("Plumbing VIP for amphora {}", input.amphora_id);
        let amphora = self.services.amphora(&input.amphora_id).await?;
        let lb = self.services.load_balancer(&input.load_balancer_id).await?;
        let subnet = self.services.driver.get_subnet(&input.subnet_id).await?;

        self.services
            .driver
            .plug_aap_port(&lb, &lb.vip, &amphora, &subnet)
            .await
    }

    async fn revert(&self, _ctx: &StepContext, input: &PlugVipInput, output: &Amphora) {
        warn!(
            "Unable to plug VIP for amphora {} load balancer {}",
            input.amphora_id, input.load_balancer_id
        );

        let unplug = async {
            let repo = &self.services.repo;
            repo.update_amphora_ports(
                &input.amphora_id,
                output.vrrp_port_id.as_deref(),
                output.ha_port_id.as_deref(),
            )
            .await?;
            let amphora = self.services.amphora(&input.amphora_id).await?;
            let subnet = self.services.driver.get_subnet(&input.subnet_id).await?;
            let lb = self.services.load_balancer(&input.load_balancer_id).await?;
            self.services
                .driver
                .unplug_aap_port(&lb.vip, &amphora, &subnet)
                .await
        };

        if let Err(e) = unplug.await {
            let vrrp_port = output.vrrp_port_id.as_deref().unwrap_or("-");
            error!(
                "Failed to unplug AAP port for load balancer {}. Resources may still be in use for VRRP port {} due to error: {}",
                input.load_balancer_id, vrrp_port, e
            );
            self.services.audit.resource_leaked("vrrp port", vrrp_port, &e.to_string());
        }
    }
}

/// Removes the VIP wiring from every amphora. Failures are logged.
pub struct UnplugVip {
    services: Services,
}

impl UnplugVip {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for UnplugVip {
    type Input = String;
    type Output = ();

    fn name(&self) -> &'static str {
        "unplug-vip"
    }

    async fn execute(&self, _ctx: &StepContext, lb_id: &String) -> Result<()> {
        debug!("Unplug vip on amphora");
        let unplug = async {
            let lb = self.services.load_balancer(lb_id).await?;
            self.services.driver.unplug_vip(&lb, &lb.vip).await
        };
        if let Err(e) = unplug.await {
            error!("Unable to unplug vip from load balancer {}: {}", lb_id, e);
        }
        Ok(())
    }
}

/// Refreshes the VIP wiring. Failures are logged.
pub struct UpdateVip {
    services: Services,
    for_delete: bool,
}

impl UpdateVip {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            for_delete: false,
        }
    }
}

/// [`UpdateVip`] for listener delete flows.
pub struct UpdateVipForDelete(UpdateVip);

impl UpdateVipForDelete {
    pub fn new(services: Services) -> Self {
        Self(UpdateVip {
            services,
            for_delete: true,
        })
    }
}

#[async_trait]
impl Step for UpdateVip {
    type Input = String;
    type Output = ();

    fn name(&self) -> &'static str {
        if self.for_delete {
            "update-vip-for-delete"
        } else {
            "update-vip"
        }
    }

    async fn execute(&self, _ctx: &StepContext, lb_id: &String) -> Result<()> {
        let update = async {
            let lb = self.services.load_balancer(lb_id).await?;
            debug!(
                "Updating VIP of load balancer {} (for delete: {})",
                lb.id, self.for_delete
            );
            self.services.driver.update_vip(&lb, self.for_delete).await
        };
        if let Err(e) = update.await {
            error!("Unable to update vip of load balancer {}: {}", lb_id, e);
        }
        Ok(())
    }
}

#[async_trait]
impl Step for UpdateVipForDelete {
    type Input = String;
    type Output = ();

    fn name(&self) -> &'static str {
        self.0.name()
    }

    async fn execute(&self, ctx: &StepContext, lb_id: &String) -> Result<()> {
        self.0.execute(ctx, lb_id).await
    }
}

/// Resolves the VIP subnet of a load balancer.
pub struct GetSubnetFromVip {
    services: Services,
}

impl GetSubnetFromVip {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for GetSubnetFromVip {
    type Input = LoadBalancer;
    type Output = Subnet;

    fn name(&self) -> &'static str {
        "get-subnet-from-vip"
    }

    async fn execute(&self, _ctx: &StepContext, lb: &LoadBalancer) -> Result<Subnet> {
        debug!("Getting subnet for load balancer {}", lb.id);
        let subnet = self.services.driver.get_subnet(&lb.vip.subnet_id).await?;
        info!("Got subnet {} for load balancer {}", subnet.id, lb.id);
        Ok(subnet)
    }
}

pub struct AmphoraDataInput {
    pub load_balancer: LoadBalancer,
    pub amphora: Amphora,
    /// VIP base port created for the amphora.
    pub port: Port,
}

/// Fills the HA/VRRP fields of an amphora from its VIP base port.
#[derive(Default)]
pub struct BuildAmphoraData;

#[async_trait]
impl Step for BuildAmphoraData {
    type Input = AmphoraDataInput;
    type Output = Amphora;

    fn name(&self) -> &'static str {
        "build-amphora-data"
    }

    async fn execute(&self, _ctx: &StepContext, input: &AmphoraDataInput) -> Result<Amphora> {
        let vrrp_ip = input
            .port
            .fixed_ips
            .first()
            .and_then(|ip| ip.ip_address)
            .ok_or_else(|| {
                NetworkError::InvalidInput(format!("port {} has no fixed IP", input.port.id))
            })?;
        let vip = &input.load_balancer.vip;

        Ok(Amphora {
            ha_ip: vip.ip_address,
            ha_port_id: vip.port_id.clone(),
            vrrp_id: Some(1),
            vrrp_port_id: Some(input.port.id.clone()),
            vrrp_ip: Some(vrrp_ip),
            ..input.amphora.clone()
        })
    }
}

pub struct NetworkConfigsInput {
    pub load_balancer_id: String,
    pub amphora_id: String,
}

/// Network configuration of one amphora of a load balancer.
pub struct GetAmphoraNetworkConfigs {
    services: Services,
}

impl GetAmphoraNetworkConfigs {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for GetAmphoraNetworkConfigs {
    type Input = NetworkConfigsInput;
    type Output = HashMap<String, AmphoraNetworkConfig>;

    fn name(&self) -> &'static str {
        "get-amphora-network-configs"
    }

    async fn execute(&self, _ctx: &StepContext, input: &Self::Input) -> Result<Self::Output> {
        debug!("Retrieving vip network details");
        let amphora = self.services.amphora(&input.amphora_id).await?;
        let lb = self.services.load_balancer(&input.load_balancer_id).await?;
        self.services
            .driver
            .get_network_configs(&lb, Some(&amphora))
            .await
    }
}

pub struct NetworkConfigsByIdsInput {
    pub load_balancer_id: String,
    /// `None` selects every amphora.
    pub amphora_id: Option<String>,
}

/// Network configuration lookup by load balancer and optional amphora id.
pub struct GetAmphoraNetworkConfigsByIds {
    services: Services,
}

impl GetAmphoraNetworkConfigsByIds {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for GetAmphoraNetworkConfigsByIds {
    type Input = NetworkConfigsByIdsInput;
    type Output = HashMap<String, AmphoraNetworkConfig>;

    fn name(&self) -> &'static str {
        "get-amphora-network-configs-by-ids"
    }

    async fn execute(&self, _ctx: &StepContext, input: &Self::Input) -> Result<Self::Output> {
        debug!("Retrieving vip network details");
        let lb = self.services.load_balancer(&input.load_balancer_id).await?;
        let amphora = match &input.amphora_id {
            Some(id) => Some(self.services.amphora(id).await?),
            None => None,
        };
        self.services
            .driver
            .get_network_configs(&lb, amphora.as_ref())
            .await
    }
}

/// Network configuration of every amphora of a load balancer.
pub struct GetAmphoraeNetworkConfigs {
    services: Services,
}

impl GetAmphoraeNetworkConfigs {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for GetAmphoraeNetworkConfigs {
    type Input = String;
    type Output = HashMap<String, AmphoraNetworkConfig>;

    fn name(&self) -> &'static str {
        "get-amphorae-network-configs"
    }

    async fn execute(&self, _ctx: &StepContext, lb_id: &String) -> Result<Self::Output> {
        debug!("Retrieving vip network details");
        let lb = self.services.load_balancer(lb_id).await?;
        self.services.driver.get_network_configs(&lb, None).await
    }
}
