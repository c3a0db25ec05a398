//! Delta calculation and plumbing queries.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{debug, error};

use super::Services;
use crate::delta::{Delta, DeltaCalculator};
use crate::error::{NetworkError, Result};
use crate::model::{Amphora, AvailabilityZone, Interface, LoadBalancer, Port};
use crate::step::{Step, StepContext};

pub struct AmphoraDeltaInput {
    pub load_balancer_id: String,
    pub amphora: Amphora,
    pub availability_zone: Option<AvailabilityZone>,
}

/// Computes the network delta of one amphora.
pub struct CalculateAmphoraDelta {
    services: Services,
    calculator: DeltaCalculator,
}

impl CalculateAmphoraDelta {
    pub fn new(services: Services, boot_networks: Vec<String>) -> Self {
        let calculator = DeltaCalculator::new(services.driver.clone(), boot_networks);
        Self {
            services,
            calculator,
        }
    }
}

#[async_trait]
impl Step for CalculateAmphoraDelta {
    type Input = AmphoraDeltaInput;
    type Output = Delta;

    fn name(&self) -> &'static str {
        "calculate-amphora-delta"
    }

    async fn execute(&self, _ctx: &StepContext, input: &Self::Input) -> Result<Delta> {
        let lb = self.services.load_balancer(&input.load_balancer_id).await?;
        self.calculator
            .compute_delta(&lb, &input.amphora, input.availability_zone.as_ref())
            .await
    }
}

pub struct DeltasInput {
    pub load_balancer_id: String,
    pub availability_zone: Option<AvailabilityZone>,
}

/// Computes the network deltas of every allocated amphora, keyed by amphora id.
pub struct CalculateDelta {
    services: Services,
    calculator: DeltaCalculator,
}

impl CalculateDelta {
    pub fn new(services: Services, boot_networks: Vec<String>) -> Self {
        let calculator = DeltaCalculator::new(services.driver.clone(), boot_networks);
        Self {
            services,
            calculator,
        }
    }
}

#[async_trait]
impl Step for CalculateDelta {
    type Input = DeltasInput;
    type Output = BTreeMap<String, Delta>;

    fn name(&self) -> &'static str {
        "calculate-delta"
    }

    async fn execute(&self, _ctx: &StepContext, input: &Self::Input) -> Result<Self::Output> {
        let lb = self.services.load_balancer(&input.load_balancer_id).await?;
        self.calculator
            .compute_deltas(&lb, input.availability_zone.as_ref())
            .await
    }
}

/// Interfaces currently plugged into an amphora.
pub struct GetPlumbedNetworks {
    services: Services,
}

impl GetPlumbedNetworks {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for GetPlumbedNetworks {
    type Input = Amphora;
    type Output = Vec<Interface>;

    fn name(&self) -> &'static str {
        "get-plumbed-networks"
    }

    async fn execute(&self, _ctx: &StepContext, amphora: &Amphora) -> Result<Vec<Interface>> {
        debug!("Getting plumbed networks for amphora {}", amphora.id);
        let compute_id = amphora.compute_id.as_deref().unwrap_or_default();
        self.services.driver.get_plugged_networks(compute_id).await
    }
}

pub struct UnplugNetworksInput {
    pub amphora: Amphora,
    pub delta: Option<Delta>,
}

/// Unplugs the networks a delta marks for deletion. Failures are logged.
pub struct UnplugNetworks {
    services: Services,
}

impl UnplugNetworks {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for UnplugNetworks {
    type Input = UnplugNetworksInput;
    type Output = ();

    fn name(&self) -> &'static str {
        "unplug-networks"
    }

    async fn execute(&self, _ctx: &StepContext, input: &Self::Input) -> Result<()> {
        let Some(delta) = &input.delta else {
            debug!("No network deltas for amphora {}", input.amphora.id);
            return Ok(());
        };
        let compute_id = input.amphora.compute_id.as_deref().unwrap_or_default();

        for nic in &delta.delete_nics {
            match self
                .services
                .driver
                .unplug_network(compute_id, &nic.network_id)
                .await
            {
                Ok(()) => {}
                Err(NetworkError::NetworkNotFound(_)) => {
                    debug!("Network {} not found", nic.network_id)
                }
                Err(e) => error!("Unable to unplug network {}: {}", nic.network_id, e),
            }
        }
        Ok(())
    }
}

pub struct MemberPortsInput {
    pub load_balancer: LoadBalancer,
    pub amphora: Amphora,
}

/// Ports of an amphora other than the VIP network port and the management
/// port, with network and subnet detail filled in.
pub struct GetMemberPorts {
    services: Services,
}

impl GetMemberPorts {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for GetMemberPorts {
    type Input = MemberPortsInput;
    type Output = Vec<Port>;

    fn name(&self) -> &'static str {
        "get-member-ports"
    }

    async fn execute(&self, _ctx: &StepContext, input: &Self::Input) -> Result<Vec<Port>> {
        let driver = &self.services.driver;
        let vip_port_id = input.load_balancer.vip.port_id.as_deref().ok_or_else(|| {
            NetworkError::InvalidInput(format!(
                "load balancer {} has no VIP port",
                input.load_balancer.id
            ))
        })?;
        let vip_port = driver.get_port(vip_port_id).await?;
        let compute_id = input.amphora.compute_id.as_deref().unwrap_or_default();

        let mut member_ports = Vec::new();
        for interface in driver.get_plugged_networks(compute_id).await? {
            let Some(port_id) = &interface.port_id else {
                continue;
            };
            let mut port = driver.get_port(port_id).await?;
            if port.network_id == vip_port.network_id {
                continue;
            }
            let is_mgmt = input.amphora.lb_network_ip.is_some_and(|ip| port.has_ip(ip));
            if is_mgmt {
                continue;
            }
            self.services.fill_port_info(&mut port).await?;
            member_ports.push(port);
        }
        Ok(member_ports)
    }
}

/// Distinct ports on an amphora except the one carrying the management IP.
pub struct RetrievePortIdsExceptLbNetwork {
    services: Services,
}

impl RetrievePortIdsExceptLbNetwork {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for RetrievePortIdsExceptLbNetwork {
    type Input = Amphora;
    type Output = Vec<Port>;

    fn name(&self) -> &'static str {
        "retrieve-port-ids-except-lb-network"
    }

    async fn execute(&self, _ctx: &StepContext, amphora: &Amphora) -> Result<Vec<Port>> {
        debug!("Retrieve all but the lb network port on amphora {}", amphora.id);
        let driver = &self.services.driver;
        let compute_id = amphora.compute_id.as_deref().unwrap_or_default();

        let mut ports: Vec<Port> = Vec::new();
        for interface in driver.get_plugged_networks(compute_id).await? {
            let Some(port_id) = &interface.port_id else {
                continue;
            };
            if ports.iter().any(|p| &p.id == port_id) {
                continue;
            }
            let port = driver.get_port(port_id).await?;
            if !amphora.lb_network_ip.is_some_and(|ip| port.has_ip(ip)) {
                ports.push(port);
            }
        }
        Ok(ports)
    }
}

pub struct PlugPortsInput {
    pub amphora_id: String,
    pub ports: Vec<Port>,
}

/// Plugs existing ports into an amphora's compute instance.
pub struct PlugPorts {
    services: Services,
}

impl PlugPorts {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for PlugPorts {
    type Input = PlugPortsInput;
    type Output = ();

    fn name(&self) -> &'static str {
        "plug-ports"
    }

    async fn execute(&self, _ctx: &StepContext, input: &Self::Input) -> Result<()> {
        let amphora = self.services.amphora(&input.amphora_id).await?;
        for port in &input.ports {
            debug!(
                "Plugging port {} into compute instance {}",
                port.id,
                amphora.compute_id.as_deref().unwrap_or("-")
            );
            self.services.driver.plug_port(&amphora, port).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{CreatePortRequest, NetworkDriver};
    use crate::test_util::{Fixture, LB_ID, MGMT_NET, NET_B, NET_C, VIP_NET};

    #[tokio::test]
    async fn test_calculate_delta_loads_persisted_state() {
        let fx = Fixture::new().await.unwrap();
        let step = CalculateDelta::new(fx.services.clone(), vec![MGMT_NET.to_string()]);

        let deltas = step
            .execute(
                &StepContext::new(),
                &DeltasInput {
                    load_balancer_id: LB_ID.to_string(),
                    availability_zone: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(deltas.len(), 2);
        let added: Vec<&str> = deltas["amp-1"]
            .add_nics
            .iter()
            .map(|n| n.network_id.as_str())
            .collect();
        assert_eq!(added, vec![NET_B, VIP_NET]);
    }

    #[tokio::test]
    async fn test_calculate_amphora_delta_unknown_lb() {
        let fx = Fixture::new().await.unwrap();
        let step = CalculateAmphoraDelta::new(fx.services.clone(), vec![]);

        let err = step
            .execute(
                &StepContext::new(),
                &AmphoraDeltaInput {
                    load_balancer_id: "nope".to_string(),
                    amphora: fx.amphora("amp-1"),
                    availability_zone: None,
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_unplug_networks_tolerates_missing() {
        let fx = Fixture::new().await.unwrap();
        let amp = fx.amphora("amp-1");
        let port = fx
            .driver
            .create_port(CreatePortRequest::new(NET_B, "p"))
            .await
            .unwrap();
        fx.driver.plug_port(&amp, &port).await.unwrap();

        let delta = Delta {
            delete_nics: vec![
                Interface {
                    network_id: NET_C.to_string(),
                    ..Default::default()
                },
                Interface {
                    network_id: NET_B.to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        UnplugNetworks::new(fx.services.clone())
            .execute(
                &StepContext::new(),
                &UnplugNetworksInput {
                    amphora: amp,
                    delta: Some(delta),
                },
            )
            .await
            .unwrap();

        assert_eq!(fx.driver.calls_to("unplug_network").len(), 2);
        assert!(!fx.driver.plugged_port_ids("vm-1").contains(&port.id));
    }

    #[tokio::test]
    async fn test_port_listing_skips_management_port() {
        let mut fx = Fixture::new().await.unwrap();
        let (vip, _) = fx.driver.allocate_vip(&fx.lb).await.unwrap();
        let mut lb = fx.lb.clone();
        lb.vip = vip;
        fx.save(lb).await.unwrap();
        let amp = fx.amphora("amp-1");

        let member = fx
            .driver
            .create_port(CreatePortRequest::new(NET_B, "member"))
            .await
            .unwrap();
        fx.driver.plug_port(&amp, &member).await.unwrap();
        let base = fx
            .driver
            .create_port(CreatePortRequest::new(VIP_NET, "base"))
            .await
            .unwrap();
        fx.driver.plug_port(&amp, &base).await.unwrap();

        let ctx = StepContext::new();
        let member_ports = GetMemberPorts::new(fx.services.clone())
            .execute(
                &ctx,
                &MemberPortsInput {
                    load_balancer: fx.lb.clone(),
                    amphora: amp.clone(),
                },
            )
            .await
            .unwrap();
        assert_eq!(member_ports.len(), 1);
        assert_eq!(member_ports[0].id, member.id);
        assert!(member_ports[0].network.is_some());
        assert!(member_ports[0].fixed_ips[0].subnet.is_some());

        let ids: Vec<String> = RetrievePortIdsExceptLbNetwork::new(fx.services.clone())
            .execute(&ctx, &amp)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec![member.id.clone(), base.id.clone()]);
    }

    #[tokio::test]
    async fn test_plug_ports() {
        let fx = Fixture::new().await.unwrap();
        let port = fx
            .driver
            .create_port(CreatePortRequest::new(NET_C, "p"))
            .await
            .unwrap();

        PlugPorts::new(fx.services.clone())
            .execute(
                &StepContext::new(),
                &PlugPortsInput {
                    amphora_id: "amp-2".to_string(),
                    ports: vec![port.clone()],
                },
            )
            .await
            .unwrap();

        assert!(fx.driver.plugged_port_ids("vm-2").contains(&port.id));
        let plumbed = GetPlumbedNetworks::new(fx.services.clone())
            .execute(&StepContext::new(), &fx.amphora("amp-2"))
            .await
            .unwrap();
        assert_eq!(plumbed.len(), 2);
    }
}
