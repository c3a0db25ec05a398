//! Applies network deltas to amphorae.
//!
//! A delta is applied in four phases whose order is fixed by
//! [`DeltaPhase::ORDER`]: new interfaces first, so that subnet additions can
//! target freshly created ports, and removals last.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::Services;
use crate::delta::{Delta, SubnetChange};
use crate::driver::CreatePortRequest;
use crate::error::{NetworkError, Result};
use crate::model::{Amphora, AmphoraMemberPort, Interface, Port, member_port_name};
use crate::step::{Step, StepContext};
use crate::store::StoreError;

/// One phase of delta application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaPhase {
    AddNics,
    AddSubnets,
    DeleteSubnets,
    DeleteNics,
}

impl DeltaPhase {
    /// Execution order. Later phases rely on the ports produced by earlier ones.
    pub const ORDER: [DeltaPhase; 4] = [
        DeltaPhase::AddNics,
        DeltaPhase::AddSubnets,
        DeltaPhase::DeleteSubnets,
        DeltaPhase::DeleteNics,
    ];
}

/// Ports touched while applying one delta, keyed by network id.
type UpdatedPorts = BTreeMap<String, Port>;

pub struct ApplyDeltaInput {
    pub amphora_id: String,
    pub delta: Delta,
}

/// Applies one amphora's delta. Output maps the amphora id to the ports
/// whose attachment changed.
pub struct ApplyDelta {
    services: Services,
}

impl ApplyDelta {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    async fn cleanup_port(&self, port_id: &str, compute_id: &str) {
        if let Err(e) = self.services.driver.delete_port(port_id).await {
            error!(
                "Unable to delete port {} after failing to plug it into compute {}. \
                 This port may now be abandoned: {}",
                port_id, compute_id, e
            );
            self.services.audit.resource_leaked("port", port_id, &e.to_string());
        }
    }

    async fn add_nic(
        &self,
        amphora: &Amphora,
        nic: &Interface,
        updated: &mut UpdatedPorts,
    ) -> Result<()> {
        let driver = &self.services.driver;
        let compute_id = amphora.compute_id.as_deref().unwrap_or_default();
        let network_id = &nic.network_id;

        let request = CreatePortRequest::new(network_id, member_port_name(&amphora.id))
            .fixed_ips(nic.fixed_ips.first().cloned().into_iter().collect())
            .vnic_type(nic.vnic_type);
        let port = match driver.create_port(request).await {
            Ok(port) => port,
            Err(NetworkError::NotFound(msg)) if msg.contains("Network") => {
                return Err(NetworkError::NetworkNotFound(msg));
            }
            Err(NetworkError::NetworkNotFound(msg)) => return Err(NetworkError::NetworkNotFound(msg)),
            Err(NetworkError::NotFound(msg)) => return Err(NetworkError::CreatePort(msg)),
            Err(e) => {
                error!("Error creating a port on network {}: {}", network_id, e);
                return Err(NetworkError::CreatePort(format!(
                    "Error creating a port on network {network_id}: {e}"
                )));
            }
        };

        if let Err(e) = driver.plug_port(amphora, &port).await {
            self.cleanup_port(&port.id, compute_id).await;
            return Err(match e {
                NetworkError::NotFound(msg) if msg.contains("Instance") => {
                    NetworkError::AmphoraNotFound(msg)
                }
                NetworkError::AmphoraNotFound(msg) => NetworkError::AmphoraNotFound(msg),
                NetworkError::NotFound(msg) => NetworkError::PlugNetwork(msg),
                other => {
                    error!(
                        "Error plugging amphora (compute_id: {}) into network {}: {}",
                        compute_id, network_id, other
                    );
                    NetworkError::PlugNetwork(format!(
                        "Error plugging amphora (compute_id: {compute_id}) into network {network_id}: {other}"
                    ))
                }
            });
        }
        self.services.audit.port_created(&port.id, network_id, Some(&amphora.id));

        self.services
            .repo
            .create_member_port(&AmphoraMemberPort {
                amphora_id: amphora.id.clone(),
                port_id: port.id.clone(),
                network_id: network_id.clone(),
            })
            .await?;
        self.services.audit.member_port_recorded(&amphora.id, &port.id);

        let mut port = port;
        self.services.fill_port_info(&mut port).await?;
        updated.insert(port.network_id.clone(), port);
        Ok(())
    }

    async fn add_subnet(&self, change: &SubnetChange, updated: &mut UpdatedPorts) -> Result<()> {
        let existing = updated.get(&change.network_id);
        let port_id = match (&change.port_id, existing) {
            (Some(id), _) => id.clone(),
            (None, Some(port)) => port.id.clone(),
            (None, None) => {
                return Err(NetworkError::InvalidInput(format!(
                    "no port on network {} for subnet {}",
                    change.network_id, change.subnet_id
                )));
            }
        };
        if existing.is_some_and(|port| port.has_subnet(&change.subnet_id)) {
            return Ok(());
        }

        let mut port = self
            .services
            .driver
            .plug_fixed_ip(&port_id, &change.subnet_id)
            .await?;
        self.services.fill_port_info(&mut port).await?;
        updated.insert(change.network_id.clone(), port);
        Ok(())
    }

    async fn delete_subnet(&self, change: &SubnetChange, updated: &mut UpdatedPorts) -> Result<()> {
        let Some(port_id) = &change.port_id else {
            warn!(
                "No port recorded for subnet {} on network {}, skipping removal",
                change.subnet_id, change.network_id
            );
            return Ok(());
        };
        let mut port = self
            .services
            .driver
            .unplug_fixed_ip(port_id, &change.subnet_id)
            .await?;
        self.services.fill_port_info(&mut port).await?;

        // IPv6 SLAAC subnets are not removed by the substrate; the port is
        // then unchanged and must not be reported as updated.
        if port.has_subnet(&change.subnet_id) {
            debug!(
                "Subnet {} still present on port {} after removal, ignoring",
                change.subnet_id, port.id
            );
        } else {
            updated.insert(change.network_id.clone(), port);
        }
        Ok(())
    }

    async fn delete_nic(
        &self,
        compute_id: &str,
        amphora_id: &str,
        nic: &Interface,
        updated: &mut UpdatedPorts,
    ) -> Result<()> {
        let driver = &self.services.driver;
        let network_id = &nic.network_id;

        match driver.unplug_network(compute_id, network_id).await {
            Ok(()) => {}
            Err(NetworkError::NetworkNotFound(_)) => debug!("Network {} not found", network_id),
            Err(e) => error!("Unable to unplug network {}: {}", network_id, e),
        }

        if let Some(port_id) = &nic.port_id {
            match driver.delete_port(port_id).await {
                Ok(()) => self.services.audit.port_deleted(port_id),
                Err(e) => error!("Unable to delete port {}: {}", port_id, e),
            }
            match self.services.repo.delete_member_port(port_id).await {
                Ok(()) => self.services.audit.member_port_removed(amphora_id, port_id),
                Err(StoreError::NotFound(_)) => {
                    warn!("No amphora member port record found for port {}", port_id)
                }
                Err(e) => return Err(e.into()),
            }
        }

        updated.remove(network_id);
        Ok(())
    }

    /// Apply the delta phase by phase and return the updated ports.
    pub async fn apply(&self, amphora: &Amphora, delta: &Delta) -> Result<Vec<Port>> {
        let compute_id = amphora.compute_id.as_deref().unwrap_or_default();
        let mut updated = UpdatedPorts::new();

        for phase in DeltaPhase::ORDER {
            debug!(amphora_id = %amphora.id, ?phase, "Applying delta phase");
            match phase {
                DeltaPhase::AddNics => {
                    for nic in &delta.add_nics {
                        self.add_nic(amphora, nic, &mut updated).await?;
                    }
                }
                DeltaPhase::AddSubnets => {
                    for change in &delta.add_subnets {
                        self.add_subnet(change, &mut updated).await?;
                    }
                }
                DeltaPhase::DeleteSubnets => {
                    for change in &delta.delete_subnets {
                        self.delete_subnet(change, &mut updated).await?;
                    }
                }
                DeltaPhase::DeleteNics => {
                    for nic in &delta.delete_nics {
                        self.delete_nic(compute_id, &amphora.id, nic, &mut updated).await?;
                    }
                }
            }
        }

        info!(
            "Applied network delta to amphora {} ({} ports updated)",
            amphora.id,
            updated.len()
        );
        Ok(updated.into_values().collect())
    }

    /// Undo the interfaces a delta added. Never fails.
    pub async fn unwind(&self, delta: &Delta, ports: &[Port]) {
        warn!("Unable to plug networks for amphora {}", delta.amphora_id);
        let driver = &self.services.driver;

        for nic in &delta.add_nics {
            if let Err(e) = driver.unplug_network(&delta.compute_id, &nic.network_id).await {
                error!("Unable to unplug network {}: {}", nic.network_id, e);
            }

            let port_id = nic.port_id.clone().or_else(|| {
                ports
                    .iter()
                    .find(|p| p.network_id == nic.network_id)
                    .map(|p| p.id.clone())
            });
            let Some(port_id) = port_id else {
                continue;
            };
            match driver.delete_port(&port_id).await {
                Ok(()) => self.services.audit.port_deleted(&port_id),
                Err(e) => {
                    error!("Unable to delete port {}: {}", port_id, e);
                    self.services.audit.resource_leaked("port", &port_id, &e.to_string());
                }
            }
            if let Err(e) = self.services.repo.delete_member_port(&port_id).await {
                debug!("No member port binding removed for port {}: {}", port_id, e);
            }
        }
    }
}

#[async_trait]
impl Step for ApplyDelta {
    type Input = ApplyDeltaInput;
    type Output = BTreeMap<String, Vec<Port>>;

    fn name(&self) -> &'static str {
        "apply-delta"
    }

    async fn execute(&self, _ctx: &StepContext, input: &Self::Input) -> Result<Self::Output> {
        let amphora = self.services.amphora(&input.amphora_id).await?;
        let ports = self.apply(&amphora, &input.delta).await?;
        Ok(BTreeMap::from([(input.amphora_id.clone(), ports)]))
    }

    async fn revert(&self, _ctx: &StepContext, input: &Self::Input, output: &Self::Output) {
        let ports = output.get(&input.amphora_id).map(Vec::as_slice).unwrap_or_default();
        self.unwind(&input.delta, ports).await;
    }
}

pub struct ApplyDeltasInput {
    pub load_balancer_id: String,
    pub deltas: BTreeMap<String, Delta>,
}

/// Applies the deltas of every amphora of a load balancer.
pub struct ApplyDeltas {
    services: Services,
    inner: ApplyDelta,
}

impl ApplyDeltas {
    pub fn new(services: Services) -> Self {
        Self {
            inner: ApplyDelta::new(services.clone()),
            services,
        }
    }
}

#[async_trait]
impl Step for ApplyDeltas {
    type Input = ApplyDeltasInput;
    type Output = BTreeMap<String, Vec<Port>>;

    fn name(&self) -> &'static str {
        "apply-deltas"
    }

    async fn execute(&self, _ctx: &StepContext, input: &Self::Input) -> Result<Self::Output> {
        let lb = self.services.load_balancer(&input.load_balancer_id).await?;

        let mut updated = BTreeMap::new();
        for (amphora_id, delta) in &input.deltas {
            let amphora = lb
                .amphorae
                .iter()
                .find(|amp| &amp.id == amphora_id)
                .ok_or_else(|| NetworkError::AmphoraNotFound(amphora_id.clone()))?;
            let ports = self.inner.apply(amphora, delta).await?;
            updated.insert(amphora_id.clone(), ports);
        }
        Ok(updated)
    }

    async fn revert(&self, _ctx: &StepContext, input: &Self::Input, output: &Self::Output) {
        for (amphora_id, delta) in &input.deltas {
            let ports = output.get(amphora_id).map(Vec::as_slice).unwrap_or_default();
            self.inner.unwind(delta, ports).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::DeltaCalculator;
    use crate::driver::NetworkDriver;
    use crate::model::{FixedIp, Subnet};
    use crate::store::MemberPortStore;
    use crate::test_util::{Fixture, MGMT_NET, NET_B, NET_C, SUBNET_B, SUBNET_C, member, subnet};

    fn add_nic_delta(network_id: &str, subnet_id: &str) -> Delta {
        Delta {
            amphora_id: "amp-1".to_string(),
            compute_id: "vm-1".to_string(),
            add_nics: vec![Interface {
                network_id: network_id.to_string(),
                fixed_ips: vec![FixedIp::for_subnet(subnet_id)],
                ..Default::default()
            }],
            add_subnets: vec![SubnetChange {
                subnet_id: subnet_id.to_string(),
                network_id: network_id.to_string(),
                port_id: None,
            }],
            ..Default::default()
        }
    }

    fn input(delta: Delta) -> ApplyDeltaInput {
        ApplyDeltaInput {
            amphora_id: "amp-1".to_string(),
            delta,
        }
    }

    #[test]
    fn test_phase_order() {
        assert_eq!(
            DeltaPhase::ORDER,
            [
                DeltaPhase::AddNics,
                DeltaPhase::AddSubnets,
                DeltaPhase::DeleteSubnets,
                DeltaPhase::DeleteNics
            ]
        );
    }

    #[tokio::test]
    async fn test_add_nic_creates_plugs_and_records() {
        let fx = Fixture::new().await.unwrap();
        let step = ApplyDelta::new(fx.services.clone());

        let out = step
            .execute(&StepContext::new(), &input(add_nic_delta(NET_C, SUBNET_C)))
            .await
            .unwrap();

        let ports = &out["amp-1"];
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].name, "lb-member-amp-1");
        assert!(ports[0].has_subnet(SUBNET_C));
        assert!(ports[0].network.is_some());
        assert!(fx.driver.plugged_port_ids("vm-1").contains(&ports[0].id));
        assert_eq!(fx.repo.get_member_port_ids("amp-1").await.unwrap(), vec![ports[0].id.clone()]);
        // the subnet came with the port, no extra binding call
        assert!(fx.driver.calls_to("plug_fixed_ip").is_empty());
    }

    #[tokio::test]
    async fn test_network_not_found_aborts_before_plug() {
        let fx = Fixture::new().await.unwrap();
        fx.driver.inject_fault("create_port", 1, || {
            NetworkError::NotFound("Network xyz not found".into())
        });
        let step = ApplyDelta::new(fx.services.clone());

        let err = step
            .execute(&StepContext::new(), &input(add_nic_delta(NET_C, SUBNET_C)))
            .await
            .unwrap_err();

        assert!(matches!(err, NetworkError::NetworkNotFound(_)));
        assert!(fx.driver.calls_to("plug_port").is_empty());
        assert!(fx.repo.get_member_port_ids("amp-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_other_create_failure_is_create_port() {
        let fx = Fixture::new().await.unwrap();
        fx.driver
            .inject_fault("create_port", 1, || NetworkError::Driver("quota exceeded".into()));

        let err = ApplyDelta::new(fx.services.clone())
            .execute(&StepContext::new(), &input(add_nic_delta(NET_C, SUBNET_C)))
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::CreatePort(_)));
    }

    #[tokio::test]
    async fn test_plug_failure_cleans_up_port() {
        let fx = Fixture::new().await.unwrap();
        fx.driver.inject_fault("plug_port", 1, || {
            NetworkError::NotFound("Instance vm-1 missing".into())
        });

        let err = ApplyDelta::new(fx.services.clone())
            .execute(&StepContext::new(), &input(add_nic_delta(NET_C, SUBNET_C)))
            .await
            .unwrap_err();

        assert!(matches!(err, NetworkError::AmphoraNotFound(_)));
        let deleted = fx.driver.calls_to("delete_port");
        assert_eq!(deleted.len(), 1);
        assert!(fx.driver.port(&deleted[0]).is_none());
        assert!(fx.repo.get_member_port_ids("amp-1").await.unwrap().is_empty());

        fx.driver
            .inject_fault("plug_port", 1, || NetworkError::Driver("timeout".into()));
        let err = ApplyDelta::new(fx.services.clone())
            .execute(&StepContext::new(), &input(add_nic_delta(NET_C, SUBNET_C)))
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::PlugNetwork(_)));
    }

    #[tokio::test]
    async fn test_delete_nic_continues_past_failures() {
        let fx = Fixture::new().await.unwrap();
        let step = ApplyDelta::new(fx.services.clone());
        let out = step
            .execute(&StepContext::new(), &input(add_nic_delta(NET_B, SUBNET_B)))
            .await
            .unwrap();
        let port_id = out["amp-1"][0].id.clone();

        fx.driver.inject_fault("unplug_network", 1, || {
            NetworkError::NetworkNotFound("gone".into())
        });
        let delta = Delta {
            amphora_id: "amp-1".to_string(),
            compute_id: "vm-1".to_string(),
            delete_nics: vec![Interface {
                network_id: NET_B.to_string(),
                port_id: Some(port_id.clone()),
                ..Default::default()
            }],
            ..Default::default()
        };
        let out = step.execute(&StepContext::new(), &input(delta)).await.unwrap();

        assert!(out["amp-1"].is_empty());
        assert_eq!(fx.driver.calls_to("delete_port"), vec![port_id.clone()]);
        assert!(fx.driver.port(&port_id).is_none());
        assert!(fx.repo.get_member_port_ids("amp-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_nic_without_binding() {
        let fx = Fixture::new().await.unwrap();
        let delta = Delta {
            amphora_id: "amp-1".to_string(),
            compute_id: "vm-1".to_string(),
            delete_nics: vec![Interface {
                network_id: NET_B.to_string(),
                port_id: Some("legacy-port".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        };

        ApplyDelta::new(fx.services.clone())
            .execute(&StepContext::new(), &input(delta))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_slaac_subnet_not_reported() {
        let fx = Fixture::new().await.unwrap();
        fx.driver.add_subnet(Subnet {
            ipv6_address_mode: Some("slaac".to_string()),
            ..subnet("subnet-b6", NET_B, "fd00:b::/64")
        });
        let step = ApplyDelta::new(fx.services.clone());
        let out = step
            .execute(&StepContext::new(), &input(add_nic_delta(NET_B, SUBNET_B)))
            .await
            .unwrap();
        let port_id = out["amp-1"][0].id.clone();
        fx.driver.plug_fixed_ip(&port_id, "subnet-b6").await.unwrap();

        let delta = Delta {
            amphora_id: "amp-1".to_string(),
            compute_id: "vm-1".to_string(),
            delete_subnets: vec![SubnetChange {
                subnet_id: "subnet-b6".to_string(),
                network_id: NET_B.to_string(),
                port_id: Some(port_id.clone()),
            }],
            ..Default::default()
        };
        let out = step.execute(&StepContext::new(), &input(delta)).await.unwrap();

        assert!(out["amp-1"].is_empty());
        assert!(fx.driver.port(&port_id).unwrap().has_subnet("subnet-b6"));
    }

    #[tokio::test]
    async fn test_revert_removes_added_ports() {
        let fx = Fixture::new().await.unwrap();
        let step = ApplyDelta::new(fx.services.clone());
        let input = input(add_nic_delta(NET_C, SUBNET_C));
        let ctx = StepContext::new();
        let out = step.execute(&ctx, &input).await.unwrap();
        let port_id = out["amp-1"][0].id.clone();

        fx.driver.inject_fault("unplug_network", 1, || NetworkError::Driver("boom".into()));
        step.revert(&ctx, &input, &out).await;

        assert!(fx.driver.port(&port_id).is_none());
        assert!(!fx.driver.plugged_port_ids("vm-1").contains(&port_id));
        assert!(fx.repo.get_member_port_ids("amp-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_deltas_converges() {
        let mut fx = Fixture::new().await.unwrap();
        let mut lb = fx.lb.clone();
        lb.pools[0].members.push(member("m2", SUBNET_C));
        fx.save(lb).await.unwrap();

        let calc = DeltaCalculator::new(fx.driver.clone(), vec![MGMT_NET.to_string()]);
        let deltas = calc.compute_deltas(&fx.lb, None).await.unwrap();
        let step = ApplyDeltas::new(fx.services.clone());
        let out = step
            .execute(
                &StepContext::new(),
                &ApplyDeltasInput {
                    load_balancer_id: fx.lb.id.clone(),
                    deltas,
                },
            )
            .await
            .unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out["amp-2"].len(), 3);
        for delta in calc.compute_deltas(&fx.lb, None).await.unwrap().values() {
            assert!(delta.is_empty(), "not converged: {delta:?}");
        }
    }
}
