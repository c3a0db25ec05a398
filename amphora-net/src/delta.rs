//! Desired vs. actual network attachment diff.
//!
//! The desired topology of an amphora is the VIP subnet plus the subnet of
//! every live pool member. The actual topology is whatever the driver reports
//! as plugged, minus the management networks, which are never touched.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::driver::NetworkDriver;
use crate::error::Result;
use crate::model::{
    Amphora, AvailabilityZone, FixedIp, Interface, LoadBalancer, ProvisioningStatus, VnicType,
};

/// A subnet binding to add to or remove from an amphora.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetChange {
    pub subnet_id: String,
    pub network_id: String,
    /// Port already carrying the network, or `None` when the port is created
    /// by the same delta.
    pub port_id: Option<String>,
}

/// Attachment changes needed to converge one amphora.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    pub amphora_id: String,
    pub compute_id: String,
    pub add_nics: Vec<Interface>,
    pub delete_nics: Vec<Interface>,
    pub add_subnets: Vec<SubnetChange>,
    pub delete_subnets: Vec<SubnetChange>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.add_nics.is_empty()
            && self.delete_nics.is_empty()
            && self.add_subnets.is_empty()
            && self.delete_subnets.is_empty()
    }
}

/// Computes per-amphora deltas against the driver's view of the world.
pub struct DeltaCalculator {
    driver: Arc<dyn NetworkDriver>,
    boot_networks: Vec<String>,
}

impl DeltaCalculator {
    /// `boot_networks` is the default management network list, used when the
    /// availability zone does not declare its own.
    pub fn new(driver: Arc<dyn NetworkDriver>, boot_networks: Vec<String>) -> Self {
        Self {
            driver,
            boot_networks,
        }
    }

    fn management_networks(&self, az: Option<&AvailabilityZone>) -> BTreeSet<String> {
        match az.and_then(|az| az.management_network.as_ref()) {
            Some(net) => BTreeSet::from([net.clone()]),
            None => self.boot_networks.iter().cloned().collect(),
        }
    }

    /// Interfaces plugged into the amphora, management networks excluded.
    /// Only one interface per network is expected; a later one wins.
    pub async fn plugged_networks(
        &self,
        amphora: &Amphora,
        az: Option<&AvailabilityZone>,
    ) -> Result<BTreeMap<String, Interface>> {
        let compute_id = amphora.compute_id.as_deref().unwrap_or_default();
        let management = self.management_networks(az);
        let nics = self.driver.get_plugged_networks(compute_id).await?;

        Ok(nics
            .into_iter()
            .filter(|nic| !management.contains(&nic.network_id))
            .map(|nic| (nic.network_id.clone(), nic))
            .collect())
    }

    /// Desired subnet -> network map and the vnic type of each member network.
    async fn desired_topology(
        &self,
        lb: &LoadBalancer,
        subnet_cache: &mut HashMap<String, String>,
    ) -> Result<(BTreeMap<String, String>, HashMap<String, VnicType>)> {
        let mut subnet_to_network =
            BTreeMap::from([(lb.vip.subnet_id.clone(), lb.vip.network_id.clone())]);
        let mut vnic_types = HashMap::new();

        let members = lb.pools.iter().flat_map(|pool| pool.members.iter());
        for member in members {
            if member.provisioning_status == ProvisioningStatus::PendingDelete {
                continue;
            }
            let Some(subnet_id) = &member.subnet_id else {
                continue;
            };
            let network_id = match subnet_cache.get(subnet_id) {
                Some(network_id) => network_id.clone(),
                None => {
                    let network_id = self.driver.get_subnet(subnet_id).await?.network_id;
                    subnet_cache.insert(subnet_id.clone(), network_id.clone());
                    network_id
                }
            };
            vnic_types.insert(network_id.clone(), member.vnic_type);
            subnet_to_network.insert(subnet_id.clone(), network_id);
        }

        Ok((subnet_to_network, vnic_types))
    }

    /// Delta for a single amphora.
    pub async fn compute_delta(
        &self,
        lb: &LoadBalancer,
        amphora: &Amphora,
        az: Option<&AvailabilityZone>,
    ) -> Result<Delta> {
        self.compute_delta_cached(lb, amphora, az, &mut HashMap::new())
            .await
    }

    async fn compute_delta_cached(
        &self,
        lb: &LoadBalancer,
        amphora: &Amphora,
        az: Option<&AvailabilityZone>,
        subnet_cache: &mut HashMap<String, String>,
    ) -> Result<Delta> {
        debug!("Calculating network delta for amphora {}", amphora.id);

        let (desired_subnets, vnic_types) = self.desired_topology(lb, subnet_cache).await?;
        let desired_networks: BTreeSet<&String> = desired_subnets.values().collect();

        let network_to_nic = self.plugged_networks(amphora, az).await?;
        let plugged_networks: BTreeSet<&String> = network_to_nic.keys().collect();

        let delete_nics = plugged_networks
            .difference(&desired_networks)
            .map(|network_id| Interface {
                network_id: (*network_id).clone(),
                port_id: network_to_nic[*network_id].port_id.clone(),
                ..Default::default()
            })
            .collect();

        let add_nics = desired_networks
            .difference(&plugged_networks)
            .map(|network_id| Interface {
                network_id: (*network_id).clone(),
                port_id: None,
                fixed_ips: desired_subnets
                    .iter()
                    .filter(|(_, net)| net == network_id)
                    .map(|(subnet_id, _)| FixedIp::for_subnet(subnet_id.clone()))
                    .collect(),
                vnic_type: vnic_types.get(*network_id).copied().unwrap_or_default(),
            })
            .collect();

        let mut plugged_subnets = BTreeMap::new();
        for nic in network_to_nic.values() {
            for fixed_ip in &nic.fixed_ips {
                plugged_subnets.insert(fixed_ip.subnet_id.clone(), nic.network_id.clone());
            }
        }

        let subnet_changes = |subnet_ids: Vec<&String>, owner: &BTreeMap<String, String>| {
            subnet_ids
                .into_iter()
                .map(|subnet_id| {
                    let network_id = owner[subnet_id].clone();
                    let port_id = network_to_nic
                        .get(&network_id)
                        .and_then(|nic| nic.port_id.clone());
                    SubnetChange {
                        subnet_id: subnet_id.clone(),
                        network_id,
                        port_id,
                    }
                })
                .collect::<Vec<_>>()
        };

        let add_subnet_ids = desired_subnets
            .keys()
            .filter(|id| !plugged_subnets.contains_key(*id))
            .collect();
        let delete_subnet_ids = plugged_subnets
            .keys()
            .filter(|id| !desired_subnets.contains_key(*id))
            .collect();

        let delta = Delta {
            amphora_id: amphora.id.clone(),
            compute_id: amphora.compute_id.clone().unwrap_or_default(),
            add_nics,
            delete_nics,
            add_subnets: subnet_changes(add_subnet_ids, &desired_subnets),
            delete_subnets: subnet_changes(delete_subnet_ids, &plugged_subnets),
        };
        debug!(
            amphora_id = %delta.amphora_id,
            add_nics = delta.add_nics.len(),
            delete_nics = delta.delete_nics.len(),
            add_subnets = delta.add_subnets.len(),
            delete_subnets = delta.delete_subnets.len(),
            "Network delta calculated"
        );
        Ok(delta)
    }

    /// Deltas for every allocated amphora of the load balancer.
    pub async fn compute_deltas(
        &self,
        lb: &LoadBalancer,
        az: Option<&AvailabilityZone>,
    ) -> Result<BTreeMap<String, Delta>> {
        let mut subnet_cache = HashMap::new();
        let mut deltas = BTreeMap::new();
        for amphora in lb.allocated_amphorae() {
            let delta = self
                .compute_delta_cached(lb, amphora, az, &mut subnet_cache)
                .await?;
            deltas.insert(amphora.id.clone(), delta);
        }
        Ok(deltas)
    }
}
