//! In-memory network substrate.
//!
//! Simulates networks, subnets, ports and compute instances well enough to
//! drive the delta calculator and every step end to end. Each call is
//! journaled, and faults can be scripted per operation so retry and
//! compensation paths can be exercised deterministically.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{CreatePortRequest, NetworkDriver};
use crate::error::{NetworkError, Result};
use crate::model::{
    AdditionalVip, Amphora, AmphoraNetworkConfig, FixedIp, Interface, LoadBalancer, Network,
    Port, PortStatus, SecurityGroup, Subnet, Vip, base_port_name,
    vip_security_group_name,
};

/// Address mode whose fixed-IP removal the substrate silently ignores.
const SLAAC: &str = "slaac";

type FaultFn = Arc<dyn Fn() -> NetworkError + Send + Sync>;

struct Fault {
    remaining: usize,
    make: FaultFn,
}

/// One journaled driver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverCall {
    pub op: &'static str,
    pub target: String,
}

/// Seed data for an [`InMemoryDriver`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubstrateSnapshot {
    #[serde(default)]
    pub networks: Vec<Network>,
    #[serde(default)]
    pub subnets: Vec<Subnet>,
    /// Interfaces currently plugged into each compute instance.
    #[serde(default)]
    pub instances: BTreeMap<String, Vec<Interface>>,
    #[serde(default)]
    pub security_groups_enabled: bool,
}

#[derive(Default)]
struct State {
    networks: BTreeMap<String, Network>,
    subnets: BTreeMap<String, Subnet>,
    ports: BTreeMap<String, Port>,
    /// compute id -> plugged port ids, in plug order
    instances: BTreeMap<String, Vec<String>>,
    /// name -> group
    security_groups: BTreeMap<String, SecurityGroup>,
    /// subnet id -> last handed out host index
    allocations: HashMap<String, usize>,
    /// port id -> status reads left before the port reports DOWN
    pending_down: HashMap<String, usize>,
    down_delay: usize,
    faults: HashMap<&'static str, VecDeque<Fault>>,
    calls: Vec<DriverCall>,
}

impl State {
    fn take_fault(&mut self, op: &str) -> Option<NetworkError> {
        let queue = self.faults.get_mut(op)?;
        let fault = queue.front_mut()?;
        fault.remaining -= 1;
        let err = (fault.make)();
        if fault.remaining == 0 {
            queue.pop_front();
        }
        Some(err)
    }

    fn subnet(&self, subnet_id: &str) -> Result<&Subnet> {
        self.subnets
            .get(subnet_id)
            .ok_or_else(|| NetworkError::SubnetNotFound(subnet_id.to_string()))
    }

    fn port_mut(&mut self, port_id: &str) -> Result<&mut Port> {
        self.ports
            .get_mut(port_id)
            .ok_or_else(|| NetworkError::PortNotFound(port_id.to_string()))
    }

    fn instance_mut(&mut self, compute_id: &str) -> Result<&mut Vec<String>> {
        self.instances
            .get_mut(compute_id)
            .ok_or_else(|| NetworkError::NotFound(format!("Instance {compute_id} could not be found")))
    }

    /// Next free host address of a subnet. Host index 0 is the gateway.
    fn allocate_ip(&mut self, subnet_id: &str) -> Result<Option<IpAddr>> {
        let Some(cidr) = self.subnet(subnet_id)?.cidr else {
            return Ok(None);
        };
        let next = self.allocations.entry(subnet_id.to_string()).or_insert(0);
        *next += 1;
        cidr.hosts()
            .nth(*next)
            .map(Some)
            .ok_or_else(|| NetworkError::Driver(format!("subnet {subnet_id} is exhausted")))
    }

    fn resolve_fixed_ip(&mut self, network_id: &str, requested: &FixedIp) -> Result<FixedIp> {
        let subnet = self.subnet(&requested.subnet_id)?;
        if subnet.network_id != network_id {
            return Err(NetworkError::InvalidInput(format!(
                "subnet {} is not on network {}",
                requested.subnet_id, network_id
            )));
        }
        let ip_address = match requested.ip_address {
            Some(ip) => Some(ip),
            None => self.allocate_ip(&requested.subnet_id)?,
        };
        Ok(FixedIp {
            subnet_id: requested.subnet_id.clone(),
            ip_address,
            subnet: None,
        })
    }

    fn create_port(&mut self, request: CreatePortRequest) -> Result<Port> {
        let Some(network) = self.networks.get(&request.network_id) else {
            return Err(NetworkError::NotFound(format!(
                "Network {} could not be found",
                request.network_id
            )));
        };
        let requested = if request.fixed_ips.is_empty() {
            network
                .subnets
                .first()
                .map(|id| vec![FixedIp::for_subnet(id.clone())])
                .unwrap_or_default()
        } else {
            request.fixed_ips.clone()
        };

        let mut fixed_ips = Vec::with_capacity(requested.len());
        for fixed_ip in &requested {
            fixed_ips.push(self.resolve_fixed_ip(&request.network_id, fixed_ip)?);
        }

        let port = Port {
            id: Uuid::new_v4().to_string(),
            name: request.name,
            network_id: request.network_id,
            fixed_ips,
            admin_state_up: true,
            status: PortStatus::Active,
            device_id: None,
            qos_policy_id: request.qos_policy_id,
            security_group_ids: request.security_group_ids,
            vnic_type: request.vnic_type,
            allowed_address_pairs: request.secondary_ips,
            network: None,
        };
        self.ports.insert(port.id.clone(), port.clone());
        Ok(port)
    }

    fn plug(&mut self, compute_id: &str, port_id: &str) -> Result<()> {
        if !self.ports.contains_key(port_id) {
            return Err(NetworkError::PortNotFound(port_id.to_string()));
        }
        let plugged = self.instance_mut(compute_id)?;
        if !plugged.iter().any(|id| id == port_id) {
            plugged.push(port_id.to_string());
        }
        self.port_mut(port_id)?.device_id = Some(compute_id.to_string());
        Ok(())
    }

    fn remove_port(&mut self, port_id: &str) {
        self.ports.remove(port_id);
        self.pending_down.remove(port_id);
        for plugged in self.instances.values_mut() {
            plugged.retain(|id| id != port_id);
        }
    }

    fn ensure_security_group(&mut self, name: &str) -> String {
        self.security_groups
            .entry(name.to_string())
            .or_insert_with(|| SecurityGroup {
                id: Uuid::new_v4().to_string(),
                name: name.to_string(),
            })
            .id
            .clone()
    }

    fn base_port_of(&self, amphora: &Amphora) -> Option<String> {
        if let Some(id) = amphora.vrrp_port_id.as_ref().filter(|id| self.ports.contains_key(*id)) {
            return Some(id.clone());
        }
        let name = base_port_name(&amphora.id);
        self.ports.values().find(|p| p.name == name).map(|p| p.id.clone())
    }
}

/// Simulated network substrate used by the CLI dry runs and the tests.
pub struct InMemoryDriver {
    state: Mutex<State>,
    sec_grp_enabled: bool,
}

impl Default for InMemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            sec_grp_enabled: false,
        }
    }

    /// Toggle security group management for this substrate.
    pub fn with_security_groups(mut self, enabled: bool) -> Self {
        self.sec_grp_enabled = enabled;
        self
    }

    /// Build a substrate from a snapshot. Ports of the snapshot interfaces
    /// keep their ids when given; fixed IPs without an address get one
    /// allocated.
    pub fn from_snapshot(snapshot: &SubstrateSnapshot) -> Result<Self> {
        let driver = Self::new().with_security_groups(snapshot.security_groups_enabled);
        for network in &snapshot.networks {
            driver.add_network(network.clone());
        }
        for subnet in &snapshot.subnets {
            driver.add_subnet(subnet.clone());
        }
        for (compute_id, interfaces) in &snapshot.instances {
            driver.add_instance(compute_id);
            for interface in interfaces {
                driver.seed_interface(compute_id, interface)?;
            }
        }
        Ok(driver)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Journal a call and surface a scripted fault, if any.
    fn begin(&self, op: &'static str, target: impl Into<String>) -> Result<MutexGuard<'_, State>> {
        let mut state = self.state();
        state.calls.push(DriverCall {
            op,
            target: target.into(),
        });
        match state.take_fault(op) {
            Some(err) => Err(err),
            None => Ok(state),
        }
    }

    pub fn add_network(&self, network: Network) {
        self.state().networks.insert(network.id.clone(), network);
    }

    /// Register a subnet, creating its network when unknown.
    pub fn add_subnet(&self, subnet: Subnet) {
        let mut state = self.state();
        let network = state
            .networks
            .entry(subnet.network_id.clone())
            .or_insert_with(|| Network {
                id: subnet.network_id.clone(),
                ..Default::default()
            });
        if !network.subnets.contains(&subnet.id) {
            network.subnets.push(subnet.id.clone());
        }
        state.subnets.insert(subnet.id.clone(), subnet);
    }

    pub fn add_instance(&self, compute_id: &str) {
        self.state().instances.entry(compute_id.to_string()).or_default();
    }

    /// Remove a compute instance, e.g. to simulate a deleted VM.
    pub fn remove_instance(&self, compute_id: &str) {
        self.state().instances.remove(compute_id);
    }

    /// Create and plug the port behind an existing interface.
    pub fn seed_interface(&self, compute_id: &str, interface: &Interface) -> Result<Port> {
        let mut state = self.state();
        let mut port = state.create_port(
            CreatePortRequest::new(&interface.network_id, "")
                .fixed_ips(interface.fixed_ips.clone())
                .vnic_type(interface.vnic_type),
        )?;
        if let Some(id) = &interface.port_id {
            state.ports.remove(&port.id);
            port.id = id.clone();
            state.ports.insert(port.id.clone(), port.clone());
        }
        state.instances.entry(compute_id.to_string()).or_default();
        state.plug(compute_id, &port.id)?;
        Ok(port)
    }

    /// Ports stay ACTIVE for `polls` status reads after an admin-down.
    pub fn set_admin_down_delay(&self, polls: usize) {
        self.state().down_delay = polls;
    }

    /// Fail the next `times` calls of `op` with the error built by `make`.
    pub fn inject_fault<F>(&self, op: &'static str, times: usize, make: F)
    where
        F: Fn() -> NetworkError + Send + Sync + 'static,
    {
        if times == 0 {
            return;
        }
        self.state().faults.entry(op).or_default().push_back(Fault {
            remaining: times,
            make: Arc::new(make),
        });
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.state().calls.clone()
    }

    /// Targets of every journaled call of `op`.
    pub fn calls_to(&self, op: &str) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .map(|c| c.target.clone())
            .collect()
    }

    pub fn port(&self, port_id: &str) -> Option<Port> {
        self.state().ports.get(port_id).cloned()
    }

    pub fn ports(&self) -> Vec<Port> {
        self.state().ports.values().cloned().collect()
    }

    pub fn plugged_port_ids(&self, compute_id: &str) -> Vec<String> {
        self.state().instances.get(compute_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl NetworkDriver for InMemoryDriver {
    async fn get_plugged_networks(&self, compute_id: &str) -> Result<Vec<Interface>> {
        let mut state = self.begin("get_plugged_networks", compute_id)?;
        let plugged = state.instance_mut(compute_id)?.clone();
        Ok(plugged
            .iter()
            .filter_map(|id| state.ports.get(id))
            .map(|port| Interface {
                network_id: port.network_id.clone(),
                port_id: Some(port.id.clone()),
                fixed_ips: port.fixed_ips.clone(),
                vnic_type: port.vnic_type,
            })
            .collect())
    }

    async fn get_subnet(&self, subnet_id: &str) -> Result<Subnet> {
        let state = self.begin("get_subnet", subnet_id)?;
        state.subnet(subnet_id).cloned()
    }

    async fn get_network(&self, network_id: &str) -> Result<Network> {
        let state = self.begin("get_network", network_id)?;
        state
            .networks
            .get(network_id)
            .cloned()
            .ok_or_else(|| NetworkError::NetworkNotFound(network_id.to_string()))
    }

    async fn get_port(&self, port_id: &str) -> Result<Port> {
        let mut state = self.begin("get_port", port_id)?;
        if let Some(left) = state.pending_down.get_mut(port_id) {
            if *left == 0 {
                state.pending_down.remove(port_id);
                state.port_mut(port_id)?.status = PortStatus::Down;
            } else {
                *left -= 1;
            }
        }
        state
            .ports
            .get(port_id)
            .cloned()
            .ok_or_else(|| NetworkError::PortNotFound(port_id.to_string()))
    }

    async fn create_port(&self, request: CreatePortRequest) -> Result<Port> {
        let mut state = self.begin("create_port", request.name.clone())?;
        state.create_port(request)
    }

    async fn delete_port(&self, port_id: &str) -> Result<()> {
        let mut state = self.begin("delete_port", port_id)?;
        state.remove_port(port_id);
        Ok(())
    }

    async fn admin_down_port(&self, port_id: &str) -> Result<()> {
        let mut state = self.begin("admin_down_port", port_id)?;
        let port = state.port_mut(port_id)?;
        port.admin_state_up = false;
        port.status = PortStatus::Down;
        Ok(())
    }

    async fn set_port_admin_state_up(&self, port_id: &str, up: bool) -> Result<Port> {
        let mut state = self.begin("set_port_admin_state_up", format!("{port_id}={up}"))?;
        let delay = state.down_delay;
        state.port_mut(port_id)?.admin_state_up = up;
        if up {
            state.pending_down.remove(port_id);
            state.port_mut(port_id)?.status = PortStatus::Active;
        } else if delay > 0 {
            state.pending_down.insert(port_id.to_string(), delay);
        } else {
            state.port_mut(port_id)?.status = PortStatus::Down;
        }
        state
            .ports
            .get(port_id)
            .cloned()
            .ok_or_else(|| NetworkError::PortNotFound(port_id.to_string()))
    }

    async fn plug_port(&self, amphora: &Amphora, port: &Port) -> Result<()> {
        let mut state = self.begin("plug_port", port.id.clone())?;
        let compute_id = amphora.compute_id.as_deref().ok_or_else(|| {
            NetworkError::NotFound(format!("Instance for amphora {} could not be found", amphora.id))
        })?;
        state.plug(compute_id, &port.id)
    }

    async fn plug_fixed_ip(&self, port_id: &str, subnet_id: &str) -> Result<Port> {
        let mut state = self.begin("plug_fixed_ip", format!("{port_id}/{subnet_id}"))?;
        let network_id = state
            .ports
            .get(port_id)
            .map(|p| p.network_id.clone())
            .ok_or_else(|| NetworkError::PortNotFound(port_id.to_string()))?;
        if !state.port_mut(port_id)?.has_subnet(subnet_id) {
            let fixed_ip = state.resolve_fixed_ip(&network_id, &FixedIp::for_subnet(subnet_id))?;
            state.port_mut(port_id)?.fixed_ips.push(fixed_ip);
        }
        Ok(state.port_mut(port_id)?.clone())
    }

    async fn unplug_fixed_ip(&self, port_id: &str, subnet_id: &str) -> Result<Port> {
        let mut state = self.begin("unplug_fixed_ip", format!("{port_id}/{subnet_id}"))?;
        let ignored = state
            .subnets
            .get(subnet_id)
            .and_then(|s| s.ipv6_address_mode.as_deref())
            == Some(SLAAC);
        let port = state.port_mut(port_id)?;
        if !ignored {
            port.fixed_ips.retain(|ip| ip.subnet_id != subnet_id);
        }
        Ok(port.clone())
    }

    async fn unplug_network(&self, compute_id: &str, network_id: &str) -> Result<()> {
        let mut state = self.begin("unplug_network", format!("{compute_id}/{network_id}"))?;
        let plugged = state.instance_mut(compute_id)?.clone();
        let on_network: Vec<String> = plugged
            .into_iter()
            .filter(|id| state.ports.get(id).is_some_and(|p| p.network_id == network_id))
            .collect();
        if on_network.is_empty() {
            return Err(NetworkError::NetworkNotFound(format!(
                "network {network_id} is not plugged into {compute_id}"
            )));
        }
        state.instance_mut(compute_id)?.retain(|id| !on_network.contains(id));
        for id in &on_network {
            state.port_mut(id)?.device_id = None;
        }
        Ok(())
    }

    async fn allocate_vip(&self, lb: &LoadBalancer) -> Result<(Vip, Vec<AdditionalVip>)> {
        let mut state = self.begin("allocate_vip", lb.id.clone())?;
        let existing = lb
            .vip
            .port_id
            .as_ref()
            .and_then(|id| state.ports.get(id))
            .cloned();
        let mut port = match existing {
            Some(port) => port,
            None => {
                let mut fixed_ip = FixedIp::for_subnet(&lb.vip.subnet_id);
                fixed_ip.ip_address = lb.vip.ip_address;
                state.create_port(
                    CreatePortRequest::new(&lb.vip.network_id, format!("lb-vip-{}", lb.id))
                        .fixed_ips(vec![fixed_ip])
                        .qos_policy_id(lb.vip.qos_policy_id.clone()),
                )?
            }
        };

        let mut additional = Vec::with_capacity(lb.additional_vips.len());
        for extra in &lb.additional_vips {
            let present = port
                .fixed_ips
                .iter()
                .find(|ip| ip.subnet_id == extra.subnet_id)
                .cloned();
            let fixed_ip = match present {
                Some(ip) => ip,
                None => {
                    let mut requested = FixedIp::for_subnet(&extra.subnet_id);
                    requested.ip_address = extra.ip_address;
                    let ip = state.resolve_fixed_ip(&port.network_id, &requested)?;
                    port.fixed_ips.push(ip.clone());
                    ip
                }
            };
            additional.push(AdditionalVip {
                ip_address: fixed_ip.ip_address,
                subnet_id: extra.subnet_id.clone(),
                network_id: Some(port.network_id.clone()),
                port_id: Some(port.id.clone()),
            });
        }
        state.ports.insert(port.id.clone(), port.clone());

        let vip = Vip {
            ip_address: port
                .fixed_ips
                .iter()
                .find(|ip| ip.subnet_id == lb.vip.subnet_id)
                .and_then(|ip| ip.ip_address),
            port_id: Some(port.id.clone()),
            load_balancer_id: Some(lb.id.clone()),
            ..lb.vip.clone()
        };
        Ok((vip, additional))
    }

    async fn deallocate_vip(&self, vip: &Vip) -> Result<()> {
        let target = vip.port_id.clone().unwrap_or_default();
        let mut state = self.begin("deallocate_vip", target)?;
        if let Some(port_id) = &vip.port_id {
            state.remove_port(port_id);
        }
        Ok(())
    }

    async fn plug_aap_port(
        &self,
        _lb: &LoadBalancer,
        vip: &Vip,
        amphora: &Amphora,
        subnet: &Subnet,
    ) -> Result<Amphora> {
        let mut state = self.begin("plug_aap_port", amphora.id.clone())?;
        let compute_id = amphora.compute_id.clone().ok_or_else(|| {
            NetworkError::NotFound(format!("Instance for amphora {} could not be found", amphora.id))
        })?;
        state.instance_mut(&compute_id)?;

        let port_id = match state.base_port_of(amphora) {
            Some(id) => id,
            None => {
                state
                    .create_port(
                        CreatePortRequest::new(&subnet.network_id, base_port_name(&amphora.id))
                            .fixed_ips(vec![FixedIp::for_subnet(&subnet.id)])
                            .secondary_ips(vip.ip_address.into_iter().collect()),
                    )?
                    .id
            }
        };
        state.plug(&compute_id, &port_id)?;
        let vrrp_ip = state
            .ports
            .get(&port_id)
            .and_then(|p| p.fixed_ips.first())
            .and_then(|ip| ip.ip_address);

        Ok(Amphora {
            vrrp_port_id: Some(port_id),
            vrrp_ip,
            ha_port_id: vip.port_id.clone(),
            ha_ip: vip.ip_address,
            ..amphora.clone()
        })
    }

    async fn unplug_aap_port(&self, _vip: &Vip, amphora: &Amphora, _subnet: &Subnet) -> Result<()> {
        let mut state = self.begin("unplug_aap_port", amphora.id.clone())?;
        if let Some(port_id) = state.base_port_of(amphora) {
            state.remove_port(&port_id);
        }
        Ok(())
    }

    async fn unplug_vip(&self, lb: &LoadBalancer, _vip: &Vip) -> Result<()> {
        let mut state = self.begin("unplug_vip", lb.id.clone())?;
        for amphora in &lb.amphorae {
            if let Some(port_id) = state.base_port_of(amphora) {
                state.remove_port(&port_id);
            }
        }
        Ok(())
    }

    async fn update_vip(&self, lb: &LoadBalancer, for_delete: bool) -> Result<()> {
        self.begin("update_vip", format!("{}:{}", lb.id, for_delete))?;
        Ok(())
    }

    async fn update_vip_sg(&self, lb: &LoadBalancer, vip: &Vip) -> Result<Option<String>> {
        let mut state = self.begin("update_vip_sg", lb.id.clone())?;
        if !self.sec_grp_enabled {
            return Ok(None);
        }
        let sg_id = state.ensure_security_group(&vip_security_group_name(&lb.id));
        if let Some(port) = vip.port_id.as_ref().and_then(|id| state.ports.get_mut(id)) {
            if !port.security_group_ids.contains(&sg_id) {
                port.security_group_ids.push(sg_id.clone());
            }
        }
        Ok(Some(sg_id))
    }

    async fn update_aap_port_sg(
        &self,
        lb: &LoadBalancer,
        amphora: &Amphora,
        _vip: &Vip,
    ) -> Result<()> {
        let mut state = self.begin("update_aap_port_sg", amphora.id.clone())?;
        if !self.sec_grp_enabled {
            return Ok(());
        }
        let sg_id = state.ensure_security_group(&vip_security_group_name(&lb.id));
        if let Some(port_id) = state.base_port_of(amphora) {
            let port = state.port_mut(&port_id)?;
            if !port.security_group_ids.contains(&sg_id) {
                port.security_group_ids.push(sg_id);
            }
        }
        Ok(())
    }

    async fn apply_qos_on_port(&self, qos_policy_id: Option<&str>, port_id: &str) -> Result<()> {
        let target = format!("{}={}", port_id, qos_policy_id.unwrap_or("none"));
        let mut state = self.begin("apply_qos_on_port", target)?;
        state.port_mut(port_id)?.qos_policy_id = qos_policy_id.map(str::to_string);
        Ok(())
    }

    async fn get_security_group(&self, name: &str) -> Result<SecurityGroup> {
        let state = self.begin("get_security_group", name)?;
        state
            .security_groups
            .get(name)
            .cloned()
            .ok_or_else(|| NetworkError::SecurityGroupNotFound(name.to_string()))
    }

    fn sec_grp_enabled(&self) -> bool {
        self.sec_grp_enabled
    }

    async fn get_network_configs(
        &self,
        lb: &LoadBalancer,
        amphora: Option<&Amphora>,
    ) -> Result<HashMap<String, AmphoraNetworkConfig>> {
        let state = self.begin("get_network_configs", lb.id.clone())?;
        let amphorae: Vec<&Amphora> = match amphora {
            Some(amp) => vec![amp],
            None => lb.allocated_amphorae().collect(),
        };
        let vip_subnet = state.subnets.get(&lb.vip.subnet_id).cloned();
        let vip_port = lb.vip.port_id.as_ref().and_then(|id| state.ports.get(id)).cloned();

        let mut configs = HashMap::new();
        for amp in amphorae {
            let vrrp_port = amp
                .vrrp_port_id
                .as_ref()
                .and_then(|id| state.ports.get(id))
                .cloned();
            let vrrp_subnet = vrrp_port
                .as_ref()
                .and_then(|p| p.fixed_ips.first())
                .and_then(|ip| state.subnets.get(&ip.subnet_id))
                .cloned();
            let ha_port = amp.ha_port_id.as_ref().and_then(|id| state.ports.get(id)).cloned();
            configs.insert(
                amp.id.clone(),
                AmphoraNetworkConfig {
                    amphora_id: amp.id.clone(),
                    vip_subnet: vip_subnet.clone(),
                    vip_port: vip_port.clone(),
                    vrrp_subnet,
                    vrrp_port,
                    ha_subnet: vip_subnet.clone(),
                    ha_port,
                },
            );
        }
        Ok(configs)
    }
}
