//! Test utilities: a seeded in-memory substrate plus repository.
//!
//! Topology:
//! - `mgmt-net` / `mgmt-subnet` (192.168.0.0/24): management network
//! - `vip-net` / `vip-subnet` (10.0.0.0/24): VIP network
//! - `net-b` / `subnet-b` (10.0.1.0/24) and `net-c` / `subnet-c`
//!   (10.0.2.0/24): member networks
//! - compute `vm-1` and `vm-2`, each plugged into the management network only
//! - load balancer `lb-1` with allocated amphorae `amp-1` (vm-1) and
//!   `amp-2` (vm-2)

use std::sync::Arc;

use crate::driver::InMemoryDriver;
use crate::error::Result;
use crate::model::{
    Amphora, AmphoraStatus, FixedIp, Interface, LoadBalancer, Member, Pool, Subnet, Vip,
};
use crate::steps::Services;
use crate::store::{LoadBalancerStore, SqliteRepository};

pub const MGMT_NET: &str = "mgmt-net";
pub const VIP_NET: &str = "vip-net";
pub const VIP_SUBNET: &str = "vip-subnet";
pub const NET_B: &str = "net-b";
pub const SUBNET_B: &str = "subnet-b";
pub const NET_C: &str = "net-c";
pub const SUBNET_C: &str = "subnet-c";
pub const LB_ID: &str = "lb-1";

pub fn subnet(id: &str, network_id: &str, cidr: &str) -> Subnet {
    Subnet {
        id: id.to_string(),
        network_id: network_id.to_string(),
        cidr: cidr.parse().ok(),
        ..Default::default()
    }
}

pub fn member(id: &str, subnet_id: &str) -> Member {
    Member {
        id: id.to_string(),
        subnet_id: Some(subnet_id.to_string()),
        ..Default::default()
    }
}

/// Seeded driver, repository and services.
pub struct Fixture {
    pub driver: Arc<InMemoryDriver>,
    pub repo: Arc<SqliteRepository>,
    pub services: Services,
    pub lb: LoadBalancer,
}

impl Fixture {
    pub async fn new() -> Result<Self> {
        Self::with_security_groups(false).await
    }

    pub async fn with_security_groups(enabled: bool) -> Result<Self> {
        let driver = Arc::new(InMemoryDriver::new().with_security_groups(enabled));
        driver.add_subnet(subnet("mgmt-subnet", MGMT_NET, "192.168.0.0/24"));
        driver.add_subnet(subnet(VIP_SUBNET, VIP_NET, "10.0.0.0/24"));
        driver.add_subnet(subnet(SUBNET_B, NET_B, "10.0.1.0/24"));
        driver.add_subnet(subnet(SUBNET_C, NET_C, "10.0.2.0/24"));

        let mut amphorae = Vec::new();
        for (amp_id, compute_id) in [("amp-1", "vm-1"), ("amp-2", "vm-2")] {
            driver.add_instance(compute_id);
            let mgmt = driver.seed_interface(
                compute_id,
                &Interface {
                    network_id: MGMT_NET.to_string(),
                    fixed_ips: vec![FixedIp::for_subnet("mgmt-subnet")],
                    ..Default::default()
                },
            )?;
            amphorae.push(Amphora {
                id: amp_id.to_string(),
                load_balancer_id: Some(LB_ID.to_string()),
                compute_id: Some(compute_id.to_string()),
                status: AmphoraStatus::Allocated,
                lb_network_ip: mgmt.fixed_ips.first().and_then(|ip| ip.ip_address),
                ..Default::default()
            });
        }

        let lb = LoadBalancer {
            id: LB_ID.to_string(),
            vip: Vip {
                subnet_id: VIP_SUBNET.to_string(),
                network_id: VIP_NET.to_string(),
                ..Default::default()
            },
            pools: vec![Pool {
                id: "pool-1".to_string(),
                members: vec![member("m1", SUBNET_B)],
            }],
            amphorae,
            ..Default::default()
        };

        let repo = Arc::new(SqliteRepository::in_memory().await?);
        repo.put_load_balancer(&lb).await?;
        let services = Services::new(driver.clone(), repo.clone());

        Ok(Self {
            driver,
            repo,
            services,
            lb,
        })
    }

    pub fn amphora(&self, id: &str) -> Amphora {
        self.lb
            .amphorae
            .iter()
            .find(|amp| amp.id == id)
            .cloned()
            .unwrap_or_default()
    }

    /// Persist a modified load balancer.
    pub async fn save(&mut self, lb: LoadBalancer) -> Result<()> {
        self.repo.put_load_balancer(&lb).await?;
        self.lb = lb;
        Ok(())
    }
}
