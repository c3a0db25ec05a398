//! Base port, port deletion and admin-state steps.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::Services;
use crate::config::NetworkingConfig;
use crate::driver::CreatePortRequest;
use crate::error::{NetworkError, Result};
use crate::model::{
    AdditionalVip, FixedIp, Port, PortStatus, Subnet, Vip, VnicType, base_port_name,
};
use crate::retry::{Retrier, RetryOutcome};
use crate::step::{Step, StepContext};
use crate::store::StoreError;

pub struct VipBasePortInput {
    pub vip: Vip,
    /// Managed VIP security group, if security groups are enabled.
    pub vip_sg_id: Option<String>,
    pub amphora_id: String,
    pub additional_vips: Vec<AdditionalVip>,
}

/// Creates the VIP-bearing base port of an amphora.
pub struct CreateVipBasePort {
    services: Services,
    retrier: Retrier,
}

impl CreateVipBasePort {
    pub fn new(services: Services, retrier: Retrier) -> Self {
        Self { services, retrier }
    }
}

fn vip_addresses(vip: &Vip, additional_vips: &[AdditionalVip]) -> Vec<IpAddr> {
    vip.ip_address
        .into_iter()
        .chain(additional_vips.iter().filter_map(|extra| extra.ip_address))
        .collect()
}

async fn create_with_retry(
    services: &Services,
    retrier: &Retrier,
    ctx: &StepContext,
    request: CreatePortRequest,
    amphora_id: &str,
) -> Result<Port> {
    let driver = &services.driver;
    let what = format!("create port {}", request.name);
    let port = retrier
        .run(ctx, &what, move |_| driver.create_port(request.clone()))
        .await?;
    info!(
        "Created port {} on network {} for amphora {}",
        port.id, port.network_id, amphora_id
    );
    services
        .audit
        .port_created(&port.id, &port.network_id, Some(amphora_id));
    Ok(port)
}

async fn delete_created_port(services: &Services, port: &Port, amphora_id: &str) {
    warn!("Deleting port {} after failed flow", port.id);
    match services.driver.delete_port(&port.id).await {
        Ok(()) => services.audit.port_deleted(&port.id),
        Err(e) => {
            error!(
                "Failed to delete port {}. Resources may still be in use for a port intended for amphora {} due to error: {}",
                port.id, amphora_id, e
            );
            services.audit.resource_leaked("port", &port.id, &e.to_string());
        }
    }
}

#[async_trait]
impl Step for CreateVipBasePort {
    type Input = VipBasePortInput;
    type Output = Port;

    fn name(&self) -> &'static str {
        "create-vip-base-port"
    }

    async fn execute(&self, ctx: &StepContext, input: &VipBasePortInput) -> Result<Port> {
        let mut security_group_ids: Vec<String> = input.vip_sg_id.iter().cloned().collect();
        security_group_ids.extend(input.vip.sg_ids.iter().cloned());

        let request =
            CreatePortRequest::new(&input.vip.network_id, base_port_name(&input.amphora_id))
                .fixed_ips(vec![FixedIp::for_subnet(&input.vip.subnet_id)])
                .secondary_ips(vip_addresses(&input.vip, &input.additional_vips))
                .security_group_ids(security_group_ids)
                .qos_policy_id(input.vip.qos_policy_id.clone());

        create_with_retry(&self.services, &self.retrier, ctx, request, &input.amphora_id).await
    }

    async fn revert(&self, _ctx: &StepContext, input: &VipBasePortInput, output: &Port) {
        delete_created_port(&self.services, output, &input.amphora_id).await;
    }
}

pub struct SriovBasePortInput {
    pub load_balancer_id: String,
    pub amphora_id: String,
    pub subnet: Subnet,
}

/// Creates an SR-IOV (direct vnic) base port carrying the VIP addresses.
/// No security groups apply to direct ports.
pub struct CreateSriovBasePort {
    services: Services,
    retrier: Retrier,
}

impl CreateSriovBasePort {
    pub fn new(services: Services, retrier: Retrier) -> Self {
        Self { services, retrier }
    }
}

#[async_trait]
impl Step for CreateSriovBasePort {
    type Input = SriovBasePortInput;
    type Output = Port;

    fn name(&self) -> &'static str {
        "create-sriov-base-port"
    }

    async fn execute(&self, ctx: &StepContext, input: &SriovBasePortInput) -> Result<Port> {
        let lb = self.services.load_balancer(&input.load_balancer_id).await?;

        let mut secondary: Vec<IpAddr> = lb
            .additional_vips
            .iter()
            .filter_map(|extra| extra.ip_address)
            .collect();
        secondary.extend(lb.vip.ip_address);

        let request =
            CreatePortRequest::new(&input.subnet.network_id, base_port_name(&input.amphora_id))
                .fixed_ips(vec![FixedIp::for_subnet(&input.subnet.id)])
                .secondary_ips(secondary)
                .qos_policy_id(lb.vip.qos_policy_id.clone())
                .vnic_type(VnicType::Direct);

        create_with_retry(&self.services, &self.retrier, ctx, request, &input.amphora_id).await
    }

    async fn revert(&self, _ctx: &StepContext, input: &SriovBasePortInput, output: &Port) {
        delete_created_port(&self.services, output, &input.amphora_id).await;
    }
}

pub struct DeletePortInput {
    /// Nothing to do when absent.
    pub port_id: Option<String>,
    /// Abandon the port instead of failing once retries run out.
    pub passive_failure: bool,
}

/// What happened to a port handed to [`DeletePort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortDeletion {
    Skipped,
    Deleted,
    /// Retries ran out in passive mode; the port was set down and left.
    Abandoned,
}

/// Deletes a port, retrying transient failures.
pub struct DeletePort {
    services: Services,
    retrier: Retrier,
}

impl DeletePort {
    pub fn new(services: Services, retrier: Retrier) -> Self {
        Self { services, retrier }
    }
}

#[async_trait]
impl Step for DeletePort {
    type Input = DeletePortInput;
    type Output = PortDeletion;

    fn name(&self) -> &'static str {
        "delete-port"
    }

    async fn execute(&self, ctx: &StepContext, input: &DeletePortInput) -> Result<PortDeletion> {
        let Some(port_id) = input.port_id.as_deref() else {
            return Ok(PortDeletion::Skipped);
        };
        let driver = &self.services.driver;
        let what = format!("delete port {port_id}");
        let delete = move |attempt: u32| async move {
            debug!("Deleting port {} with attempt {}", port_id, attempt);
            match driver.delete_port(port_id).await {
                Err(NetworkError::PortNotFound(_)) => {
                    debug!("Port {} already gone", port_id);
                    Ok(())
                }
                other => other,
            }
        };

        if !input.passive_failure {
            self.retrier.run(ctx, &what, delete).await?;
            self.services.audit.port_deleted(port_id);
            return Ok(PortDeletion::Deleted);
        }

        let abandon = move || async move {
            info!("Setting abandoned port {} admin down", port_id);
            driver.admin_down_port(port_id).await
        };
        match self.retrier.run_passive(ctx, &what, delete, abandon).await? {
            RetryOutcome::Completed(()) => {
                self.services.audit.port_deleted(port_id);
                Ok(PortDeletion::Deleted)
            }
            RetryOutcome::Abandoned(e) => {
                warn!(
                    "Failed to delete port {}, abandoning it as passive failure is enabled",
                    port_id
                );
                self.services.audit.port_abandoned(port_id, &e.to_string());
                Ok(PortDeletion::Abandoned)
            }
        }
    }
}

pub struct MemberPortsDeletionInput {
    pub amphora_id: String,
    pub passive_failure: bool,
}

/// Deletes every member-connectivity port recorded for an amphora and drops
/// the bindings.
pub struct DeleteAmphoraMemberPorts {
    services: Services,
    delete: DeletePort,
}

impl DeleteAmphoraMemberPorts {
    pub fn new(services: Services, retrier: Retrier) -> Self {
        Self {
            delete: DeletePort::new(services.clone(), retrier),
            services,
        }
    }
}

#[async_trait]
impl Step for DeleteAmphoraMemberPorts {
    type Input = MemberPortsDeletionInput;
    type Output = Vec<PortDeletion>;

    fn name(&self) -> &'static str {
        "delete-amphora-member-ports"
    }

    async fn execute(&self, ctx: &StepContext, input: &Self::Input) -> Result<Vec<PortDeletion>> {
        let port_ids = self.services.repo.get_member_port_ids(&input.amphora_id).await?;
        let mut results = Vec::with_capacity(port_ids.len());

        for port_id in port_ids {
            let outcome = self
                .delete
                .execute(
                    ctx,
                    &DeletePortInput {
                        port_id: Some(port_id.clone()),
                        passive_failure: input.passive_failure,
                    },
                )
                .await?;
            results.push(outcome);

            match self.services.repo.delete_member_port(&port_id).await {
                Ok(()) => self
                    .services
                    .audit
                    .member_port_removed(&input.amphora_id, &port_id),
                Err(StoreError::NotFound(_)) => {
                    warn!("Member port binding {} was already removed", port_id)
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(results)
    }
}

/// Sets a port administratively down and waits for the substrate to report
/// it DOWN. Running out of polls is logged and accepted.
pub struct AdminDownPort {
    services: Services,
    max_polls: u32,
    interval: Duration,
}

impl AdminDownPort {
    pub fn new(services: Services, config: &NetworkingConfig) -> Self {
        Self {
            services,
            max_polls: config.max_retries,
            interval: config.retry_interval(),
        }
    }

    pub fn with_polling(mut self, max_polls: u32, interval: Duration) -> Self {
        self.max_polls = max_polls;
        self.interval = interval;
        self
    }
}

#[async_trait]
impl Step for AdminDownPort {
    type Input = String;
    type Output = ();

    fn name(&self) -> &'static str {
        "admin-down-port"
    }

    async fn execute(&self, ctx: &StepContext, port_id: &String) -> Result<()> {
        let driver = &self.services.driver;
        match driver.set_port_admin_state_up(port_id, false).await {
            Ok(_) => {}
            Err(NetworkError::PortNotFound(_)) => {
                info!("Port {} not found, nothing to set down", port_id);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        for poll in 1..=self.max_polls {
            ctx.report_progress(poll as f32 / self.max_polls as f32);
            let port = driver.get_port(port_id).await?;
            if port.status == PortStatus::Down {
                debug!("Port {} is DOWN", port_id);
                return Ok(());
            }
            debug!(
                "Port {} is {:?} instead of DOWN, waiting {:?}",
                port_id, port.status, self.interval
            );
            ctx.sleep(self.interval).await?;
        }

        warn!(
            "Port {} did not go DOWN after {} polls, continuing anyway",
            port_id, self.max_polls
        );
        Ok(())
    }

    async fn revert(&self, _ctx: &StepContext, port_id: &String, _output: &()) {
        if let Err(e) = self
            .services
            .driver
            .set_port_admin_state_up(port_id, true)
            .await
        {
            error!("Failed to set port {} admin up during revert: {}", port_id, e);
        }
    }
}
