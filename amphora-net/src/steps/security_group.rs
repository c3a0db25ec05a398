//! VIP security group steps. None of them revert.

use async_trait::async_trait;
use tracing::{debug, error, info};

use super::Services;
use crate::error::{NetworkError, Result};
use crate::model::vip_security_group_name;
use crate::step::{Step, StepContext};

/// Recomputes the VIP security group; returns its id when managed.
pub struct UpdateVipSecurityGroup {
    services: Services,
}

impl UpdateVipSecurityGroup {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for UpdateVipSecurityGroup {
    type Input = String;
    type Output = Option<String>;

    fn name(&self) -> &'static str {
        "update-vip-security-group"
    }

    async fn execute(&self, _ctx: &StepContext, lb_id: &String) -> Result<Option<String>> {
        debug!("Setting up VIP SG for load balancer id: {}", lb_id);
        let lb = self.services.load_balancer(lb_id).await?;
        let sg_id = self.services.driver.update_vip_sg(&lb, &lb.vip).await?;
        info!(
            "Set up VIP SG {} for load balancer {} complete",
            sg_id.as_deref().unwrap_or("None"),
            lb_id
        );
        Ok(sg_id)
    }
}

/// Updates the security group of every amphora's allowed-address-pair port.
pub struct UpdateAmphoraSecurityGroup {
    services: Services,
}

impl UpdateAmphoraSecurityGroup {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for UpdateAmphoraSecurityGroup {
    type Input = String;
    type Output = ();

    fn name(&self) -> &'static str {
        "update-amphora-security-group"
    }

    async fn execute(&self, _ctx: &StepContext, lb_id: &String) -> Result<()> {
        let lb = self.services.load_balancer(lb_id).await?;
        for amphora in &lb.amphorae {
            self.services
                .driver
                .update_aap_port_sg(&lb, amphora, &lb.vip)
                .await?;
        }
        Ok(())
    }
}

/// Looks up the VIP security group by its derived name.
pub struct GetVipSecurityGroupId {
    services: Services,
}

impl GetVipSecurityGroupId {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for GetVipSecurityGroupId {
    type Input = String;
    type Output = Option<String>;

    fn name(&self) -> &'static str {
        "get-vip-security-group-id"
    }

    async fn execute(&self, _ctx: &StepContext, lb_id: &String) -> Result<Option<String>> {
        let sg_name = vip_security_group_name(lb_id);
        match self.services.driver.get_security_group(&sg_name).await {
            Ok(sg) => Ok(Some(sg.id)),
            Err(NetworkError::SecurityGroupNotFound(_))
                if !self.services.driver.sec_grp_enabled() =>
            {
                debug!(
                    "Security groups are disabled, no VIP SG for load balancer {}",
                    lb_id
                );
                Ok(None)
            }
            Err(e) => {
                if matches!(e, NetworkError::SecurityGroupNotFound(_)) {
                    error!("VIP security group {} was not found.", sg_name);
                }
                Err(e)
            }
        }
    }
}
