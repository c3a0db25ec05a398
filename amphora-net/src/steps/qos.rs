//! QoS propagation onto amphora VRRP ports.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::Services;
use crate::error::{NetworkError, Result};
use crate::model::{Amphora, LoadBalancer};
use crate::step::{Step, StepContext};

/// Requested changes to a load balancer, as far as QoS is concerned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerUpdate {
    #[serde(default)]
    pub vip: Option<VipUpdate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VipUpdate {
    /// `Some(None)` clears the policy; `None` leaves QoS untouched.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "serde_with::rust::double_option"
    )]
    pub qos_policy_id: Option<Option<String>>,
}

impl LoadBalancerUpdate {
    pub fn touches_qos(&self) -> bool {
        self.vip
            .as_ref()
            .is_some_and(|vip| vip.qos_policy_id.is_some())
    }

    /// Policy id explicitly set by the update.
    fn requested_qos(&self) -> Option<&str> {
        self.vip
            .as_ref()
            .and_then(|vip| vip.qos_policy_id.as_ref())
            .and_then(|id| id.as_deref())
    }
}

async fn apply_on_vrrp_port(
    services: &Services,
    amphora: &Amphora,
    qos_policy_id: Option<&str>,
) -> Result<()> {
    let Some(port_id) = amphora.vrrp_port_id.as_deref() else {
        debug!("Amphora {} has no VRRP port, skipping QoS", amphora.id);
        return Ok(());
    };
    debug!(
        "Applying QoS policy {:?} on VRRP port {} of amphora {}",
        qos_policy_id, port_id, amphora.id
    );
    services.driver.apply_qos_on_port(qos_policy_id, port_id).await
}

pub struct ApplyQosInput {
    /// Load balancer as seen by the request.
    pub load_balancer: LoadBalancer,
    /// Amphorae to update; the persisted ones when absent.
    pub amphorae: Option<Vec<Amphora>>,
    pub update: Option<LoadBalancerUpdate>,
}

/// Applies the VIP QoS policy to the VRRP ports of every allocated amphora.
pub struct ApplyQos {
    services: Services,
}

impl ApplyQos {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    async fn allocated_amphorae(&self, input: &ApplyQosInput) -> Result<Vec<Amphora>> {
        let amphorae = match &input.amphorae {
            Some(amphorae) => amphorae.clone(),
            None => {
                self.services
                    .load_balancer(&input.load_balancer.id)
                    .await?
                    .amphorae
            }
        };
        Ok(amphorae.into_iter().filter(|amp| amp.is_allocated()).collect())
    }
}

#[async_trait]
impl Step for ApplyQos {
    type Input = ApplyQosInput;
    type Output = ();

    fn name(&self) -> &'static str {
        "apply-qos"
    }

    async fn execute(&self, _ctx: &StepContext, input: &ApplyQosInput) -> Result<()> {
        let db_lb = self.services.load_balancer(&input.load_balancer.id).await?;
        let mut qos_policy_id = db_lb.vip.qos_policy_id;

        let touches_qos = input.update.as_ref().is_some_and(|u| u.touches_qos());
        if qos_policy_id.is_none() && !touches_qos {
            debug!("No QoS policy for load balancer {}", input.load_balancer.id);
            return Ok(());
        }
        if let Some(requested) = input.update.as_ref().and_then(|u| u.requested_qos()) {
            qos_policy_id = Some(requested.to_string());
        }

        for amphora in self.allocated_amphorae(input).await? {
            apply_on_vrrp_port(&self.services, &amphora, qos_policy_id.as_deref()).await?;
        }
        Ok(())
    }

    async fn revert(&self, _ctx: &StepContext, input: &ApplyQosInput, _output: &()) {
        let request_qos_id = input.load_balancer.vip.qos_policy_id.as_deref();
        let orig_qos_id = match self.services.load_balancer(&input.load_balancer.id).await {
            Ok(lb) => lb.vip.qos_policy_id,
            Err(e) => {
                warn!(
                    "Failed to read load balancer {} to undo QoS policy {:?}: {}",
                    input.load_balancer.id, request_qos_id, e
                );
                return;
            }
        };
        if request_qos_id == orig_qos_id.as_deref() {
            return;
        }
        let amphorae = match self.allocated_amphorae(input).await {
            Ok(amphorae) => amphorae,
            Err(e) => {
                warn!(
                    "Failed to list amphorae of load balancer {} to undo QoS policy {:?}: {}",
                    input.load_balancer.id, request_qos_id, e
                );
                return;
            }
        };
        for amphora in &amphorae {
            if let Err(e) = apply_on_vrrp_port(&self.services, amphora, orig_qos_id.as_deref()).await
            {
                warn!(
                    "Failed to undo QoS policy {:?} on the VRRP port of amphora {}: {}",
                    request_qos_id, amphora.id, e
                );
            }
        }
    }
}

pub struct ApplyQosOnAmphoraInput {
    pub load_balancer: LoadBalancer,
    pub amphora: Amphora,
    pub update: Option<LoadBalancerUpdate>,
}

/// Applies the requested VIP QoS policy to one amphora's VRRP port.
pub struct ApplyQosOnAmphora {
    services: Services,
}

impl ApplyQosOnAmphora {
    pub fn new(services: Services) -> Self {
        Self { services }
    }
}

#[async_trait]
impl Step for ApplyQosOnAmphora {
    type Input = ApplyQosOnAmphoraInput;
    type Output = ();

    fn name(&self) -> &'static str {
        "apply-qos-amphora"
    }

    async fn execute(&self, _ctx: &StepContext, input: &Self::Input) -> Result<()> {
        let qos_policy_id = input.load_balancer.vip.qos_policy_id.as_deref();
        let skip = qos_policy_id.is_none()
            && input.update.as_ref().is_some_and(|u| !u.touches_qos());
        if skip {
            return Ok(());
        }
        apply_on_vrrp_port(&self.services, &input.amphora, qos_policy_id).await
    }

    async fn revert(&self, _ctx: &StepContext, input: &Self::Input, _output: &()) {
        let request_qos_id = input.load_balancer.vip.qos_policy_id.as_deref();
        let undo = async {
            let orig = self.services.load_balancer(&input.load_balancer.id).await?;
            let orig_qos_id = orig.vip.qos_policy_id.as_deref();
            if request_qos_id != orig_qos_id {
                apply_on_vrrp_port(&self.services, &input.amphora, orig_qos_id).await?;
            }
            Ok::<_, NetworkError>(())
        };
        if let Err(e) = undo.await {
            error!(
                "Failed to remove QoS policy {:?} from port {:?} of amphora {} due to error: {}",
                request_qos_id, input.amphora.vrrp_port_id, input.amphora.id, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{CreatePortRequest, NetworkDriver};
    use crate::test_util::{Fixture, VIP_NET};

    /// Gives both amphorae a VRRP port and persists the policy.
    async fn with_vrrp_ports(qos: Option<&str>) -> Fixture {
        let mut fx = Fixture::new().await.unwrap();
        let mut lb = fx.lb.clone();
        lb.vip.qos_policy_id = qos.map(str::to_string);
        for amp in &mut lb.amphorae {
            let port = fx
                .driver
                .create_port(CreatePortRequest::new(VIP_NET, format!("vrrp-{}", amp.id)))
                .await
                .unwrap();
            amp.vrrp_port_id = Some(port.id);
        }
        fx.save(lb).await.unwrap();
        fx
    }

    fn qos_update(id: Option<&str>) -> Option<LoadBalancerUpdate> {
        Some(LoadBalancerUpdate {
            vip: Some(VipUpdate {
                qos_policy_id: Some(id.map(str::to_string)),
            }),
        })
    }

    fn vrrp_qos(fx: &Fixture, amp_id: &str) -> Option<String> {
        let port_id = fx.amphora(amp_id).vrrp_port_id.unwrap();
        fx.driver.port(&port_id).unwrap().qos_policy_id
    }

    #[tokio::test]
    async fn test_apply_qos_skips_without_policy() {
        let fx = with_vrrp_ports(None).await;
        let input = ApplyQosInput {
            load_balancer: fx.lb.clone(),
            amphorae: None,
            update: Some(LoadBalancerUpdate::default()),
        };

        ApplyQos::new(fx.services.clone())
            .execute(&StepContext::new(), &input)
            .await
            .unwrap();
        assert!(fx.driver.calls_to("apply_qos_on_port").is_empty());
    }

    #[tokio::test]
    async fn test_apply_qos_uses_update_over_persisted() {
        let fx = with_vrrp_ports(Some("qos-old")).await;
        let input = ApplyQosInput {
            load_balancer: fx.lb.clone(),
            amphorae: None,
            update: qos_update(Some("qos-new")),
        };

        ApplyQos::new(fx.services.clone())
            .execute(&StepContext::new(), &input)
            .await
            .unwrap();
        assert_eq!(vrrp_qos(&fx, "amp-1").as_deref(), Some("qos-new"));
        assert_eq!(vrrp_qos(&fx, "amp-2").as_deref(), Some("qos-new"));
    }

    #[tokio::test]
    async fn test_apply_qos_clearing_update_applies_persisted() {
        let fx = with_vrrp_ports(Some("qos-old")).await;
        let input = ApplyQosInput {
            load_balancer: fx.lb.clone(),
            amphorae: Some(vec![fx.amphora("amp-1")]),
            update: qos_update(None),
        };

        ApplyQos::new(fx.services.clone())
            .execute(&StepContext::new(), &input)
            .await
            .unwrap();
        assert_eq!(vrrp_qos(&fx, "amp-1").as_deref(), Some("qos-old"));
        assert_eq!(fx.driver.calls_to("apply_qos_on_port").len(), 1);
    }

    #[tokio::test]
    async fn test_apply_qos_revert_restores_persisted_policy() {
        let fx = with_vrrp_ports(Some("qos-old")).await;
        let mut request = fx.lb.clone();
        request.vip.qos_policy_id = Some("qos-new".to_string());
        let input = ApplyQosInput {
            load_balancer: request,
            amphorae: None,
            update: qos_update(Some("qos-new")),
        };
        let step = ApplyQos::new(fx.services.clone());
        let ctx = StepContext::new();

        step.execute(&ctx, &input).await.unwrap();
        step.revert(&ctx, &input, &()).await;
        assert_eq!(vrrp_qos(&fx, "amp-1").as_deref(), Some("qos-old"));
        assert_eq!(vrrp_qos(&fx, "amp-2").as_deref(), Some("qos-old"));
    }

    #[tokio::test]
    async fn test_apply_qos_revert_continues_past_failed_amphora() {
        let fx = with_vrrp_ports(Some("qos-old")).await;
        let mut request = fx.lb.clone();
        request.vip.qos_policy_id = Some("qos-new".to_string());
        let input = ApplyQosInput {
            load_balancer: request,
            amphorae: None,
            update: qos_update(Some("qos-new")),
        };
        let step = ApplyQos::new(fx.services.clone());
        let ctx = StepContext::new();

        step.execute(&ctx, &input).await.unwrap();
        fx.driver
            .inject_fault("apply_qos_on_port", 1, || NetworkError::Driver("down".into()));
        step.revert(&ctx, &input, &()).await;

        assert_eq!(vrrp_qos(&fx, "amp-1").as_deref(), Some("qos-new"));
        assert_eq!(vrrp_qos(&fx, "amp-2").as_deref(), Some("qos-old"));
        assert_eq!(fx.driver.calls_to("apply_qos_on_port").len(), 4);
    }

    #[test]
    fn test_explicit_null_policy_touches_qos() {
        let clear: LoadBalancerUpdate =
            serde_json::from_str(r#"{"vip": {"qos_policy_id": null}}"#).unwrap();
        assert!(clear.touches_qos());
        assert_eq!(clear, qos_update(None).unwrap());
        assert_eq!(clear.requested_qos(), None);

        let untouched: LoadBalancerUpdate = serde_json::from_str(r#"{"vip": {}}"#).unwrap();
        assert!(!untouched.touches_qos());

        let roundtrip: LoadBalancerUpdate =
            serde_json::from_str(&serde_json::to_string(&clear).unwrap()).unwrap();
        assert_eq!(roundtrip, clear);
        assert_eq!(serde_json::to_string(&untouched).unwrap(), r#"{"vip":{}}"#);
    }

    #[tokio::test]
    async fn test_apply_qos_revert_noop_when_unchanged() {
        let fx = with_vrrp_ports(Some("qos-old")).await;
        let input = ApplyQosInput {
            load_balancer: fx.lb.clone(),
            amphorae: None,
            update: None,
        };

        ApplyQos::new(fx.services.clone())
            .revert(&StepContext::new(), &input, &())
            .await;
        assert!(fx.driver.calls_to("apply_qos_on_port").is_empty());
    }

    #[tokio::test]
    async fn test_apply_qos_on_amphora() {
        let fx = with_vrrp_ports(None).await;
        let mut request = fx.lb.clone();
        request.vip.qos_policy_id = Some("qos-1".to_string());
        let input = ApplyQosOnAmphoraInput {
            load_balancer: request,
            amphora: fx.amphora("amp-2"),
            update: None,
        };
        let step = ApplyQosOnAmphora::new(fx.services.clone());
        let ctx = StepContext::new();

        step.execute(&ctx, &input).await.unwrap();
        assert_eq!(vrrp_qos(&fx, "amp-2").as_deref(), Some("qos-1"));
        assert_eq!(vrrp_qos(&fx, "amp-1"), None);

        fx.driver
            .inject_fault("apply_qos_on_port", 1, || NetworkError::Driver("down".into()));
        step.revert(&ctx, &input, &()).await;
        assert_eq!(vrrp_qos(&fx, "amp-2").as_deref(), Some("qos-1"));

        step.revert(&ctx, &input, &()).await;
        assert_eq!(vrrp_qos(&fx, "amp-2"), None);
    }

    #[tokio::test]
    async fn test_apply_qos_on_amphora_skips_unrelated_update() {
        let fx = with_vrrp_ports(None).await;
        let input = ApplyQosOnAmphoraInput {
            load_balancer: fx.lb.clone(),
            amphora: fx.amphora("amp-1"),
            update: Some(LoadBalancerUpdate {
                vip: Some(VipUpdate::default()),
            }),
        };

        ApplyQosOnAmphora::new(fx.services.clone())
            .execute(&StepContext::new(), &input)
            .await
            .unwrap();
        assert!(fx.driver.calls_to("apply_qos_on_port").is_empty());
    }
}
