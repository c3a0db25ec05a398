//! VIP provisioning and retrying port teardown against the in-memory
//! substrate.
//!
//! Run with:
//!   cargo test -p amphora-net --test vip_flow

use std::sync::{Arc, Mutex};
use std::time::Duration;

use amphora_net::driver::{CreatePortRequest, NetworkDriver};
use amphora_net::retry::{Retrier, RetryPolicy};
use amphora_net::steps::port::{DeletePortInput, VipBasePortInput};
use amphora_net::steps::vip::PlugVipInput;
use amphora_net::steps::{AllocateVip, CreateVipBasePort, DeletePort, PlugVipToAmphora, PortDeletion};
use amphora_net::test_util::{Fixture, LB_ID, NET_B, VIP_SUBNET};
use amphora_net::{NetworkError, Step, StepContext};

fn retrier(max_attempts: u32) -> Retrier {
    Retrier::new(RetryPolicy {
        max_attempts,
        backoff_multiplier: 1.0,
        min_wait: Duration::from_millis(1),
        max_wait: Duration::from_millis(5),
    })
}

fn unavailable() -> NetworkError {
    NetworkError::Driver("503 Service Unavailable".into())
}

// ============================================================================
// VIP provisioning
// ============================================================================

#[tokio::test]
async fn test_vip_provisioning_rolls_back_in_reverse() {
    let mut fx = Fixture::new().await.unwrap();
    let ctx = StepContext::new();
    let lb_id = LB_ID.to_string();

    let allocate = AllocateVip::new(fx.services.clone());
    let allocated = allocate.execute(&ctx, &lb_id).await.unwrap();
    let mut lb = fx.lb.clone();
    lb.vip = allocated.vip.clone();
    fx.save(lb).await.unwrap();

    let base_port = CreateVipBasePort::new(fx.services.clone(), retrier(3));
    let base_input = VipBasePortInput {
        vip: allocated.vip.clone(),
        vip_sg_id: None,
        amphora_id: "amp-1".to_string(),
        additional_vips: allocated.additional_vips.clone(),
    };
    let port = base_port.execute(&ctx, &base_input).await.unwrap();

    let plug = PlugVipToAmphora::new(fx.services.clone());
    let plug_input = PlugVipInput {
        load_balancer_id: lb_id.clone(),
        amphora_id: "amp-1".to_string(),
        subnet_id: VIP_SUBNET.to_string(),
    };
    let amphora = plug.execute(&ctx, &plug_input).await.unwrap();
    assert_eq!(amphora.vrrp_port_id.as_deref(), Some(port.id.as_str()));
    assert!(fx.driver.plugged_port_ids("vm-1").contains(&port.id));

    // a later step failed: unwind in reverse order
    plug.revert(&ctx, &plug_input, &amphora).await;
    base_port.revert(&ctx, &base_input, &port).await;
    allocate.revert(&ctx, &lb_id, &allocated).await;

    assert_eq!(
        fx.driver.calls_to("deallocate_vip"),
        vec![allocated.vip.port_id.clone().unwrap()]
    );
    // only the management ports are left
    assert_eq!(fx.driver.ports().len(), 2);
}

#[tokio::test]
async fn test_failover_allocation_survives_rollback() {
    let fx = Fixture::new().await.unwrap();
    let ctx = StepContext::new();
    let allocate = AllocateVip::for_failover(fx.services.clone());

    let allocated = allocate.execute(&ctx, &LB_ID.to_string()).await.unwrap();
    allocate.revert(&ctx, &LB_ID.to_string(), &allocated).await;

    assert!(fx.driver.calls_to("deallocate_vip").is_empty());
    assert_eq!(fx.driver.ports().len(), 3);
}

// ============================================================================
// Retrying teardown
// ============================================================================

async fn doomed_port(fx: &Fixture) -> String {
    fx.driver
        .create_port(CreatePortRequest::new(NET_B, "doomed"))
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn test_transient_failures_are_retried_with_progress() {
    let fx = Fixture::new().await.unwrap();
    let port_id = doomed_port(&fx).await;
    fx.driver.inject_fault("delete_port", 2, unavailable);

    let progress = Arc::new(Mutex::new(Vec::new()));
    let seen = progress.clone();
    let ctx = StepContext::new().with_progress(move |p| seen.lock().unwrap().push(p));

    let outcome = DeletePort::new(fx.services.clone(), retrier(5))
        .execute(
            &ctx,
            &DeletePortInput {
                port_id: Some(port_id.clone()),
                passive_failure: false,
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome, PortDeletion::Deleted);
    assert_eq!(*progress.lock().unwrap(), vec![0.2, 0.4, 0.6]);
    assert!(fx.driver.port(&port_id).is_none());
}

#[tokio::test]
async fn test_exhausted_retries_raise() {
    let fx = Fixture::new().await.unwrap();
    let port_id = doomed_port(&fx).await;
    fx.driver.inject_fault("delete_port", 3, unavailable);

    let err = DeletePort::new(fx.services.clone(), retrier(3))
        .execute(
            &StepContext::new(),
            &DeletePortInput {
                port_id: Some(port_id.clone()),
                passive_failure: false,
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, NetworkError::Driver(_)));
    assert_eq!(fx.driver.calls_to("delete_port").len(), 3);
    assert!(fx.driver.calls_to("admin_down_port").is_empty());
}

#[tokio::test]
async fn test_passive_failure_abandons_port() {
    let fx = Fixture::new().await.unwrap();
    let port_id = doomed_port(&fx).await;
    fx.driver.inject_fault("delete_port", 3, unavailable);
    fx.driver.inject_fault("admin_down_port", 1, unavailable);

    let outcome = DeletePort::new(fx.services.clone(), retrier(3))
        .execute(
            &StepContext::new(),
            &DeletePortInput {
                port_id: Some(port_id.clone()),
                passive_failure: true,
            },
        )
        .await
        .unwrap();

    // the failing admin-down is swallowed too
    assert_eq!(outcome, PortDeletion::Abandoned);
    assert_eq!(fx.driver.calls_to("admin_down_port"), vec![port_id.clone()]);
    assert!(fx.driver.port(&port_id).is_some());
}
