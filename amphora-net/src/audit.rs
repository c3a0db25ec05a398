//! Audit trail for network resource lifecycle.
//!
//! Events go through tracing with `target: "audit"`, a `component` field and
//! the ids of the objects involved, so they can be filtered and shipped
//! separately from operational logs.

use std::sync::Arc;

/// Severity of an audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditLevel {
    Audit,
    Warn,
    Error,
}

/// Audit logger for one component.
#[derive(Debug, Clone)]
pub struct AuditLog {
    component: String,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new("amphora-net")
    }
}

impl AuditLog {
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
        }
    }

    pub fn shared(component: &str) -> Arc<Self> {
        Arc::new(Self::new(component))
    }

    pub fn log(&self, level: AuditLevel, message: impl Into<String>, object_ids: &[&str]) {
        let message = message.into();
        match level {
            AuditLevel::Audit => {
                tracing::info!(target: "audit", component = %self.component, objects = ?object_ids, "{}", message)
            }
            AuditLevel::Warn => {
                tracing::warn!(target: "audit", component = %self.component, objects = ?object_ids, "{}", message)
            }
            AuditLevel::Error => {
                tracing::error!(target: "audit", component = %self.component, objects = ?object_ids, "{}", message)
            }
        }
    }

    pub fn port_created(&self, port_id: &str, network_id: &str, amphora_id: Option<&str>) {
        let msg = format!("Port created on network {}", network_id);
        match amphora_id {
            Some(amp) => self.log(AuditLevel::Audit, msg, &[port_id, amp]),
            None => self.log(AuditLevel::Audit, msg, &[port_id]),
        }
    }

    pub fn port_deleted(&self, port_id: &str) {
        self.log(AuditLevel::Audit, "Port deleted", &[port_id]);
    }

    /// A port given up on after the retry budget ran out. The owning
    /// operation still reports success.
    pub fn port_abandoned(&self, port_id: &str, reason: &str) {
        let msg = format!("Port abandoned, manual cleanup required: {}", reason);
        self.log(AuditLevel::Warn, msg, &[port_id]);
    }

    pub fn vip_allocated(&self, lb_id: &str, port_id: &str) {
        self.log(AuditLevel::Audit, "VIP allocated", &[lb_id, port_id]);
    }

    pub fn vip_deallocated(&self, lb_id: &str, port_id: &str) {
        self.log(AuditLevel::Audit, "VIP deallocated", &[lb_id, port_id]);
    }

    pub fn member_port_recorded(&self, amphora_id: &str, port_id: &str) {
        self.log(AuditLevel::Audit, "Member port binding recorded", &[amphora_id, port_id]);
    }

    pub fn member_port_removed(&self, amphora_id: &str, port_id: &str) {
        self.log(AuditLevel::Audit, "Member port binding removed", &[amphora_id, port_id]);
    }

    /// A resource that a failed compensation left in use.
    pub fn resource_leaked(&self, kind: &str, id: &str, reason: &str) {
        let msg = format!("{} left in use after failed revert: {}", kind, reason);
        self.log(AuditLevel::Error, msg, &[id]);
    }
}
