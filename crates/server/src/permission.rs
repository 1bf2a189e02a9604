//! Permission gate: tool calls that need human sign-off.
//!
//! At most one open request per turn. Resolution is exactly-once: a second
//! resolve for the same id is an error and changes nothing.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use thiserror::Error;

use opta_protocol::{new_prefixed_id, PermissionDecision, PermissionRequest};

pub const SYSTEM_CANCEL: &str = "system:cancel";
pub const SYSTEM_TURN_ENDED: &str = "system:turn-ended";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("permission request {0} not found")]
    NotFound(String),
    #[error("permission request {0} was already resolved")]
    AlreadyResolved(String),
    #[error("turn {0} already has an open permission request")]
    AlreadyOpen(String),
}

impl GateError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "permission-not-found",
            Self::AlreadyResolved(_) => "permission-already-resolved",
            Self::AlreadyOpen(_) => "permission-already-open",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub request: PermissionRequest,
    pub decision: PermissionDecision,
    pub decided_by: String,
}

#[derive(Debug, Default)]
pub struct PermissionGate {
    open: HashMap<String, PermissionRequest>,
    resolved: HashSet<String>,
}

impl PermissionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a request for `call_id` on `turn_id`.
    pub fn request(
        &mut self,
        turn_id: &str,
        call_id: &str,
        tool_name: &str,
        arguments: Value,
        now: u64,
    ) -> Result<PermissionRequest, GateError> {
        if self.open.values().any(|r| r.turn_id == turn_id) {
            return Err(GateError::AlreadyOpen(turn_id.to_string()));
        }
        let request = PermissionRequest {
            request_id: new_prefixed_id("perm"),
            turn_id: turn_id.to_string(),
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            arguments,
            requested_at: now,
        };
        self.open
            .insert(request.request_id.clone(), request.clone());
        Ok(request)
    }

    pub fn resolve(
        &mut self,
        request_id: &str,
        decision: PermissionDecision,
        decided_by: &str,
    ) -> Result<Resolution, GateError> {
        if self.resolved.contains(request_id) {
            return Err(GateError::AlreadyResolved(request_id.to_string()));
        }
        let request = self
            .open
            .remove(request_id)
            .ok_or_else(|| GateError::NotFound(request_id.to_string()))?;
        self.resolved.insert(request_id.to_string());
        Ok(Resolution {
            request,
            decision,
            decided_by: decided_by.to_string(),
        })
    }

    /// Deny whatever is open for `turn_id` on behalf of the daemon.
    pub fn force_deny_for_turn(&mut self, turn_id: &str, decided_by: &str) -> Option<Resolution> {
        let request_id = self
            .open
            .values()
            .find(|r| r.turn_id == turn_id)
            .map(|r| r.request_id.clone())?;
        self.resolve(&request_id, PermissionDecision::Deny, decided_by)
            .ok()
    }

    pub fn is_open(&self, request_id: &str) -> bool {
        self.open.contains_key(request_id)
    }

    pub fn was_resolved(&self, request_id: &str) -> bool {
        self.resolved.contains(request_id)
    }

    pub fn open_for_turn(&self, turn_id: &str) -> Option<&PermissionRequest> {
        self.open.values().find(|r| r.turn_id == turn_id)
    }

    pub fn pending(&self) -> Option<&PermissionRequest> {
        self.open.values().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_then_resolve_once() {
        let mut gate = PermissionGate::new();
        let req = gate
            .request("t-1", "call-0", "shell", json!({"cmd": "ls"}), 10)
            .unwrap();
        assert!(req.request_id.starts_with("perm-"));
        assert_eq!(gate.open_for_turn("t-1").map(|r| r.call_id.as_str()), Some("call-0"));

        let resolution = gate
            .resolve(&req.request_id, PermissionDecision::Allow, "user:matt")
            .unwrap();
        assert_eq!(resolution.decision, PermissionDecision::Allow);
        assert!(gate.open_for_turn("t-1").is_none());

        assert_eq!(
            gate.resolve(&req.request_id, PermissionDecision::Deny, "user:other"),
            Err(GateError::AlreadyResolved(req.request_id.clone()))
        );
    }

    #[test]
    fn unknown_request_is_not_found() {
        let mut gate = PermissionGate::new();
        let err = gate
            .resolve("perm-missing", PermissionDecision::Allow, "u")
            .unwrap_err();
        assert_eq!(err.code(), "permission-not-found");
    }

    #[test]
    fn one_open_request_per_turn() {
        let mut gate = PermissionGate::new();
        gate.request("t-1", "call-0", "shell", json!({}), 1).unwrap();
        assert_eq!(
            gate.request("t-1", "call-1", "shell", json!({}), 2),
            Err(GateError::AlreadyOpen("t-1".into()))
        );
        assert!(gate.request("t-2", "call-0", "shell", json!({}), 3).is_ok());
    }

    #[test]
    fn cancel_force_denies_as_system() {
        let mut gate = PermissionGate::new();
        let req = gate.request("t-1", "call-0", "write_file", json!({}), 1).unwrap();

        let resolution = gate.force_deny_for_turn("t-1", SYSTEM_CANCEL).unwrap();
        assert_eq!(resolution.request.request_id, req.request_id);
        assert_eq!(resolution.decision, PermissionDecision::Deny);
        assert_eq!(resolution.decided_by, SYSTEM_CANCEL);

        // A late user decision is rejected.
        assert!(matches!(
            gate.resolve(&req.request_id, PermissionDecision::Allow, "user"),
            Err(GateError::AlreadyResolved(_))
        ));
        assert!(gate.force_deny_for_turn("t-1", SYSTEM_CANCEL).is_none());
    }
}
