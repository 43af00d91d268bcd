use crate::target::TunnelDestination;
use std::net::SocketAddr;
use std::sync::Arc;

/// Identity of a local peer asking for a tunnel session.
#[derive(Debug, Clone)]
pub struct CallerContext {
    pub peer_addr: SocketAddr,
}

impl CallerContext {
    pub fn new(peer_addr: SocketAddr) -> Self {
        Self { peer_addr }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny { reason: String },
}

impl PolicyDecision {
    pub fn deny(reason: &str) -> Self {
        PolicyDecision::Deny {
            reason: reason.to_owned(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, PolicyDecision::Allow)
    }
}

/// Decides whether a caller may open a tunnel session to a destination.
/// Evaluated once per accepted connection, before any relay I/O happens.
/// Implementations must be pure and side-effect free.
pub trait RelayPolicy: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(&self, caller: &CallerContext, destination: &TunnelDestination) -> PolicyDecision;
}

/// Admits every caller. For trusted single-user scenarios.
#[derive(Debug, Default)]
pub struct AllowAll;

impl RelayPolicy for AllowAll {
    fn name(&self) -> &str {
        "allow-all"
    }

    fn evaluate(&self, _caller: &CallerContext, _destination: &TunnelDestination) -> PolicyDecision {
        PolicyDecision::Allow
    }
}

/// Admits only callers connecting from a loopback address.
#[derive(Debug, Default)]
pub struct LoopbackOnly;

impl RelayPolicy for LoopbackOnly {
    fn name(&self) -> &str {
        "loopback-only"
    }

    fn evaluate(&self, caller: &CallerContext, _destination: &TunnelDestination) -> PolicyDecision {
        if caller.peer_addr.ip().is_loopback() {
            PolicyDecision::Allow
        } else {
            PolicyDecision::deny("caller is not on a loopback address")
        }
    }
}

/// Requires every member policy to allow; the first denial wins.
pub struct CompositePolicy {
    name: String,
    members: Vec<Arc<dyn RelayPolicy>>,
}

impl CompositePolicy {
    pub fn new(name: &str, members: Vec<Arc<dyn RelayPolicy>>) -> Self {
        Self {
            name: name.to_owned(),
            members,
        }
    }
}

impl RelayPolicy for CompositePolicy {
    fn name(&self) -> &str {
        self.name.as_str()
    }

    fn evaluate(&self, caller: &CallerContext, destination: &TunnelDestination) -> PolicyDecision {
        for member in &self.members {
            if let PolicyDecision::Deny { reason } = member.evaluate(caller, destination) {
                return PolicyDecision::Deny {
                    reason: format!("{}: {}", member.name(), reason),
                };
            }
        }
        PolicyDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn destination() -> TunnelDestination {
        TunnelDestination::new("project", "zone", "instance", 22)
    }

    fn caller(addr: &str) -> CallerContext {
        CallerContext::new(addr.parse().unwrap())
    }

    #[test]
    fn allow_all_admits_everyone() {
        let policy = AllowAll;
        assert!(
            policy
                .evaluate(&caller("10.0.0.1:1000"), &destination())
                .is_allowed()
        );
    }

    #[test]
    fn loopback_only_rejects_remote_callers() {
        let policy = LoopbackOnly;
        assert!(
            policy
                .evaluate(&caller("127.0.0.1:1000"), &destination())
                .is_allowed()
        );
        assert!(
            !policy
                .evaluate(&caller("192.168.1.5:1000"), &destination())
                .is_allowed()
        );
    }

    #[test]
    fn composite_reports_the_denying_member() {
        let policy = CompositePolicy::new(
            "strict",
            vec![Arc::new(AllowAll), Arc::new(LoopbackOnly)],
        );
        let decision = policy.evaluate(&caller("192.168.1.5:1000"), &destination());
        let PolicyDecision::Deny { reason } = decision else {
            panic!("expected a denial");
        };
        assert!(reason.starts_with("loopback-only:"));
    }
}
