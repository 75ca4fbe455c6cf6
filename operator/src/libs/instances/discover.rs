//! Resolves asynchronously created VMs back to their VPSie id
//!
//! Some create calls are accepted without an id. The discoverer scans the
//! providers VM list for the newest running VM whose hostname grew out of the
//! instance name, falling back to matching a Kubernetes nodes addresses
//! against the VMs IP.

use chrono::prelude::*;
use chrono::Duration;
use itertools::Itertools;
use k8s_openapi::api::core::v1::Node;
use vpsie_autoscaler::client::{VmStatus, VmSummary};
use vpsie_autoscaler::models::labels;
use vpsie_autoscaler::Error;

use super::super::k8s::Nodes;
use super::super::Shared;

/// The outcome of one discovery attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Discovery {
    /// The VM backing this instance was found
    Found(VmSummary),
    /// No VM matched yet, try again later
    NotFound,
    /// The discovery window expired, the instance is lost
    TimedOut,
}

/// Match an instance against the providers VM list
///
/// # Arguments
///
/// * `name` - The name of the instance being resolved
/// * `created_at` - When the instance was created
/// * `window` - How long discovery may keep trying
/// * `now` - The current time
/// * `vms` - The VM list to match against
/// * `nodes` - The cluster nodes for IP fallback matching
pub fn match_vm(
    name: &str,
    created_at: DateTime<Utc>,
    window: Duration,
    now: DateTime<Utc>,
    vms: Vec<VmSummary>,
    nodes: &[Node],
) -> Discovery {
    // past the window this instance is never going to resolve
    if now - created_at > window {
        return Discovery::TimedOut;
    }
    // only running VMs are worth matching, newest first with ids as ties
    let candidates = vms
        .into_iter()
        .filter(|vm| vm.status == VmStatus::Running)
        .sorted_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
    for vm in candidates {
        // VPSie derives the hostname from the requested name
        if vm.hostname.starts_with(name) {
            return Discovery::Found(vm);
        }
        // otherwise try to match through a nodes addresses
        if let Some(ip) = vm.ip.clone() {
            if let Some(node) = nodes.iter().find(|node| Nodes::has_ip(node, &ip)) {
                // a node claimed by another instance is not ours
                match labels::claimed_by(&node.metadata) {
                    Some(claimed) if claimed != name => continue,
                    _ => return Discovery::Found(vm),
                }
            }
        }
    }
    Discovery::NotFound
}

/// Run one discovery attempt against the live provider
///
/// # Arguments
///
/// * `shared` - The shared reconciler state
/// * `name` - The name of the instance being resolved
/// * `created_at` - When the instance was created
/// * `window` - How long discovery may keep trying
pub async fn discover(
    shared: &Shared,
    name: &str,
    created_at: DateTime<Utc>,
    window: Duration,
) -> Result<Discovery, Error> {
    let vms = shared.provider.list_vms(&shared.shutdown).await?;
    let nodes = Nodes::new(&shared.client).list(&[]).await?;
    Ok(match_vm(name, created_at, window, Utc::now(), vms, &nodes.items))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeStatus};

    /// Build a VM summary
    fn vm(id: i64, hostname: &str, ip: Option<&str>, status: VmStatus, age_secs: i64) -> VmSummary {
        VmSummary {
            id,
            hostname: hostname.to_owned(),
            ip: ip.map(str::to_owned),
            status,
            created_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    /// Build a node with an internal IP and an optional claim label
    fn node(name: &str, ip: &str, claimed: Option<&str>) -> Node {
        let mut labels = std::collections::BTreeMap::new();
        if let Some(instance) = claimed {
            labels.insert(labels::VPSIE_NODE.to_owned(), instance.to_owned());
        }
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_owned()),
                labels: Some(labels),
                ..Default::default()
            },
            status: Some(NodeStatus {
                addresses: Some(vec![NodeAddress {
                    type_: "InternalIP".to_owned(),
                    address: ip.to_owned(),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// A one hour window that has not expired
    fn window() -> Duration {
        Duration::seconds(900)
    }

    #[test]
    fn hostnames_grown_from_the_instance_name_match() {
        let vms = vec![vm(42, "pool-a-1f2e3d4c-kworker", Some("10.0.0.5"), VmStatus::Running, 30)];
        let found = match_vm("pool-a-1f2e3d4c", Utc::now(), window(), Utc::now(), vms, &[]);
        match found {
            Discovery::Found(vm) => assert_eq!(vm.id, 42),
            other => panic!("expected a match, got {other:?}"),
        }
    }

    #[test]
    fn non_running_vms_are_ignored() {
        let vms = vec![vm(42, "pool-a-1f2e3d4c-kworker", None, VmStatus::Creating, 30)];
        let result = match_vm("pool-a-1f2e3d4c", Utc::now(), window(), Utc::now(), vms, &[]);
        assert_eq!(result, Discovery::NotFound);
    }

    #[test]
    fn newest_vm_wins_when_several_match() {
        let vms = vec![
            vm(41, "pool-a-ffff0000-old", None, VmStatus::Running, 500),
            vm(42, "pool-a-ffff0000-new", None, VmStatus::Running, 10),
        ];
        let found = match_vm("pool-a-ffff0000", Utc::now(), window(), Utc::now(), vms, &[]);
        match found {
            Discovery::Found(vm) => assert_eq!(vm.id, 42),
            other => panic!("expected a match, got {other:?}"),
        }
    }

    #[test]
    fn ip_fallback_respects_existing_claims() {
        // the hostname does not match so only the IP path remains
        let vms = vec![vm(7, "unrelated-host", Some("10.0.0.9"), VmStatus::Running, 30)];
        // a node claimed by someone else blocks the match
        let taken = [node("n1", "10.0.0.9", Some("other-instance"))];
        let result = match_vm("pool-a-aaaa1111", Utc::now(), window(), Utc::now(), vms.clone(), &taken);
        assert_eq!(result, Discovery::NotFound);
        // an unclaimed node lets it through
        let free = [node("n1", "10.0.0.9", None)];
        let found = match_vm("pool-a-aaaa1111", Utc::now(), window(), Utc::now(), vms, &free);
        assert!(matches!(found, Discovery::Found(vm) if vm.id == 7));
    }

    #[test]
    fn empty_listings_time_out_only_past_the_window() {
        let created = Utc::now() - Duration::seconds(60);
        let result = match_vm("pool-a-bbbb2222", created, window(), Utc::now(), Vec::new(), &[]);
        assert_eq!(result, Discovery::NotFound);
        let created = Utc::now() - Duration::seconds(901);
        let result = match_vm("pool-a-bbbb2222", created, window(), Utc::now(), Vec::new(), &[]);
        assert_eq!(result, Discovery::TimedOut);
    }
}
