//! Tests for the provider capability semantics the reconcilers lean on

use tokio_util::sync::CancellationToken;
use vpsie_autoscaler::client::{Offering, VmCreateRequest, VpsieProvider};
use vpsie_autoscaler::test_utilities::{running_vm, MockVpsie};

/// Build a minimal create request for tests
fn create_req(hostname: &str) -> VmCreateRequest {
    VmCreateRequest {
        hostname: hostname.to_owned(),
        offering_id: "m2.small".to_owned(),
        datacenter_id: "us-east-1".to_owned(),
        resource_identifier: "cluster-77".to_owned(),
        os_image_id: None,
        kubernetes_version: "v1.30.2".to_owned(),
        ssh_key_ids: Vec::new(),
        vpsie_group_id: 9,
        project: None,
    }
}

#[tokio::test]
async fn synchronous_creates_return_an_id() {
    let mock = MockVpsie::new();
    let ctx = CancellationToken::new();
    let id = mock.create_vm(&ctx, &create_req("pool-a-1f2e3d4c")).await.unwrap();
    assert!(id.is_some());
    // the VM shows up in listings under the requested hostname
    let vms = mock.list_vms(&ctx).await.unwrap();
    assert_eq!(vms.len(), 1);
    assert_eq!(vms[0].hostname, "pool-a-1f2e3d4c");
}

#[tokio::test]
async fn asynchronous_creates_return_no_id() {
    let mock = MockVpsie::new();
    mock.set_async_create(true).await;
    let ctx = CancellationToken::new();
    let id = mock.create_vm(&ctx, &create_req("pool-a-aaaa1111")).await.unwrap();
    // the caller has to go through discovery from here
    assert!(id.is_none());
    assert_eq!(mock.create_calls().await, 1);
}

#[tokio::test]
async fn deleting_twice_yields_the_same_outcome() {
    let mock = MockVpsie::new();
    mock.push_vm(running_vm(42, "pool-a-1f2e3d4c-kworker", "10.0.0.5")).await;
    let ctx = CancellationToken::new();
    // the first delete removes the VM, the second finds it already gone
    mock.delete_vm(&ctx, 42).await.unwrap();
    mock.delete_vm(&ctx, 42).await.unwrap();
    assert_eq!(mock.delete_calls().await, vec![42, 42]);
    assert!(mock.list_vms(&ctx).await.unwrap().is_empty());
}

#[tokio::test]
async fn transient_create_failures_burn_down() {
    let mock = MockVpsie::new();
    mock.fail_next_creates(2).await;
    let ctx = CancellationToken::new();
    let first = mock.create_vm(&ctx, &create_req("pool-a-bbbb2222")).await;
    assert!(first.unwrap_err().is_transient());
    let second = mock.create_vm(&ctx, &create_req("pool-a-bbbb2222")).await;
    assert!(second.is_err());
    // the third attempt goes through
    let third = mock.create_vm(&ctx, &create_req("pool-a-bbbb2222")).await;
    assert!(third.unwrap().is_some());
}

#[tokio::test]
async fn group_creation_assigns_ids_visible_on_relist() {
    let mock = MockVpsie::new();
    let ctx = CancellationToken::new();
    let req = vpsie_autoscaler::client::VpsieNodeGroupRequest {
        name: "pool-a".to_owned(),
        resource_identifier: "cluster-77".to_owned(),
        kube_size_id: "ks-4".to_owned(),
        datacenter_id: "us-east-1".to_owned(),
    };
    // creation returns nothing, the id comes from the follow up list
    mock.create_k8s_group(&ctx, &req).await.unwrap();
    let groups = mock.list_k8s_groups(&ctx, "cluster-77").await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].name, "pool-a");
    assert!(groups[0].id > 0);
}

#[tokio::test]
async fn credential_refreshes_are_counted() {
    let mock = MockVpsie::new();
    let ctx = CancellationToken::new();
    mock.refresh_credentials(&ctx).await.unwrap();
    mock.refresh_credentials(&ctx).await.unwrap();
    assert_eq!(mock.refreshes().await, 2);
}

#[tokio::test]
async fn offerings_resolve_by_id() {
    let mock = MockVpsie::new();
    mock.push_offering(Offering {
        id: "m2.small".to_owned(),
        price_hourly: 0.30,
        cpu: 2,
        memory_mb: 2048,
        disk_gb: 40,
    })
    .await;
    let ctx = CancellationToken::new();
    let offering = mock.get_offering(&ctx, "m2.small").await.unwrap();
    assert_eq!(offering.cpu, 2);
    let missing = mock.get_offering(&ctx, "m9.huge").await;
    assert!(missing.unwrap_err().is_not_found());
}
