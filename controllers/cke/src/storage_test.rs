//! Unit tests for storage module

#[cfg(test)]
mod tests {
    use crate::error::ControllerError;
    use crate::storage::{CaBundle, Storage, VaultEntry};
    use crate::test_utils::{elect, sample_cluster};
    use chrono::{Duration as ChronoDuration, Utc};
    use cluster_model::{CaRole, CertificateMetadata, Record, RecordStatus, ResourceDefinition};
    use kv_client::MockKvClient;
    use std::sync::Arc;
    use std::time::Duration;

    fn storage(kv: &MockKvClient) -> Storage {
        Storage::new(Arc::new(kv.clone()), "/cke", Duration::from_secs(2))
    }

    fn entry(role: CaRole, serial: &str, target: &str) -> VaultEntry {
        let now = Utc::now();
        VaultEntry {
            metadata: CertificateMetadata {
                role,
                serial: serial.to_string(),
                target: target.to_string(),
                common_name: "kube-apiserver".to_string(),
                alt_names: vec![],
                organization: None,
                not_before: now,
                not_after: now + ChronoDuration::hours(24),
                revoked: false,
            },
            certificate: "PEM".to_string(),
        }
    }

    #[tokio::test]
    async fn test_cluster_compare_and_swap() {
        let kv = MockKvClient::new();
        let storage = storage(&kv);
        assert!(storage.get_cluster().await.unwrap().is_none());

        let mut cluster = sample_cluster(3, 0);
        let rev = storage.put_cluster(&cluster, 0).await.unwrap();

        // Revision 0 means "must not exist"
        let err = storage.put_cluster(&cluster, 0).await.unwrap_err();
        assert!(matches!(err, ControllerError::Conflict(_)));

        cluster.dns_servers.push("10.0.0.53".to_string());
        let rev2 = storage.put_cluster(&cluster, rev).await.unwrap();
        assert!(rev2 > rev);

        // Stale revision loses
        assert!(storage.put_cluster(&cluster, rev).await.is_err());

        let (stored, stored_rev) = storage.get_cluster().await.unwrap().unwrap();
        assert_eq!(stored, cluster);
        assert_eq!(stored_rev, rev2);
    }

    #[tokio::test]
    async fn test_invalid_cluster_is_rejected() {
        let kv = MockKvClient::new();
        let storage = storage(&kv);
        let mut cluster = sample_cluster(1, 0);
        cluster.nodes.push(cluster.nodes[0].clone());
        let err = storage.put_cluster(&cluster, 0).await.unwrap_err();
        assert!(matches!(err, ControllerError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_record_ids_increase_and_list_newest_first() {
        let kv = MockKvClient::new();
        let storage = storage(&kv);
        let (session, leader) = elect(&storage).await;

        for op in ["ca-bootstrap", "etcd-bootstrap", "control-plane-bootstrap"] {
            let record = Record::new(op, vec![], session.id(), Utc::now());
            storage.append_record(record, &leader).await.unwrap();
        }

        let records = storage.records(2).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, 3);
        assert_eq!(records[0].operation, "control-plane-bootstrap");
        assert_eq!(records[1].id, 2);
    }

    #[tokio::test]
    async fn test_update_and_running_records() {
        let kv = MockKvClient::new();
        let storage = storage(&kv);
        let (session, leader) = elect(&storage).await;

        let first = storage
            .append_record(Record::new("ca-bootstrap", vec![], session.id(), Utc::now()), &leader)
            .await
            .unwrap();
        storage
            .append_record(Record::new("etcd-bootstrap", vec![], session.id(), Utc::now()), &leader)
            .await
            .unwrap();

        let updated = storage
            .update_record(first.id, &leader, |r| r.complete(Utc::now()))
            .await
            .unwrap();
        assert_eq!(updated.status, RecordStatus::Completed);

        let running = storage.running_records().await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].operation, "etcd-bootstrap");

        let missing = storage.update_record(99, &leader, |_| {}).await.unwrap_err();
        assert!(matches!(missing, ControllerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_deposed_leader_cannot_write() {
        let kv = MockKvClient::new();
        let storage = storage(&kv);
        let (session, leader) = elect(&storage).await;

        kv.expire_lease(session.lease_id());

        let err = storage
            .append_record(Record::new("ca-bootstrap", vec![], session.id(), Utc::now()), &leader)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::LeadershipLost));
        assert!(storage.records(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_truncate_keeps_newest() {
        let kv = MockKvClient::new();
        let storage = storage(&kv);
        let (session, leader) = elect(&storage).await;
        for i in 0..5 {
            let mut record = Record::new(format!("op-{i}"), vec![], session.id(), Utc::now());
            record.complete(Utc::now());
            storage.append_record(record, &leader).await.unwrap();
        }

        assert_eq!(storage.truncate_records(2, &leader).await.unwrap(), 3);
        assert_eq!(storage.truncate_records(2, &leader).await.unwrap(), 0);
        let ids: Vec<i64> = storage.records(10).await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![5, 4]);

        // Ids keep increasing after truncation
        let next = storage
            .append_record(Record::new("op-5", vec![], session.id(), Utc::now()), &leader)
            .await
            .unwrap();
        assert_eq!(next.id, 6);
    }

    #[tokio::test]
    async fn test_ids_do_not_repeat_after_full_truncation() {
        let kv = MockKvClient::new();
        let storage = storage(&kv);
        let (session, leader) = elect(&storage).await;

        let mut first = Record::new("ca-bootstrap", vec![], session.id(), Utc::now());
        first.complete(Utc::now());
        let first = storage.append_record(first, &leader).await.unwrap();
        assert_eq!(storage.truncate_records(0, &leader).await.unwrap(), 1);
        assert!(storage.records(10).await.unwrap().is_empty());

        let second = storage
            .append_record(Record::new("etcd-bootstrap", vec![], session.id(), Utc::now()), &leader)
            .await
            .unwrap();
        assert!(second.id > first.id, "{} after {}", second.id, first.id);
    }

    #[tokio::test]
    async fn test_vault_entries() {
        let kv = MockKvClient::new();
        let storage = storage(&kv);
        let (_session, leader) = elect(&storage).await;

        let bundle = CaBundle {
            role: CaRole::Kubernetes,
            certificate: "CA".to_string(),
            private_key: "KEY".to_string(),
        };
        assert!(storage.put_ca(&bundle, &leader).await.unwrap());
        assert!(!storage.put_ca(&bundle, &leader).await.unwrap(), "existing CA is kept");
        assert_eq!(storage.get_ca(CaRole::Kubernetes).await.unwrap(), Some(bundle));
        assert!(storage.get_ca(CaRole::Server).await.unwrap().is_none());

        storage
            .put_certificate(&entry(CaRole::Kubernetes, "0a", "10.0.0.1/admin"), &leader)
            .await
            .unwrap();
        storage
            .put_certificate(&entry(CaRole::Kubernetes, "0b", "10.0.0.1/kubelet"), &leader)
            .await
            .unwrap();
        let listed = storage.list_certificates(CaRole::Kubernetes).await.unwrap();
        assert_eq!(listed.len(), 2, "authority is not listed");

        let deleted = storage
            .delete_certificates(CaRole::Kubernetes, &["0a".to_string()], &leader)
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(storage.list_certificates(CaRole::Kubernetes).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resources_and_leader() {
        let kv = MockKvClient::new();
        let storage = storage(&kv);
        assert!(storage.leader().await.unwrap().is_none());

        storage
            .put_resource(&ResourceDefinition {
                kind: "ServiceAccount".to_string(),
                namespace: Some("kube-system".to_string()),
                name: "cke-etcd-backup".to_string(),
                revision: 1,
                manifest: "{}".to_string(),
            })
            .await
            .unwrap();
        let resources = storage.resources().await.unwrap();
        assert_eq!(resources.len(), 1);
        assert!(resources.definitions.contains_key("ServiceAccount/kube-system/cke-etcd-backup"));

        let (_session, _leader) = elect(&storage).await;
        assert_eq!(storage.leader().await.unwrap().as_deref(), Some("test-controller"));
    }

    #[tokio::test]
    async fn test_store_outage_is_a_transport_error() {
        let kv = MockKvClient::new();
        let storage = storage(&kv);
        kv.set_unavailable(true);
        let err = storage.get_cluster().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transport);
    }
}
