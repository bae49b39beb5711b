//! End-to-end scenarios against a simulated data centre

#[cfg(test)]
mod tests {
    use crate::config::Settings;
    use crate::controller::{Controller, TickReport};
    use crate::executor::Outcome;
    use crate::metrics::Metrics;
    use crate::test_utils::{SimulatedCluster, elect, sample_cluster};
    use cluster_model::{Record, RecordStatus, ResourceDefinition};
    use kv_client::{LeaderKey, Session};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    const HOUR: Duration = Duration::from_secs(3600);

    fn fast_settings() -> Settings {
        Settings {
            interval: Duration::from_millis(200),
            probe_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_secs(5),
            tick_timeout: Duration::from_secs(30),
            ..Settings::default()
        }
    }

    /// Tick until the planner has nothing left to do
    async fn converge(controller: &Controller, session: &Session, leader: &LeaderKey) -> Vec<TickReport> {
        let cancel = CancellationToken::new();
        let mut reports = Vec::new();
        for _ in 0..20 {
            let report = controller.tick(session, leader, false, &cancel).await.unwrap();
            if report.operation.is_none() {
                return reports;
            }
            reports.push(report);
        }
        panic!("cluster did not converge: {:?}", operations(&reports));
    }

    fn operations(reports: &[TickReport]) -> Vec<String> {
        reports.iter().filter_map(|r| r.operation.clone()).collect()
    }

    fn assert_all_completed(reports: &[TickReport]) {
        for report in reports {
            assert_eq!(report.outcome, Some(Outcome::Completed), "{report:?}");
        }
    }

    async fn wait_for<F, Fut>(what: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn test_cold_bootstrap() {
        let cluster = sample_cluster(3, 2);
        let sim = SimulatedCluster::new(&cluster).await;
        let controller = Controller::new(sim.infra(), fast_settings(), Metrics::new().unwrap(), "test");
        let (session, leader) = elect(&sim.storage).await;

        let reports = converge(&controller, &session, &leader).await;
        assert_eq!(
            operations(&reports),
            vec!["ca-bootstrap", "etcd-bootstrap", "control-plane-bootstrap", "kube-worker-bootstrap"]
        );
        assert_all_completed(&reports);

        assert_eq!(sim.etcd_member_list().len(), 3);
        for address in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            let running = sim.host(address).running_containers();
            for name in ["etcd", "kube-apiserver", "kube-controller-manager", "kube-scheduler", "kubelet", "kube-proxy"] {
                assert!(running.contains(&name.to_string()), "{name} on {address}");
            }
        }
        for address in ["10.0.0.4", "10.0.0.5"] {
            let running = sim.host(address).running_containers();
            assert_eq!(running, vec!["kube-proxy".to_string(), "kubelet".to_string()], "{address}");
        }

        let records = sim.storage.records(10).await.unwrap();
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.status == RecordStatus::Completed));
    }

    #[tokio::test]
    async fn test_control_plane_node_failure() {
        let cluster = sample_cluster(3, 2);
        let sim = SimulatedCluster::new(&cluster).await;
        let controller = Controller::new(sim.infra(), fast_settings(), Metrics::new().unwrap(), "test");
        let (session, leader) = elect(&sim.storage).await;
        converge(&controller, &session, &leader).await;

        sim.host("10.0.0.2").set_reachable(false);
        let reports = converge(&controller, &session, &leader).await;
        assert_eq!(
            operations(&reports),
            vec!["unreachable-node-quarantine", "etcd-remove-member"]
        );
        assert_all_completed(&reports);

        assert!(sim.kubernetes.is_cordoned("10.0.0.2"));
        let members = sim.etcd_member_list();
        assert_eq!(members.len(), 2);
        assert!(members.iter().all(|m| m.name != "10.0.0.2"));
    }

    #[tokio::test]
    async fn test_certificate_rotation() {
        let mut cluster = sample_cluster(1, 1);
        cluster.tls.validity = 24 * HOUR;
        cluster.tls.renewal_window = HOUR;
        let sim = SimulatedCluster::new(&cluster).await;
        let controller = Controller::new(sim.infra(), fast_settings(), Metrics::new().unwrap(), "test");
        let (session, leader) = elect(&sim.storage).await;
        converge(&controller, &session, &leader).await;
        let before = sim.host("10.0.0.2").file("/etc/cke/pki/kubelet.crt").unwrap();

        sim.advance(22 * HOUR);
        assert!(converge(&controller, &session, &leader).await.is_empty());

        sim.advance(HOUR);
        let reports = converge(&controller, &session, &leader).await;
        assert_eq!(operations(&reports), vec!["cert-renew"]);
        assert_all_completed(&reports);

        let host = sim.host("10.0.0.2");
        assert_ne!(host.file("/etc/cke/pki/kubelet.crt").unwrap(), before);
        assert_eq!(host.restarts("kubelet"), 1);
    }

    #[tokio::test]
    async fn test_failed_pull_names_the_node_and_is_retried() {
        let cluster = sample_cluster(3, 2);
        let sim = SimulatedCluster::new(&cluster).await;
        sim.host("10.0.0.3").fail_image(crate::services::ETCD_IMAGE, true);
        let controller = Controller::new(sim.infra(), fast_settings(), Metrics::new().unwrap(), "test");
        let (session, leader) = elect(&sim.storage).await;
        let cancel = CancellationToken::new();

        let first = controller.tick(&session, &leader, false, &cancel).await.unwrap();
        assert_eq!(first.operation.as_deref(), Some("ca-bootstrap"));
        let failed = controller.tick(&session, &leader, false, &cancel).await.unwrap();
        assert_eq!(failed.operation.as_deref(), Some("etcd-bootstrap"));
        assert!(failed.is_failure());

        let record = sim.storage.records(1).await.unwrap().remove(0);
        assert_eq!(record.status, RecordStatus::Error);
        assert!(record.error.contains("10.0.0.3"), "{}", record.error);
        assert!(sim.host("10.0.0.1").has_image(crate::services::ETCD_IMAGE));
        assert!(sim.host("10.0.0.2").has_image(crate::services::ETCD_IMAGE));

        sim.host("10.0.0.3").fail_image(crate::services::ETCD_IMAGE, false);
        let retried = controller.tick(&session, &leader, false, &cancel).await.unwrap();
        assert_eq!(retried.operation.as_deref(), Some("etcd-bootstrap"));
        assert_eq!(retried.outcome, Some(Outcome::Completed));
    }

    #[tokio::test]
    async fn test_resources_follow_revisions() {
        let cluster = sample_cluster(1, 0);
        let sim = SimulatedCluster::new(&cluster).await;
        let controller = Controller::new(sim.infra(), fast_settings(), Metrics::new().unwrap(), "test");
        let (session, leader) = elect(&sim.storage).await;
        converge(&controller, &session, &leader).await;

        let mut definition = ResourceDefinition {
            kind: "Namespace".to_string(),
            namespace: None,
            name: "team-a".to_string(),
            revision: 1,
            manifest: "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: team-a\n".to_string(),
        };
        sim.storage.put_resource(&definition).await.unwrap();
        let reports = converge(&controller, &session, &leader).await;
        assert_eq!(operations(&reports), vec!["resource-apply"]);
        assert_eq!(sim.kubernetes.applied_revision("Namespace//team-a"), Some(1));

        // Unchanged revisions are not applied again
        assert!(converge(&controller, &session, &leader).await.is_empty());
        assert_eq!(sim.kubernetes.applies(), 1);

        definition.revision = 2;
        sim.storage.put_resource(&definition).await.unwrap();
        converge(&controller, &session, &leader).await;
        assert_eq!(sim.kubernetes.applied_revision("Namespace//team-a"), Some(2));
        assert_eq!(sim.kubernetes.applies(), 2);
    }

    #[tokio::test]
    async fn test_config_edit_wakes_the_loop() {
        let cluster = sample_cluster(1, 0);
        let sim = SimulatedCluster::unconfigured(&cluster).await;
        let metrics = Metrics::new().unwrap();
        let settings = Settings {
            interval: Duration::from_secs(600),
            ..fast_settings()
        };
        let controller = Arc::new(Controller::new(sim.infra(), settings, metrics.clone(), "cke-1"));
        let cancel = CancellationToken::new();
        let handle = {
            let controller = Arc::clone(&controller);
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.run(cancel).await })
        };

        wait_for("the first idle tick", || {
            let metrics = metrics.clone();
            async move { metrics.ticks() > 0 }
        })
        .await;

        // Well inside the interval: only the watch can trigger these ticks.
        sim.storage.put_cluster(&cluster, 0).await.unwrap();
        let storage = Arc::clone(&sim.storage);
        wait_for("the bootstrap to reach kube-worker-bootstrap", || {
            let storage = Arc::clone(&storage);
            async move {
                storage
                    .records(10)
                    .await
                    .unwrap()
                    .iter()
                    .any(|r: &Record| r.operation == "kube-worker-bootstrap" && r.status == RecordStatus::Completed)
            }
        })
        .await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_handover_cancels_orphaned_operation() {
        let cluster = sample_cluster(1, 0);
        let sim = SimulatedCluster::unconfigured(&cluster).await;
        let (old_session, old_leader) = elect(&sim.storage).await;
        let orphan = sim
            .storage
            .append_record(
                Record::new("etcd-bootstrap", vec![], old_session.id(), chrono::Utc::now()),
                &old_leader,
            )
            .await
            .unwrap();
        // The previous leader dies without resigning.
        sim.kv.expire_lease(old_session.lease_id());

        let controller = Arc::new(Controller::new(
            sim.infra(),
            fast_settings(),
            Metrics::new().unwrap(),
            "cke-2",
        ));
        let cancel = CancellationToken::new();
        let handle = {
            let controller = Arc::clone(&controller);
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.run(cancel).await })
        };

        let storage = Arc::clone(&sim.storage);
        wait_for("the orphan to be cancelled", || {
            let storage = Arc::clone(&storage);
            async move {
                storage
                    .record(orphan.id)
                    .await
                    .unwrap()
                    .is_some_and(|r| r.status == RecordStatus::Cancelled)
            }
        })
        .await;
        assert_eq!(sim.storage.leader().await.unwrap().as_deref(), Some("cke-2"));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
