mod common;

use std::time::Duration;

use capstan_control::id::JobMasterId;
use capstan_control::proto::capstan::resource_manager as gen;
use capstan_server::retry::RetryStrategy;
use common::*;
use tonic::Code;

fn register_task_executor_request(
    token: &str,
    address: &str,
    resource_id: &str,
) -> gen::RegisterTaskExecutorRequest {
    gen::RegisterTaskExecutorRequest {
        resource_manager_id: token.to_string(),
        task_executor_address: address.to_string(),
        resource_id: resource_id.to_string(),
        data_port: 4000,
        hardware: Some(hardware()),
        timeout_ms: 5_000,
    }
}

fn register_job_manager_request(
    token: &str,
    job_master_id: &JobMasterId,
    resource_id: &str,
    address: &str,
    job_id: &str,
) -> gen::RegisterJobManagerRequest {
    gen::RegisterJobManagerRequest {
        resource_manager_id: token.to_string(),
        job_master_id: job_master_id.to_string(),
        job_manager_resource_id: resource_id.to_string(),
        job_manager_address: address.to_string(),
        job_id: job_id.to_string(),
        timeout_ms: 5_000,
    }
}

fn success_instance_id(response: gen::RegisterTaskExecutorResponse) -> u64 {
    match response.result {
        Some(gen::register_task_executor_response::Result::Success(success)) => {
            success.instance_id
        }
        other => panic!("expected a successful registration, got {other:?}"),
    }
}

fn decline_reason(response: gen::RegisterTaskExecutorResponse) -> String {
    match response.result {
        Some(gen::register_task_executor_response::Result::Decline(decline)) => decline.reason,
        other => panic!("expected a declined registration, got {other:?}"),
    }
}

async fn register_task_executor(
    cluster: &TestCluster,
    address: &str,
    resource_id: &str,
) -> u64 {
    let response = cluster
        .client()
        .register_task_executor(register_task_executor_request(
            &cluster.token(),
            address,
            resource_id,
        ))
        .await
        .unwrap()
        .into_inner();
    success_instance_id(response)
}

async fn register_job_manager(
    cluster: &TestCluster,
    job_master_id: &JobMasterId,
    resource_id: &str,
    address: &str,
    job_id: &str,
) -> gen::RegisterJobManagerResponse {
    cluster
        .client()
        .register_job_manager(register_job_manager_request(
            &cluster.token(),
            job_master_id,
            resource_id,
            address,
            job_id,
        ))
        .await
        .unwrap()
        .into_inner()
}

#[tokio::test]
async fn test_slot_request_happy_path() {
    let cluster = TestClusterBuilder::default().start().await;

    // A task executor registers and populates the slot table.
    let (te_address, _te) = spawn_task_executor(None).await;
    let instance_id = register_task_executor(&cluster, &te_address, "tm-1").await;
    cluster
        .client()
        .send_slot_report(gen::SendSlotReportRequest {
            resource_manager_id: cluster.token(),
            resource_id: "tm-1".to_string(),
            instance_id,
            slot_report: Some(slot_report("tm-1", 1)),
            timeout_ms: 0,
        })
        .await
        .unwrap();
    assert_eq!(
        lock(&cluster.slot_calls).registered_task_managers,
        vec![(instance_id, "tm-1".to_string())]
    );

    // The leading job manager registers.
    let job_master_id = JobMasterId::random();
    let job_id = "job-1";
    cluster
        .ha
        .publish_job_leader(&job_id.into(), Some(job_master_id));
    let (jm_address, _jm) = spawn_job_manager().await;
    let response =
        register_job_manager(&cluster, &job_master_id, "jm-1", &jm_address, job_id).await;
    assert!(matches!(
        response.result,
        Some(gen::register_job_manager_response::Result::Success(_))
    ));

    // The slot request reaches the slot manager.
    cluster
        .client()
        .request_slot(gen::RequestSlotRequest {
            resource_manager_id: cluster.token(),
            job_master_id: job_master_id.to_string(),
            slot_request: Some(slot_request(job_id, "alloc-1")),
            timeout_ms: 0,
        })
        .await
        .unwrap();
    assert_eq!(
        lock(&cluster.slot_calls).slot_requests,
        vec![(job_id.to_string(), "alloc-1".to_string())]
    );

    cluster.runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_slot_request_with_wrong_job_master_id_is_rejected() {
    let cluster = TestClusterBuilder::default().start().await;

    let job_master_id = JobMasterId::random();
    let job_id = "job-1";
    cluster
        .ha
        .publish_job_leader(&job_id.into(), Some(job_master_id));
    let (jm_address, _jm) = spawn_job_manager().await;
    register_job_manager(&cluster, &job_master_id, "jm-1", &jm_address, job_id).await;

    let status = cluster
        .client()
        .request_slot(gen::RequestSlotRequest {
            resource_manager_id: cluster.token(),
            job_master_id: JobMasterId::random().to_string(),
            slot_request: Some(slot_request(job_id, "alloc-1")),
            timeout_ms: 0,
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::FailedPrecondition);
    assert!(lock(&cluster.slot_calls).slot_requests.is_empty());

    cluster.runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_outdated_task_executor_registration_is_declined() {
    let builder = TestClusterBuilder {
        // make the doomed connection attempt slow enough to be superseded
        retry: RetryStrategy::Fixed {
            max_count: 5,
            delay: Duration::from_millis(300),
        },
        ..Default::default()
    };
    let cluster = builder.start().await;

    // The first registration points at a port that refuses connections,
    // so its retries outlive the second registration below.
    let first = {
        let mut client = cluster.client();
        let request = register_task_executor_request(&cluster.token(), "127.0.0.1:1", "tm-1");
        tokio::spawn(async move { client.register_task_executor(request).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (te_address, _te) = spawn_task_executor(None).await;
    let instance_id = register_task_executor(&cluster, &te_address, "tm-1").await;
    assert!(instance_id > 0);

    let first = first.await.unwrap().unwrap().into_inner();
    assert!(decline_reason(first).contains("outdated"));

    // The second registration survives.
    let count = cluster
        .client()
        .get_registered_task_manager_count(gen::GetRegisteredTaskManagerCountRequest {
            resource_manager_id: cluster.token(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(count.count, 1);

    cluster.runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_re_registration_generates_fresh_instance_id() {
    let cluster = TestClusterBuilder::default().start().await;
    let (te_address, _te) = spawn_task_executor(None).await;

    let first = register_task_executor(&cluster, &te_address, "tm-1").await;
    let second = register_task_executor(&cluster, &te_address, "tm-1").await;
    assert_ne!(first, second);

    // The stale incarnation was pushed out of the slot manager.
    wait_until("the first instance to be unregistered", || {
        lock(&cluster.slot_calls)
            .unregistered_task_managers
            .iter()
            .any(|(instance, cause)| *instance == first && cause.contains("re-connected"))
    })
    .await;

    cluster.runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stale_slot_report_is_rejected() {
    let cluster = TestClusterBuilder::default().start().await;
    let (te_address, _te) = spawn_task_executor(None).await;
    let instance_id = register_task_executor(&cluster, &te_address, "tm-1").await;

    let status = cluster
        .client()
        .send_slot_report(gen::SendSlotReportRequest {
            resource_manager_id: cluster.token(),
            resource_id: "tm-1".to_string(),
            instance_id: instance_id + 17,
            slot_report: Some(slot_report("tm-1", 1)),
            timeout_ms: 0,
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert!(lock(&cluster.slot_calls).registered_task_managers.is_empty());

    // A report for an unknown executor fails with a dedicated error.
    let status = cluster
        .client()
        .send_slot_report(gen::SendSlotReportRequest {
            resource_manager_id: cluster.token(),
            resource_id: "tm-unknown".to_string(),
            instance_id,
            slot_report: Some(slot_report("tm-unknown", 1)),
            timeout_ms: 0,
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);

    cluster.runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_task_manager_heartbeat_timeout_disconnects() {
    let builder = TestClusterBuilder {
        heartbeat_interval: Duration::from_millis(200),
        heartbeat_timeout: Duration::from_millis(800),
        ..Default::default()
    };
    let cluster = builder.start().await;
    let (te_address, te) = spawn_task_executor(None).await;
    let instance_id = register_task_executor(&cluster, &te_address, "tm-1").await;

    // The resource manager keeps requesting heartbeats but the task
    // executor never reports back, so the monitor eventually fires.
    wait_until("heartbeat requests to arrive", || {
        !lock(&te.heartbeats).is_empty()
    })
    .await;
    wait_until("the task manager to time out", || {
        lock(&cluster.slot_calls)
            .unregistered_task_managers
            .iter()
            .any(|(instance, cause)| *instance == instance_id && cause.contains("timed out"))
    })
    .await;
    wait_until("the task executor to be told to disconnect", || {
        !lock(&te.disconnects).is_empty()
    })
    .await;

    let count = cluster
        .client()
        .get_registered_task_manager_count(gen::GetRegisteredTaskManagerCountRequest {
            resource_manager_id: cluster.token(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(count.count, 0);

    cluster.runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_heartbeats_keep_task_manager_alive() {
    let builder = TestClusterBuilder {
        heartbeat_interval: Duration::from_millis(100),
        heartbeat_timeout: Duration::from_millis(600),
        ..Default::default()
    };
    let cluster = builder.start().await;
    let (te_address, _te) = spawn_task_executor(None).await;
    register_task_executor(&cluster, &te_address, "tm-1").await;

    for _ in 0..10 {
        cluster
            .client()
            .heartbeat_from_task_manager(gen::HeartbeatFromTaskManagerRequest {
                resource_manager_id: cluster.token(),
                resource_id: "tm-1".to_string(),
                slot_report: Some(slot_report("tm-1", 1)),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    assert!(lock(&cluster.slot_calls).unregistered_task_managers.is_empty());
    // heartbeat payloads were forwarded as slot status reports
    assert!(!lock(&cluster.slot_calls).slot_reports.is_empty());

    cluster.runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_leadership_revocation_clears_state() {
    let cluster = TestClusterBuilder::default().start().await;
    let (te_address, _te) = spawn_task_executor(None).await;
    register_task_executor(&cluster, &te_address, "tm-1").await;

    let job_master_id = JobMasterId::random();
    cluster
        .ha
        .publish_job_leader(&"job-1".into(), Some(job_master_id));
    let (jm_address, _jm) = spawn_job_manager().await;
    register_job_manager(&cluster, &job_master_id, "jm-1", &jm_address, "job-1").await;

    let old_token = cluster.token();
    cluster.ha.revoke_leadership();

    // Requests fenced by the old token are rejected once the revocation
    // has been processed.
    wait_until_async("the old token to be fenced off", || {
        let mut client = cluster.client();
        let token = old_token.clone();
        async move {
            client
                .get_resource_overview(gen::GetResourceOverviewRequest {
                    resource_manager_id: token,
                })
                .await
                .is_err()
        }
    })
    .await;
    assert!(lock(&cluster.slot_calls).suspended >= 1);

    // A new grant starts from empty tables.
    let mut cluster = cluster;
    cluster.ha.grant_leadership();
    cluster.wait_for_leadership().await;
    let overview = cluster
        .client()
        .get_resource_overview(gen::GetResourceOverviewRequest {
            resource_manager_id: cluster.token(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(overview.task_manager_count, 0);
    assert_eq!(overview.slot_count, 0);

    cluster.runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_allocation_failure_reaches_job_manager() {
    let mut script = SlotManagerScript::default();
    script
        .fail_requests
        .insert("alloc-1".to_string(), "no resources left".to_string());
    let builder = TestClusterBuilder {
        script,
        ..Default::default()
    };
    let cluster = builder.start().await;

    let job_master_id = JobMasterId::random();
    cluster
        .ha
        .publish_job_leader(&"job-1".into(), Some(job_master_id));
    let (jm_address, jm) = spawn_job_manager().await;
    register_job_manager(&cluster, &job_master_id, "jm-1", &jm_address, "job-1").await;

    cluster
        .client()
        .request_slot(gen::RequestSlotRequest {
            resource_manager_id: cluster.token(),
            job_master_id: job_master_id.to_string(),
            slot_request: Some(slot_request("job-1", "alloc-1")),
            timeout_ms: 0,
        })
        .await
        .unwrap();

    wait_until("the allocation failure to reach the job manager", || {
        lock(&jm.allocation_failures)
            .iter()
            .any(|(allocation, cause)| allocation == "alloc-1" && cause == "no resources left")
    })
    .await;

    cluster.runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_release_resource_stops_worker_and_disconnects() {
    let mut script = SlotManagerScript::default();
    // instance IDs are handed out sequentially starting at one
    script.release_on_request.insert("alloc-1".to_string(), 1);
    let builder = TestClusterBuilder {
        script,
        ..Default::default()
    };
    let cluster = builder.start().await;

    let (te_address, te) = spawn_task_executor(None).await;
    let instance_id = register_task_executor(&cluster, &te_address, "tm-1").await;
    assert_eq!(instance_id, 1);

    let job_master_id = JobMasterId::random();
    cluster
        .ha
        .publish_job_leader(&"job-1".into(), Some(job_master_id));
    let (jm_address, _jm) = spawn_job_manager().await;
    register_job_manager(&cluster, &job_master_id, "jm-1", &jm_address, "job-1").await;

    cluster
        .client()
        .request_slot(gen::RequestSlotRequest {
            resource_manager_id: cluster.token(),
            job_master_id: job_master_id.to_string(),
            slot_request: Some(slot_request("job-1", "alloc-1")),
            timeout_ms: 0,
        })
        .await
        .unwrap();

    wait_until("the worker to be stopped", || {
        lock(&cluster.backend.stopped_workers).contains(&"tm-1".to_string())
    })
    .await;
    wait_until("the task executor to be told to disconnect", || {
        !lock(&te.disconnects).is_empty()
    })
    .await;

    cluster.runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_double_disconnect_is_idempotent() {
    let cluster = TestClusterBuilder::default().start().await;
    let (te_address, _te) = spawn_task_executor(None).await;
    register_task_executor(&cluster, &te_address, "tm-1").await;

    for _ in 0..2 {
        cluster
            .client()
            .disconnect_task_manager(gen::DisconnectTaskManagerRequest {
                resource_manager_id: cluster.token(),
                resource_id: "tm-1".to_string(),
                cause: "task executor is shutting down".to_string(),
            })
            .await
            .unwrap();
    }
    assert_eq!(lock(&cluster.slot_calls).unregistered_task_managers.len(), 1);

    cluster.runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_job_manager_registration_is_idempotent() {
    let cluster = TestClusterBuilder::default().start().await;
    let job_master_id = JobMasterId::random();
    cluster
        .ha
        .publish_job_leader(&"job-1".into(), Some(job_master_id));
    let (jm_address, jm) = spawn_job_manager().await;

    for _ in 0..2 {
        let response =
            register_job_manager(&cluster, &job_master_id, "jm-1", &jm_address, "job-1").await;
        assert!(matches!(
            response.result,
            Some(gen::register_job_manager_response::Result::Success(_))
        ));
    }
    assert!(lock(&jm.disconnects).is_empty());

    cluster.runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_new_job_leader_replaces_registration() {
    let cluster = TestClusterBuilder::default().start().await;
    let (jm_address, jm) = spawn_job_manager().await;

    let old_leader = JobMasterId::random();
    cluster
        .ha
        .publish_job_leader(&"job-1".into(), Some(old_leader));
    register_job_manager(&cluster, &old_leader, "jm-1", &jm_address, "job-1").await;

    let new_leader = JobMasterId::random();
    cluster
        .ha
        .publish_job_leader(&"job-1".into(), Some(new_leader));
    let response =
        register_job_manager(&cluster, &new_leader, "jm-2", &jm_address, "job-1").await;
    assert!(matches!(
        response.result,
        Some(gen::register_job_manager_response::Result::Success(_))
    ));

    // The replaced job manager is told that it lost the job.
    wait_until("the old job manager to be disconnected", || {
        lock(&jm.disconnects)
            .iter()
            .any(|(_, cause)| cause.contains("new job leader"))
    })
    .await;

    cluster.runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_registration_with_stale_job_master_id_is_declined() {
    let cluster = TestClusterBuilder::default().start().await;
    let (jm_address, _jm) = spawn_job_manager().await;

    let leader = JobMasterId::random();
    cluster.ha.publish_job_leader(&"job-1".into(), Some(leader));

    let stale = JobMasterId::random();
    let response = register_job_manager(&cluster, &stale, "jm-1", &jm_address, "job-1").await;
    match response.result {
        Some(gen::register_job_manager_response::Result::Decline(decline)) => {
            assert!(decline.reason.contains("did not match"));
        }
        other => panic!("expected a declined registration, got {other:?}"),
    }

    cluster.runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unrecognized_task_executor_is_declined() {
    let cluster = TestClusterBuilder::default().start().await;
    lock(&cluster.backend.rejected_workers).insert("tm-rogue".to_string());
    let (te_address, _te) = spawn_task_executor(None).await;

    let response = cluster
        .client()
        .register_task_executor(register_task_executor_request(
            &cluster.token(),
            &te_address,
            "tm-rogue",
        ))
        .await
        .unwrap()
        .into_inner();
    assert!(decline_reason(response).contains("unrecognized"));

    cluster.runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_introspection_queries() {
    let cluster = TestClusterBuilder::default().start().await;
    let (te_with_metrics, _te1) =
        spawn_task_executor(Some("127.0.0.1:9999".to_string())).await;
    let (te_without_metrics, _te2) = spawn_task_executor(None).await;
    let instance_id = register_task_executor(&cluster, &te_with_metrics, "tm-1").await;
    register_task_executor(&cluster, &te_without_metrics, "tm-2").await;
    cluster
        .client()
        .send_slot_report(gen::SendSlotReportRequest {
            resource_manager_id: cluster.token(),
            resource_id: "tm-1".to_string(),
            instance_id,
            slot_report: Some(slot_report("tm-1", 2)),
            timeout_ms: 0,
        })
        .await
        .unwrap();

    let task_managers = cluster
        .client()
        .list_task_managers(gen::ListTaskManagersRequest {
            resource_manager_id: cluster.token(),
        })
        .await
        .unwrap()
        .into_inner()
        .task_managers;
    assert_eq!(task_managers.len(), 2);

    let info = cluster
        .client()
        .get_task_manager(gen::GetTaskManagerRequest {
            resource_manager_id: cluster.token(),
            resource_id: "tm-1".to_string(),
        })
        .await
        .unwrap()
        .into_inner()
        .task_manager
        .unwrap();
    assert_eq!(info.slot_count, 2);
    assert_eq!(info.data_port, 4000);
    assert!(info.last_heartbeat_ms > 0);

    let status = cluster
        .client()
        .get_task_manager(gen::GetTaskManagerRequest {
            resource_manager_id: cluster.token(),
            resource_id: "tm-unknown".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);

    // Executors without a metric query service are dropped from the listing.
    let addresses = cluster
        .client()
        .list_task_manager_metric_addresses(gen::ListTaskManagerMetricAddressesRequest {
            resource_manager_id: cluster.token(),
            timeout_ms: 2_000,
        })
        .await
        .unwrap()
        .into_inner()
        .addresses;
    assert_eq!(addresses.len(), 1);
    assert_eq!(addresses[0].resource_id, "tm-1");
    assert_eq!(addresses[0].address, "127.0.0.1:9999");

    let upload = cluster
        .client()
        .request_task_manager_file_upload(gen::RequestTaskManagerFileUploadRequest {
            resource_manager_id: cluster.token(),
            resource_id: "tm-1".to_string(),
            file_type: capstan_control::proto::capstan::common::FileType::Log as i32,
            timeout_ms: 2_000,
        })
        .await
        .unwrap()
        .into_inner();
    assert!(!upload.blob_key.is_empty());

    cluster.runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_deregister_application_reaches_backend() {
    let cluster = TestClusterBuilder::default().start().await;
    cluster
        .client()
        .deregister_application(gen::DeregisterApplicationRequest {
            resource_manager_id: cluster.token(),
            status: capstan_control::proto::capstan::common::ApplicationStatus::Succeeded as i32,
            diagnostics: Some("all jobs finished".to_string()),
        })
        .await
        .unwrap();
    wait_until("the backend to observe the deregistration", || {
        !lock(&cluster.backend.deregistrations).is_empty()
    })
    .await;

    cluster.runner.shutdown().await.unwrap();
}
