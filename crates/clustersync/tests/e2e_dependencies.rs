//! End-to-end instantiation with an app dependency on a git-backed cluster.

mod common;

use common::harness::TEST_TIMEOUT;
use common::*;
use tokio_util::sync::CancellationToken;

use clustersync::context::AppContextStatus;
use clustersync::{ContextReference, ReportOutcome, StatusEventKind, WaitKind};

const DB_FILE: &str = "clusters/edge+c1/context/100/app/db/db-deploy.yaml";
const WEB_FILE: &str = "clusters/edge+c1/context/100/app/web/web-deploy.yaml";

async fn wait_for_event(
    events: &mut clustersync::notify::InstanceSubscription,
    app: &str,
    kind: StatusEventKind,
) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            if event.app == app && event.kind == kind {
                return;
            }
        }
        panic!("notifier closed before {} reached {:?}", app, kind);
    })
    .await
    .expect("timed out waiting for status event");
}

#[tokio::test]
async fn test_dependent_app_waits_for_ready_report() {
    let harness = TestHarness::new().await;
    let ctx = InstanceBuilder::new("100")
        .app("db", &["edge+c1"], &[("db-deploy", deployment_manifest("db"))])
        .app(
            "web",
            &["edge+c1"],
            &[
                ("web-deploy", deployment_manifest("web")),
                ("web-svc", service_manifest("web")),
            ],
        )
        .depends("web", "db", WaitKind::Ready)
        .build(&harness.store)
        .await;

    let mut events = harness.notifier.subscribe_instance("100");
    let engine = harness.engine.clone();
    let run = tokio::spawn(async move { engine.instantiate("100", &CancellationToken::new()).await });

    wait_for_event(&mut events, "db", StatusEventKind::Deployed).await;

    let files = harness.remote_files();
    assert!(files.contains(DB_FILE));
    assert!(files.contains("clusters/edge+c1/context/100/app/db/100-db.yaml"));
    assert!(!files.contains("app/web/"));

    let manager = harness
        .engine
        .dependencies()
        .get("100")
        .expect("dependency manager registered");
    assert_eq!(manager.pending("web"), 1);
    assert!(!run.is_finished());

    let outcome = harness
        .engine
        .handle_status_report("100", "db", "edge+c1", &deployment_report("db", 1))
        .await
        .unwrap();
    assert_eq!(outcome, ReportOutcome::ClusterReady { app_ready: true });

    tokio::time::timeout(TEST_TIMEOUT, run)
        .await
        .expect("instantiate did not finish")
        .expect("instantiate task panicked")
        .expect("instantiate failed");

    let files = harness.remote_files();
    assert!(files.contains(WEB_FILE));
    assert!(files.contains("clusters/edge+c1/context/100/app/web/web-svc.yaml"));
    let content = harness.remote_file(WEB_FILE).unwrap();
    assert!(content.contains("name: web"));

    let reference = ContextReference::from_context(ctx);
    assert_eq!(
        reference.context().get_status().await.unwrap(),
        Some(AppContextStatus::Instantiated)
    );
    assert!(harness.engine.dependencies().get("100").is_none());
    harness.shutdown().await;
}

#[tokio::test]
async fn test_later_unready_report_does_not_retract_release() {
    let harness = TestHarness::new().await;
    let ctx = InstanceBuilder::new("100")
        .app("db", &["edge+c1"], &[("db-deploy", deployment_manifest("db"))])
        .app("web", &["edge+c1"], &[("web-deploy", deployment_manifest("web"))])
        .depends("web", "db", WaitKind::Ready)
        .build(&harness.store)
        .await;

    let mut events = harness.notifier.subscribe_instance("100");
    let engine = harness.engine.clone();
    let run = tokio::spawn(async move { engine.instantiate("100", &CancellationToken::new()).await });

    wait_for_event(&mut events, "db", StatusEventKind::Deployed).await;
    harness
        .engine
        .handle_status_report("100", "db", "edge+c1", &deployment_report("db", 1))
        .await
        .unwrap();
    wait_for_event(&mut events, "db", StatusEventKind::Ready).await;
    tokio::time::timeout(TEST_TIMEOUT, run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let outcome = harness
        .engine
        .handle_status_report("100", "db", "edge+c1", &deployment_report("db", 0))
        .await
        .unwrap();
    assert_eq!(outcome, ReportOutcome::ClusterNotReady);

    let reference = ContextReference::from_context(ctx);
    assert!(!reference
        .get_cluster_resources_ready("db", "edge+c1")
        .await
        .unwrap());
    assert!(reference
        .get_cluster_resources_applied("web", "edge+c1")
        .await
        .unwrap());
    assert!(harness.remote_files().contains(WEB_FILE));
    assert_eq!(
        reference.context().get_status().await.unwrap(),
        Some(AppContextStatus::Instantiated)
    );
    harness.shutdown().await;
}

#[tokio::test]
async fn test_independent_apps_deploy_on_every_cluster() {
    let harness = TestHarness::new().await;
    InstanceBuilder::new("100")
        .app("db", &["edge+c1", "edge+c2"], &[("db-deploy", deployment_manifest("db"))])
        .app("cache", &["edge+c2"], &[("cache-svc", service_manifest("cache"))])
        .build(&harness.store)
        .await;

    tokio::time::timeout(
        TEST_TIMEOUT,
        harness.engine.instantiate("100", &CancellationToken::new()),
    )
    .await
    .unwrap()
    .unwrap();

    let files = harness.remote_files();
    assert!(files.contains(DB_FILE));
    assert!(files.contains("clusters/edge+c2/context/100/app/db/db-deploy.yaml"));
    assert!(files.contains("clusters/edge+c2/context/100/app/cache/cache-svc.yaml"));
    assert_eq!(harness.engine.supervisor().running(), 3);

    harness.engine.terminate("100").await.unwrap();
    let files = harness.remote_files();
    assert!(!files.contains("context/100/"));
    assert_eq!(harness.engine.supervisor().running(), 0);
}

#[tokio::test]
async fn test_failed_prerequisite_does_not_hang() {
    let harness = TestHarness::new().await;
    let ctx = InstanceBuilder::new("100")
        .app("db", &["edge+nowhere"], &[("db-deploy", deployment_manifest("db"))])
        .app("web", &["edge+c1"], &[("web-deploy", deployment_manifest("web"))])
        .depends("web", "db", WaitKind::Deployed)
        .build(&harness.store)
        .await;

    let err = tokio::time::timeout(
        TEST_TIMEOUT,
        harness.engine.instantiate("100", &CancellationToken::new()),
    )
    .await
    .expect("instantiate hung")
    .unwrap_err();

    assert_eq!(err.kind(), clustersync::ErrorKind::Configuration);
    assert!(!harness.remote_files().contains("app/web/"));
    assert_eq!(
        ctx.get_status().await.unwrap(),
        Some(AppContextStatus::InstantiateFailed)
    );
    harness.shutdown().await;
}
