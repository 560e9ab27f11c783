use fdeploy::{progress::Stage, MAINTENANCE_MARKER};
use fdeploy_engine::Phase;

use crate::{
    dataset::{Dataset, Patch},
    harness, harness_with,
    harness::names,
    utils,
};

#[tokio::test]
async fn plan_of_default_dataset() {
    let harness = harness(Dataset::default()).await;
    let plan = harness.plan().await;

    assert_eq!(names(&plan.online_copy), ["assets/app.css"]);
    assert_eq!(names(&plan.offline_copy), ["bin/Web.dll", "index.html"]);
    // `uploads` holds the preserved `uploads/keep`, `stale` covers its content
    assert_eq!(names(&plan.orphans), ["old.txt", "stale", "uploads/tmp.txt"]);
}

#[tokio::test]
async fn end_to_end() {
    let harness = harness(Dataset::default()).await;
    let report = harness.run().await;

    assert!(report.is_success(), "{:?}", report.errors);
    assert_eq!(report.reached, Phase::Online);
    assert_eq!(report.copied, 3);
    assert_eq!(report.deleted, 3);
    assert!(report.downtime.is_some());
    assert!(harness.recorder.downtime_reported());

    assert_eq!(
        harness.server_content("index.html").await.as_deref(),
        Some("<html>v2</html>")
    );
    assert_eq!(
        utils::mtime(&harness.server_path("index.html")),
        utils::mtime(&harness.config.paths.publish_path.join("index.html"))
    );
    assert_eq!(
        harness.server_content("bin/Web.dll").await.as_deref(),
        Some("dll v2")
    );
    assert_eq!(harness.server_content("logo.png").await.as_deref(), Some("PNG"));
    assert!(harness.has_server("assets/app.css"));

    assert!(!harness.has_server("old.txt"));
    assert!(!harness.has_server("stale"));
    assert!(!harness.has_server("uploads/tmp.txt"));
    assert!(harness.has_server("uploads/keep/u.bin"));
    assert!(harness.has_server("logs/today.log"));
    assert!(!harness.has_marker());
}

#[tokio::test]
async fn marker_only_during_offline_window() {
    let harness = harness(Dataset::default()).await;
    let report = harness.run().await;
    assert!(report.is_success(), "{:?}", report.errors);

    let writes = harness.writes();
    assert_eq!(writes.len(), 3);
    for (path, offline) in writes {
        let online_safe = path.starts_with("www/assets");
        assert_eq!(offline, !online_safe, "{path} written with offline={offline}");
    }
    assert!(!harness.has_marker());
}

#[tokio::test]
async fn second_run_is_idempotent() {
    let harness = harness_with(Dataset::default(), |config| {
        config.paths.always_overwrite_paths.clear();
    })
    .await;
    let report = harness.run().await;
    assert!(report.is_success(), "{:?}", report.errors);
    assert_eq!(report.copied, 3);

    let plan = harness.plan().await;
    assert_eq!(plan.copy_len(), 0);
    assert!(plan.orphans.is_empty());
}

#[tokio::test]
async fn always_overwrite_copies_again() {
    let harness = harness(Dataset::default()).await;
    assert!(harness.run().await.is_success());

    let plan = harness.plan().await;
    assert!(plan.online_copy.is_empty());
    assert_eq!(names(&plan.offline_copy), ["bin/Web.dll"]);
    assert!(plan.orphans.is_empty());
}

#[tokio::test]
async fn root_recursive_overwrite() {
    let harness = harness_with(Dataset::default(), |config| {
        config.paths.always_overwrite_paths_with_recurse = vec!["~".into()];
    })
    .await;
    let plan = harness.plan().await;
    assert_eq!(
        names(&plan.offline_copy),
        ["bin/Web.dll", "index.html", "logo.png"]
    );
}

#[tokio::test]
async fn online_partition_is_segment_aware() {
    let dataset =
        Dataset::default().apply_publish(Patch::Put("assets2/app.css".into(), "x".into(), 0));
    let harness = harness(dataset).await;
    let plan = harness.plan().await;
    assert_eq!(names(&plan.online_copy), ["assets/app.css"]);
    assert_eq!(
        names(&plan.offline_copy),
        ["assets2/app.css", "bin/Web.dll", "index.html"]
    );
}

#[tokio::test]
async fn retry_exhaustion_fails_the_run() {
    let harness = harness(Dataset::default()).await;
    harness.stub.fail_writes("index.html", u32::MAX);

    let report = harness.run().await;

    assert_eq!(report.phase, Phase::Failed);
    assert_eq!(report.reached, Phase::OfflineCopy);
    assert_eq!(harness.stub.write_attempts("index.html"), 3);
    assert_eq!(harness.recorder.retries(Stage::OfflineCopy), 2);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("index.html"), "{}", report.errors[0]);

    // the site stays offline and nothing is deleted
    assert!(report.marker_left);
    assert!(harness.has_marker());
    assert!(report.downtime.is_none());
    assert!(harness.has_server("old.txt"));
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let harness = harness(Dataset::default()).await;
    harness.stub.fail_writes("Web.dll", 2);

    let report = harness.run().await;

    assert!(report.is_success(), "{:?}", report.errors);
    assert_eq!(harness.stub.write_attempts("Web.dll"), 3);
    assert_eq!(harness.recorder.retries(Stage::OfflineCopy), 2);
    assert_eq!(
        harness.server_content("bin/Web.dll").await.as_deref(),
        Some("dll v2")
    );
}

#[tokio::test]
async fn marker_write_failure_keeps_site_online() {
    let harness = harness(Dataset::default()).await;
    harness.stub.fail_writes(MAINTENANCE_MARKER, u32::MAX);

    let report = harness.run().await;

    assert_eq!(report.phase, Phase::Failed);
    assert_eq!(report.reached, Phase::Offline);
    assert!(!report.marker_left);
    assert!(!harness.has_marker());
    // online files were already delivered, the rest was not touched
    assert!(harness.has_server("assets/app.css"));
    assert_eq!(
        harness.server_content("index.html").await.as_deref(),
        Some("<html>v1</html>")
    );
}

#[tokio::test]
async fn stale_marker_is_replaced_then_removed() {
    let dataset =
        Dataset::default().apply_server(Patch::Put(MAINTENANCE_MARKER.into(), "stale".into(), 0));
    let harness = harness(dataset).await;
    assert!(harness.has_marker());

    let plan = harness.plan().await;
    assert!(!names(&plan.orphans).iter().any(|p| p == MAINTENANCE_MARKER));

    let report = harness.run().await;
    assert!(report.is_success(), "{:?}", report.errors);
    assert!(!harness.has_marker());
}

#[tokio::test]
async fn without_offline_window() {
    let harness = harness_with(Dataset::default(), |config| {
        config.take_server_offline = false;
    })
    .await;

    let report = harness.run().await;

    assert!(report.is_success(), "{:?}", report.errors);
    assert!(report.downtime.is_none());
    assert_eq!(harness.stub.write_attempts(MAINTENANCE_MARKER), 0);
    assert!(harness.writes().iter().all(|(_, offline)| !offline));
    assert_eq!(
        harness.server_content("index.html").await.as_deref(),
        Some("<html>v2</html>")
    );
}

#[tokio::test]
async fn orphans_kept_when_disabled() {
    let harness = harness_with(Dataset::default(), |config| {
        config.delete_orphans = false;
    })
    .await;

    let report = harness.run().await;

    assert!(report.is_success(), "{:?}", report.errors);
    assert_eq!(report.deleted, 0);
    assert!(harness.has_server("old.txt"));
    assert!(harness.has_server("stale/deep/b.txt"));
}

#[tokio::test]
async fn size_only_comparison() {
    let dataset = Dataset::default().apply_server(Patch::Put(
        "index.html".into(),
        "<html>v2</html>".into(),
        7200,
    ));
    let harness = harness_with(dataset, |config| {
        config.compare_file_dates = false;
        config.paths.always_overwrite_paths.clear();
    })
    .await;

    let plan = harness.plan().await;
    // same size, older date: left alone
    assert!(plan.offline_copy.is_empty());
    assert_eq!(names(&plan.online_copy), ["assets/app.css"]);
}
