use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use rstest::rstest;

use crate::{
    config::{AppConfig, RetentionSafety},
    gateway::{GatewayCall, InstanceState, ManagedImage, ManagedInstance, MemoryGateway, Operation},
    policy::{InstanceGroups, RetentionPolicy, TagScheme},
    producer::ImageProducer,
    resolver::InstanceResolver,
    retention::{ImageOutcome, KeepReason, RetentionEngine},
};

// =============================================================================
// Fixtures
// =============================================================================

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 15, 8, 0, 0).unwrap()
}

struct ImageSpec<'a> {
    id: &'a str,
    owner: Option<&'a str>,
    environment: Option<&'a str>,
    age: TimeDelta,
    snapshots: &'a [&'a str],
}

impl ImageSpec<'_> {
    fn build(&self) -> ManagedImage {
        let mut tags = BTreeMap::new();
        if let Some(owner) = self.owner {
            tags.insert("CreatedBy".to_string(), owner.to_string());
        }
        if let Some(env) = self.environment {
            tags.insert("Environment".to_string(), env.to_string());
        }
        ManagedImage {
            image_id: self.id.to_string(),
            creation_date: (now() - self.age)
                .format("%Y-%m-%dT%H:%M:%S%.3fZ")
                .to_string(),
            tags,
            snapshot_ids: self.snapshots.iter().map(|s| s.to_string()).collect(),
        }
    }
}

fn owned<'a>(
    id: &'a str,
    environment: Option<&'a str>,
    age: TimeDelta,
    snapshots: &'a [&'a str],
) -> ImageSpec<'a> {
    ImageSpec {
        id,
        owner: Some("LambdaAutomation"),
        environment,
        age,
        snapshots,
    }
}

fn hours_f(h: f64) -> TimeDelta {
    TimeDelta::milliseconds((h * 3_600_000.0).round() as i64)
}

fn dev_prod_policy() -> RetentionPolicy {
    RetentionPolicy::from_hours([("dev", 10), ("prod", 168)]).unwrap()
}

fn engine(gateway: &Arc<MemoryGateway>) -> RetentionEngine {
    RetentionEngine::new(gateway.clone(), dev_prod_policy(), TagScheme::default())
}

fn gateway_with(images: &[ImageSpec<'_>]) -> Arc<MemoryGateway> {
    let gateway = MemoryGateway::new();
    for spec in images {
        gateway.insert_image(spec.build());
    }
    Arc::new(gateway)
}

// =============================================================================
// Retention scenarios
// =============================================================================

#[tokio::test]
async fn test_mixed_fleet_reclaim() {
    let gateway = gateway_with(&[
        owned("ami-a", Some("dev"), hours_f(9.9), &["snap-a"]),
        owned("ami-b", Some("dev"), hours_f(10.0), &["snap-b1", "snap-b2"]),
        owned("ami-c", Some("prod"), hours_f(100.0), &["snap-c"]),
        owned("ami-d", None, hours_f(1000.0), &["snap-d"]),
    ]);

    let report = engine(&gateway).reclaim_at(now()).await.unwrap();

    assert_eq!(
        report.outcome("ami-a"),
        Some(&ImageOutcome::Kept {
            reason: KeepReason::TooYoung
        })
    );
    assert_eq!(
        report.outcome("ami-b"),
        Some(&ImageOutcome::Deleted {
            snapshots_deleted: vec!["snap-b1".into(), "snap-b2".into()]
        })
    );
    assert_eq!(
        report.outcome("ami-c"),
        Some(&ImageOutcome::Kept {
            reason: KeepReason::TooYoung
        })
    );
    assert_eq!(
        report.outcome("ami-d"),
        Some(&ImageOutcome::Kept {
            reason: KeepReason::UnmanagedEnvironment
        })
    );

    assert_eq!(gateway.image_ids(), vec!["ami-a", "ami-c", "ami-d"]);
    assert_eq!(gateway.snapshot_ids(), vec!["snap-a", "snap-c", "snap-d"]);
    assert_eq!(report.deleted_count(), 1);
    assert_eq!(report.kept_count(), 3);
    assert!(!report.has_failures());
}

#[tokio::test]
async fn test_second_cycle_is_a_no_op() {
    let gateway = gateway_with(&[
        owned("ami-old", Some("dev"), TimeDelta::hours(48), &["snap-1"]),
        owned("ami-new", Some("dev"), TimeDelta::hours(1), &["snap-2"]),
    ]);
    let engine = engine(&gateway);

    let first = engine.reclaim_at(now()).await.unwrap();
    assert_eq!(first.deleted_count(), 1);

    gateway.clear_calls();
    let second = engine.reclaim_at(now()).await.unwrap();

    assert!(!second.has_deletions());
    assert_eq!(gateway.calls(), vec![GatewayCall::ListImages]);
}

#[tokio::test]
async fn test_foreign_images_are_never_touched() {
    let gateway = gateway_with(&[
        ImageSpec {
            id: "ami-foreign",
            owner: Some("SomeoneElse"),
            environment: Some("dev"),
            age: TimeDelta::days(3650),
            snapshots: &["snap-foreign"],
        },
        ImageSpec {
            id: "ami-untagged",
            owner: None,
            environment: Some("dev"),
            age: TimeDelta::days(3650),
            snapshots: &["snap-untagged"],
        },
        owned("ami-ours", Some("dev"), TimeDelta::days(3650), &["snap-ours"]),
    ]);

    let report = engine(&gateway).reclaim_at(now()).await.unwrap();

    assert_eq!(report.images.len(), 1);
    assert!(report.get("ami-foreign").is_none());
    assert_eq!(gateway.image_ids(), vec!["ami-foreign", "ami-untagged"]);
    assert!(gateway.has_snapshot("snap-foreign"));
    assert!(gateway.has_snapshot("snap-untagged"));
    for call in gateway.calls() {
        assert!(
            !matches!(&call, GatewayCall::DeregisterImage(id) if id != "ami-ours"),
            "unexpected destructive call {call:?}"
        );
    }
}

#[tokio::test]
async fn test_middle_snapshot_failure_is_isolated() {
    let gateway = gateway_with(&[owned(
        "ami-x",
        Some("dev"),
        TimeDelta::hours(24),
        &["snap-1", "snap-2", "snap-3"],
    )]);
    gateway.fail_on(Operation::DeleteSnapshot, Some("snap-2"));

    let report = engine(&gateway).reclaim_at(now()).await.unwrap();

    assert!(!gateway.has_image("ami-x"));
    assert!(!gateway.has_snapshot("snap-1"));
    assert!(gateway.has_snapshot("snap-2"));
    assert!(!gateway.has_snapshot("snap-3"));
    assert_eq!(report.outcome("ami-x").map(|o| o.label()), Some("partially_cleaned"));

    // Deregistered images are no longer listed, so the leftover is not retried
    gateway.clear_failures();
    gateway.clear_calls();
    let again = engine(&gateway).reclaim_at(now()).await.unwrap();
    assert!(again.images.is_empty());
    assert!(gateway.has_snapshot("snap-2"));
}

#[rstest]
#[case::unknown_label(Some("staging"))]
#[case::missing_label(None)]
#[tokio::test]
async fn test_unknown_environment_survives_any_age(#[case] environment: Option<&str>) {
    let gateway = gateway_with(&[owned("ami-x", environment, TimeDelta::days(365 * 30), &["snap-x"])]);

    let report = engine(&gateway).reclaim_at(now()).await.unwrap();

    assert_eq!(
        report.outcome("ami-x"),
        Some(&ImageOutcome::Kept {
            reason: KeepReason::UnmanagedEnvironment
        })
    );
    assert!(gateway.has_image("ami-x"));
}

#[rstest]
#[case::dev_below(Some("dev"), TimeDelta::hours(10) - TimeDelta::milliseconds(1), false)]
#[case::dev_at(Some("dev"), TimeDelta::hours(10), true)]
#[case::prod_below(Some("prod"), TimeDelta::hours(167), false)]
#[case::prod_at(Some("prod"), TimeDelta::hours(168), true)]
#[tokio::test]
async fn test_retention_boundary(
    #[case] environment: Option<&str>,
    #[case] age: TimeDelta,
    #[case] deleted: bool,
) {
    let gateway = gateway_with(&[owned("ami-x", environment, age, &[])]);

    engine(&gateway).reclaim_at(now()).await.unwrap();

    assert_eq!(!gateway.has_image("ami-x"), deleted);
}

#[tokio::test]
async fn test_one_bad_image_does_not_stop_the_cycle() {
    let mut broken = owned("ami-2", Some("dev"), TimeDelta::hours(30), &[]).build();
    broken.creation_date = "2025-13-45T99:00:00.000Z".into();

    let gateway = gateway_with(&[
        owned("ami-1", Some("dev"), TimeDelta::hours(30), &["snap-1"]),
        owned("ami-3", Some("dev"), TimeDelta::hours(30), &["snap-3"]),
        owned("ami-4", Some("prod"), TimeDelta::hours(300), &["snap-4"]),
    ]);
    gateway.insert_image(broken);
    gateway.fail_on(Operation::DeregisterImage, Some("ami-1"));

    let report = engine(&gateway).reclaim_at(now()).await.unwrap();

    assert_eq!(report.outcome("ami-1").map(|o| o.label()), Some("deregister_failed"));
    assert_eq!(report.outcome("ami-2").map(|o| o.label()), Some("invalid_timestamp"));
    assert_eq!(report.outcome("ami-3").map(|o| o.label()), Some("deleted"));
    assert_eq!(report.outcome("ami-4").map(|o| o.label()), Some("deleted"));
    assert_eq!(report.failure_count(), 2);
    assert_eq!(gateway.image_ids(), vec!["ami-1", "ami-2"]);
    assert!(gateway.has_snapshot("snap-1"));
}

#[tokio::test]
async fn test_zero_duration_truncates_nothing() {
    let gateway = gateway_with(&[owned("ami-old", Some("dev"), TimeDelta::hours(30), &[])]);
    let engine = engine(&gateway).with_safety(RetentionSafety {
        max_duration_secs: 0,
        ..Default::default()
    });

    let report = engine.reclaim_at(now()).await.unwrap();

    assert!(!report.truncated);
    assert_eq!(report.unevaluated, 0);
    assert_eq!(report.deleted_count(), 1);
}

// =============================================================================
// Create then reclaim
// =============================================================================

#[tokio::test]
async fn test_created_images_are_reclaimed_once_expired() {
    let config = AppConfig::from_str(
        r#"
        [environments.dev]
        instances = ["dev-ec2", "ghost-instance"]
        retention_hours = 10

        [environments.prod]
        instances = ["i-0prod"]
        retention_hours = 168
    "#,
    )
    .unwrap();

    let gateway = Arc::new(
        MemoryGateway::new()
            .with_instance(
                ManagedInstance::new("i-0304c8ad0d646a745", InstanceState::Running)
                    .with_name("dev-ec2"),
            )
            .with_instance(ManagedInstance::new("i-0prod", InstanceState::Stopped)),
    );
    let tags = TagScheme::from(&config.tags);

    let producer = ImageProducer::new(gateway.clone(), tags.clone());
    let resolver = InstanceResolver::new(gateway.clone());
    let created = producer
        .run_create_cycle(&InstanceGroups::from_config(&config), &resolver)
        .await
        .unwrap();

    assert_eq!(created.started_count(), 2);
    assert_eq!(gateway.image_ids().len(), 2);

    let engine = RetentionEngine::new(gateway.clone(), RetentionPolicy::from_config(&config), tags);

    // Freshly created images are too young everywhere
    let report = engine.reclaim().await.unwrap();
    assert!(!report.has_deletions());

    // Half a day later only the dev image has expired
    let report = engine
        .reclaim_at(Utc::now() + TimeDelta::hours(12))
        .await
        .unwrap();
    assert_eq!(report.deleted_count(), 1);
    let remaining = gateway.image_ids();
    assert_eq!(remaining.len(), 1);
    assert_eq!(
        gateway.image(&remaining[0]).unwrap().tag("Environment"),
        Some("prod")
    );
    assert_eq!(gateway.snapshot_ids().len(), 1);
}
