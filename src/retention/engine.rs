//! Retention engine for reclaiming expired images.
//!
//! One cycle lists every image carrying this tool's owner marker, ages it
//! against its environment's retention window, and tears down expired
//! images: the image is deregistered first, then each backing snapshot is
//! deleted independently. Failures are confined to the image (or snapshot)
//! they occur on and recorded in the [`ReclaimReport`].

use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use thiserror::Error;
use tokio::time::Instant;

use super::report::{ImageOutcome, ImageReport, KeepReason, ReclaimReport, SnapshotFailure, Teardown};
use crate::{
    config::RetentionSafety,
    gateway::{GatewayError, ImageGateway, ManagedImage},
    policy::{RetentionPolicy, TagScheme},
};

/// Provider creation timestamp layout, e.g. `2024-05-01T12:00:00.000Z`.
///
/// The millisecond fraction is mandatory.
pub const CREATION_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S.%3fZ";

#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("failed to list owned images: {0}")]
    Listing(#[source] GatewayError),
}

/// Classification of one image before any destructive call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    Keep {
        reason: KeepReason,
        age: Option<TimeDelta>,
    },
    Eligible {
        age: TimeDelta,
    },
    InvalidTimestamp {
        error: String,
    },
}

pub fn parse_creation_date(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(value, CREATION_DATE_FORMAT).map(|dt| dt.and_utc())
}

fn age_hours(age: TimeDelta) -> f64 {
    age.num_milliseconds() as f64 / 3_600_000.0
}

pub struct RetentionEngine {
    gateway: Arc<dyn ImageGateway>,
    policy: RetentionPolicy,
    tags: TagScheme,
    safety: RetentionSafety,
}

impl RetentionEngine {
    pub fn new(gateway: Arc<dyn ImageGateway>, policy: RetentionPolicy, tags: TagScheme) -> Self {
        Self {
            gateway,
            policy,
            tags,
            safety: RetentionSafety::default(),
        }
    }

    pub fn with_safety(mut self, safety: RetentionSafety) -> Self {
        self.safety = safety;
        self
    }

    /// Run one reclaim cycle against the current time.
    pub async fn reclaim(&self) -> Result<ReclaimReport, RetentionError> {
        self.reclaim_at(Utc::now()).await
    }

    /// Run one reclaim cycle, aging images relative to `now`.
    ///
    /// Only a failed listing returns `Err`; every per-image failure is
    /// recorded in the report.
    pub async fn reclaim_at(&self, now: DateTime<Utc>) -> Result<ReclaimReport, RetentionError> {
        let images = self
            .gateway
            .list_owned_images(&self.tags.owner_filter())
            .await
            .map_err(RetentionError::Listing)?;

        let dry_run_msg = if self.safety.dry_run {
            " (DRY RUN)"
        } else {
            ""
        };

        tracing::info!(
            images = images.len(),
            owner_marker = %self.tags.owner_marker,
            dry_run = self.safety.dry_run,
            "Starting reclaim cycle{}",
            dry_run_msg
        );

        let start = Instant::now();
        let max_duration = self.safety.max_duration();
        let mut report = ReclaimReport::new(now, self.safety.dry_run);
        let mut teardowns: u64 = 0;

        for (index, image) in images.iter().enumerate() {
            if let Some(max_dur) = max_duration
                && start.elapsed() >= max_dur
            {
                report.truncated = true;
                report.unevaluated = images.len() - index;
                tracing::warn!(
                    processed = index,
                    remaining = report.unevaluated,
                    "Max reclaim duration exceeded, stopping early"
                );
                break;
            }

            let image_report = self.process(image, now, &mut teardowns).await;
            log_outcome(&image_report);
            report.images.push(image_report);
        }

        tracing::info!(
            evaluated = report.images.len(),
            deleted = report.deleted_count(),
            kept = report.kept_count(),
            failures = report.failure_count(),
            truncated = report.truncated,
            "Reclaim cycle complete{}",
            dry_run_msg
        );

        Ok(report)
    }

    /// Decide whether `image` is kept or eligible for deletion at `now`.
    ///
    /// Untagged images and environments without a retention window are
    /// always kept. Eligibility is inclusive: an image exactly as old as
    /// its window is eligible.
    pub fn evaluate(&self, image: &ManagedImage, now: DateTime<Utc>) -> Evaluation {
        let retention = match image
            .tag(&self.tags.environment_key)
            .and_then(|env| self.policy.retention_for(env))
        {
            Some(retention) => retention,
            None => {
                return Evaluation::Keep {
                    reason: KeepReason::UnmanagedEnvironment,
                    age: None,
                };
            }
        };

        let created = match parse_creation_date(&image.creation_date) {
            Ok(created) => created,
            Err(e) => {
                return Evaluation::InvalidTimestamp {
                    error: e.to_string(),
                };
            }
        };

        let age = now - created;
        if age < retention {
            Evaluation::Keep {
                reason: KeepReason::TooYoung,
                age: Some(age),
            }
        } else {
            Evaluation::Eligible { age }
        }
    }

    async fn process(
        &self,
        image: &ManagedImage,
        now: DateTime<Utc>,
        teardowns: &mut u64,
    ) -> ImageReport {
        let (age, outcome) = match self.evaluate(image, now) {
            Evaluation::Keep { reason, age } => (age, ImageOutcome::Kept { reason }),
            Evaluation::InvalidTimestamp { error } => (
                None,
                ImageOutcome::InvalidTimestamp {
                    value: image.creation_date.clone(),
                    error,
                },
            ),
            Evaluation::Eligible { age } => {
                let outcome = if self
                    .safety
                    .max_deletes()
                    .is_some_and(|max| *teardowns >= max)
                {
                    ImageOutcome::Kept {
                        reason: KeepReason::DeleteLimitReached,
                    }
                } else {
                    *teardowns += 1;
                    if self.safety.dry_run {
                        ImageOutcome::WouldDelete {
                            snapshots: image.snapshot_ids.clone(),
                        }
                    } else {
                        match self.teardown(image).await {
                            Ok(teardown) => ImageOutcome::from_teardown(teardown),
                            Err(e) => ImageOutcome::DeregisterFailed {
                                error: e.to_string(),
                            },
                        }
                    }
                };
                (Some(age), outcome)
            }
        };

        ImageReport {
            image_id: image.image_id.clone(),
            environment: image.tag(&self.tags.environment_key).map(str::to_string),
            age_hours: age.map(age_hours),
            outcome,
        }
    }

    /// Deregister `image`, then attempt every snapshot independently.
    ///
    /// Returns `Err` only when deregistration fails, in which case no
    /// snapshot is touched. Snapshot failures are collected, never raised,
    /// and do not undo the deregistration.
    #[tracing::instrument(skip(self, image), fields(image_id = %image.image_id))]
    pub async fn teardown(&self, image: &ManagedImage) -> Result<Teardown, GatewayError> {
        self.gateway.deregister_image(&image.image_id).await?;
        tracing::debug!("Deregistered image");

        let mut result = Teardown::default();
        for snapshot_id in &image.snapshot_ids {
            match self.gateway.delete_snapshot(snapshot_id).await {
                Ok(()) => {
                    tracing::debug!(snapshot_id = %snapshot_id, "Deleted snapshot");
                    result.deleted.push(snapshot_id.clone());
                }
                Err(e) => {
                    tracing::error!(
                        snapshot_id = %snapshot_id,
                        error = %e,
                        "Error deleting snapshot"
                    );
                    result.failed.push(SnapshotFailure {
                        snapshot_id: snapshot_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(result)
    }
}

fn log_outcome(report: &ImageReport) {
    let environment = report.environment.as_deref().unwrap_or("");
    let age_hours = report.age_hours.map(|h| format!("{h:.2}")).unwrap_or_default();

    match &report.outcome {
        ImageOutcome::Kept { reason } => tracing::info!(
            image_id = %report.image_id,
            environment,
            age_hours = %age_hours,
            outcome = report.outcome.label(),
            reason = ?reason,
            "Keeping image"
        ),
        ImageOutcome::WouldDelete { snapshots } => tracing::info!(
            image_id = %report.image_id,
            environment,
            age_hours = %age_hours,
            outcome = report.outcome.label(),
            snapshots = ?snapshots,
            "DRY RUN: Would deregister image and delete its snapshots"
        ),
        ImageOutcome::Deleted { snapshots_deleted } => tracing::info!(
            image_id = %report.image_id,
            environment,
            age_hours = %age_hours,
            outcome = report.outcome.label(),
            snapshots_deleted = snapshots_deleted.len(),
            "Deregistered image and deleted its snapshots"
        ),
        ImageOutcome::PartiallyCleaned {
            snapshots_deleted,
            snapshots_failed,
        } => tracing::warn!(
            image_id = %report.image_id,
            environment,
            age_hours = %age_hours,
            outcome = report.outcome.label(),
            snapshots_deleted = snapshots_deleted.len(),
            snapshots_failed = snapshots_failed.len(),
            "Deregistered image but some snapshots could not be deleted"
        ),
        ImageOutcome::DeregisterFailed { error } => tracing::error!(
            image_id = %report.image_id,
            environment,
            age_hours = %age_hours,
            outcome = report.outcome.label(),
            error = %error,
            "Failed to deregister image, snapshots left in place"
        ),
        ImageOutcome::InvalidTimestamp { value, error } => tracing::error!(
            image_id = %report.image_id,
            environment,
            creation_date = %value,
            outcome = report.outcome.label(),
            error = %error,
            "Skipping image with unparseable creation date"
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, time::Duration};

    use chrono::TimeZone;
    use rstest::rstest;

    use super::*;
    use crate::gateway::{GatewayCall, MemoryGateway, Operation};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn created(age: TimeDelta) -> String {
        (now() - age).format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
    }

    fn image(id: &str, env: Option<&str>, age: TimeDelta, snapshots: &[&str]) -> ManagedImage {
        let mut tags = BTreeMap::from([("CreatedBy".to_string(), "LambdaAutomation".to_string())]);
        if let Some(env) = env {
            tags.insert("Environment".to_string(), env.to_string());
        }
        ManagedImage {
            image_id: id.to_string(),
            creation_date: created(age),
            tags,
            snapshot_ids: snapshots.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn engine(gateway: Arc<MemoryGateway>) -> RetentionEngine {
        RetentionEngine::new(
            gateway,
            RetentionPolicy::from_hours([("dev", 10), ("prod", 168)]).unwrap(),
            TagScheme::default(),
        )
    }

    #[test]
    fn test_parse_creation_date() {
        let parsed = parse_creation_date("2024-05-01T12:30:45.123Z").unwrap();
        assert_eq!(parsed.timestamp_millis() % 1000, 123);
        assert_eq!(parsed.format("%H:%M:%S").to_string(), "12:30:45");
    }

    #[rstest]
    #[case("2024-05-01 12:30:45")]
    #[case::no_fraction("2024-05-01T12:30:45Z")]
    #[case::microseconds("2024-05-01T12:30:45.123456Z")]
    #[case::no_designator("2024-05-01T12:30:45.123")]
    #[case("2024-05-01T12:30:45.000+02:00")]
    #[case("not-a-date")]
    #[case("")]
    fn test_parse_creation_date_rejects_other_formats(#[case] value: &str) {
        assert!(parse_creation_date(value).is_err());
    }

    #[rstest]
    #[case::just_under(TimeDelta::minutes(9 * 60 + 54), false)]
    #[case::exactly_at_threshold(TimeDelta::hours(10), true)]
    #[case::one_millisecond_over(TimeDelta::hours(10) + TimeDelta::milliseconds(1), true)]
    #[case::far_over(TimeDelta::days(400), true)]
    fn test_dev_boundary(#[case] age: TimeDelta, #[case] eligible: bool) {
        let engine = engine(Arc::new(MemoryGateway::new()));
        let evaluation = engine.evaluate(&image("ami-1", Some("dev"), age, &[]), now());
        assert_eq!(matches!(evaluation, Evaluation::Eligible { .. }), eligible);
    }

    #[rstest]
    #[case::untagged(None)]
    #[case::unknown_environment(Some("staging"))]
    fn test_unmanaged_environment_kept_at_any_age(#[case] env: Option<&str>) {
        let engine = engine(Arc::new(MemoryGateway::new()));
        for age in [TimeDelta::zero(), TimeDelta::days(365), TimeDelta::days(365 * 50)] {
            let evaluation = engine.evaluate(&image("ami-1", env, age, &[]), now());
            assert_eq!(
                evaluation,
                Evaluation::Keep {
                    reason: KeepReason::UnmanagedEnvironment,
                    age: None
                }
            );
        }
    }

    #[test]
    fn test_future_creation_date_is_too_young() {
        let engine = engine(Arc::new(MemoryGateway::new()));
        let evaluation = engine.evaluate(&image("ami-1", Some("dev"), -TimeDelta::hours(1), &[]), now());
        assert!(matches!(
            evaluation,
            Evaluation::Keep {
                reason: KeepReason::TooYoung,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_deregisters_before_deleting_snapshots() {
        let gateway = Arc::new(MemoryGateway::new().with_image(image(
            "ami-old",
            Some("dev"),
            TimeDelta::hours(11),
            &["snap-1", "snap-2"],
        )));
        let report = engine(gateway.clone()).reclaim_at(now()).await.unwrap();

        assert_eq!(
            report.outcome("ami-old"),
            Some(&ImageOutcome::Deleted {
                snapshots_deleted: vec!["snap-1".into(), "snap-2".into()]
            })
        );
        assert_eq!(
            gateway.calls(),
            vec![
                GatewayCall::ListImages,
                GatewayCall::DeregisterImage("ami-old".into()),
                GatewayCall::DeleteSnapshot("snap-1".into()),
                GatewayCall::DeleteSnapshot("snap-2".into()),
            ]
        );
        assert!(gateway.snapshot_ids().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_failure_does_not_stop_siblings() {
        let gateway = Arc::new(MemoryGateway::new().with_image(image(
            "ami-old",
            Some("dev"),
            TimeDelta::hours(20),
            &["snap-1", "snap-2", "snap-3"],
        )));
        gateway.fail_on(Operation::DeleteSnapshot, Some("snap-2"));

        let report = engine(gateway.clone()).reclaim_at(now()).await.unwrap();

        match report.outcome("ami-old").unwrap() {
            ImageOutcome::PartiallyCleaned {
                snapshots_deleted,
                snapshots_failed,
            } => {
                assert_eq!(snapshots_deleted, &vec!["snap-1".to_string(), "snap-3".to_string()]);
                assert_eq!(snapshots_failed.len(), 1);
                assert_eq!(snapshots_failed[0].snapshot_id, "snap-2");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!gateway.has_image("ami-old"));
        assert_eq!(gateway.snapshot_ids(), vec!["snap-2"]);
        assert_eq!(report.failure_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_deregister_skips_snapshots() {
        let gateway = Arc::new(
            MemoryGateway::new()
                .with_image(image("ami-a", Some("dev"), TimeDelta::hours(30), &["snap-a"]))
                .with_image(image("ami-b", Some("dev"), TimeDelta::hours(30), &["snap-b"])),
        );
        gateway.fail_on(Operation::DeregisterImage, Some("ami-a"));

        let report = engine(gateway.clone()).reclaim_at(now()).await.unwrap();

        assert!(matches!(
            report.outcome("ami-a"),
            Some(ImageOutcome::DeregisterFailed { .. })
        ));
        assert!(matches!(report.outcome("ami-b"), Some(ImageOutcome::Deleted { .. })));
        assert!(gateway.has_image("ami-a"));
        assert!(gateway.has_snapshot("snap-a"));
        assert!(!gateway.calls().contains(&GatewayCall::DeleteSnapshot("snap-a".into())));
        assert_eq!(
            gateway
                .calls()
                .iter()
                .filter(|c| **c == GatewayCall::DeregisterImage("ami-a".into()))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_invalid_timestamp_is_isolated() {
        let mut broken = image("ami-broken", Some("dev"), TimeDelta::hours(50), &["snap-x"]);
        broken.creation_date = "yesterday".into();
        let gateway = Arc::new(
            MemoryGateway::new()
                .with_image(broken)
                .with_image(image("ami-old", Some("dev"), TimeDelta::hours(50), &[])),
        );

        let report = engine(gateway.clone()).reclaim_at(now()).await.unwrap();

        assert!(matches!(
            report.outcome("ami-broken"),
            Some(ImageOutcome::InvalidTimestamp { value, .. }) if value == "yesterday"
        ));
        assert!(matches!(report.outcome("ami-old"), Some(ImageOutcome::Deleted { .. })));
        assert!(gateway.has_image("ami-broken"));
    }

    #[tokio::test]
    async fn test_listing_failure_aborts_cycle() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.fail_on(Operation::ListImages, None);
        let err = engine(gateway).reclaim_at(now()).await.unwrap_err();
        assert!(matches!(err, RetentionError::Listing(_)));
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let gateway = Arc::new(MemoryGateway::new().with_image(image(
            "ami-old",
            Some("prod"),
            TimeDelta::hours(200),
            &["snap-1"],
        )));
        let engine = engine(gateway.clone()).with_safety(RetentionSafety {
            dry_run: true,
            ..Default::default()
        });

        let report = engine.reclaim_at(now()).await.unwrap();

        assert!(report.dry_run);
        assert_eq!(
            report.outcome("ami-old"),
            Some(&ImageOutcome::WouldDelete {
                snapshots: vec!["snap-1".into()]
            })
        );
        assert!(gateway.has_image("ami-old"));
        assert_eq!(gateway.calls(), vec![GatewayCall::ListImages]);
    }

    #[tokio::test]
    async fn test_delete_limit_keeps_remaining_eligible_images() {
        let gateway = Arc::new(
            MemoryGateway::new()
                .with_image(image("ami-1", Some("dev"), TimeDelta::hours(11), &[]))
                .with_image(image("ami-2", Some("dev"), TimeDelta::hours(12), &[]))
                .with_image(image("ami-3", Some("dev"), TimeDelta::hours(13), &[])),
        );
        let engine = engine(gateway.clone()).with_safety(RetentionSafety {
            max_deletes_per_run: 2,
            ..Default::default()
        });

        let report = engine.reclaim_at(now()).await.unwrap();

        assert_eq!(report.deleted_count(), 2);
        assert_eq!(
            report.outcome("ami-3"),
            Some(&ImageOutcome::Kept {
                reason: KeepReason::DeleteLimitReached
            })
        );
        assert_eq!(gateway.image_ids(), vec!["ami-3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_duration_leaves_remaining_images_for_next_cycle() {
        let gateway = Arc::new(
            MemoryGateway::new()
                .with_image(image("ami-1", Some("dev"), TimeDelta::hours(11), &["snap-1"]))
                .with_image(image("ami-2", Some("dev"), TimeDelta::hours(12), &["snap-2"]))
                .with_image(image("ami-3", Some("dev"), TimeDelta::hours(13), &["snap-3"]))
                .with_image(image("ami-4", Some("prod"), TimeDelta::hours(1), &["snap-4"])),
        );
        // Each teardown costs 600ms against a 1s budget: two fit, the third check trips
        gateway.delay(Operation::DeregisterImage, Duration::from_millis(600));
        let engine = engine(gateway.clone()).with_safety(RetentionSafety {
            max_duration_secs: 1,
            ..Default::default()
        });

        let report = engine.reclaim_at(now()).await.unwrap();

        assert!(report.truncated);
        assert_eq!(report.unevaluated, 2);
        assert_eq!(report.images.len(), 2);
        assert_eq!(report.deleted_count(), 2);
        assert!(report.get("ami-3").is_none());
        assert!(report.get("ami-4").is_none());

        assert_eq!(gateway.image_ids(), vec!["ami-3", "ami-4"]);
        assert!(gateway.has_snapshot("snap-3"));
        assert!(
            !gateway
                .calls()
                .contains(&GatewayCall::DeregisterImage("ami-3".into()))
        );

        // The next cycle picks up where this one stopped
        gateway.delay(Operation::DeregisterImage, Duration::ZERO);
        let next = engine.reclaim_at(now()).await.unwrap();
        assert!(!next.truncated);
        assert_eq!(
            next.outcome("ami-3"),
            Some(&ImageOutcome::Deleted {
                snapshots_deleted: vec!["snap-3".into()]
            })
        );
        assert_eq!(gateway.image_ids(), vec!["ami-4"]);
    }

    #[tokio::test]
    async fn test_report_carries_age_and_environment() {
        let gateway = Arc::new(MemoryGateway::new().with_image(image(
            "ami-young",
            Some("prod"),
            TimeDelta::hours(100),
            &[],
        )));
        let report = engine(gateway).reclaim_at(now()).await.unwrap();

        let entry = report.get("ami-young").unwrap();
        assert_eq!(entry.environment.as_deref(), Some("prod"));
        assert_eq!(entry.age_hours, Some(100.0));
        assert_eq!(
            entry.outcome,
            ImageOutcome::Kept {
                reason: KeepReason::TooYoung
            }
        );
    }
}
