//! Image retention: decides which owned images have outlived their
//! environment's window and tears them down.
//!
//! Deletion happens in two steps per image. The image is deregistered
//! first, then each backing snapshot is deleted on its own, so a stuck
//! snapshot never blocks its siblings or the next image. There is no
//! rollback; a partially cleaned image is reported and left as is.

mod engine;
mod report;

pub use engine::{
    CREATION_DATE_FORMAT, Evaluation, RetentionEngine, RetentionError, parse_creation_date,
};
pub use report::{
    ImageOutcome, ImageReport, KeepReason, ReclaimReport, SnapshotFailure, Teardown,
};
