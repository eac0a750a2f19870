#![forbid(unsafe_code)]
//! Test and benchmark support for disk-defrag.
//!
//! - [`fixture`] builds synthetic images: exact byte placement through
//!   [`SyntheticImage`], or whole populated images from [`FileShape`]s via
//!   [`ImageBuilder`], with sequential, reversed, explicit, or seeded-random
//!   block scattering.
//! - [`verify`] checks a defragmented image against its source without
//!   consulting the run's own report.
//!
//! The harness depends only on the decoding crates, never on the pipeline,
//! so the pipeline's tests can use it freely.

pub mod fixture;
pub mod verify;

pub use fixture::{FileShape, Geometry, ImageBuilder, Placement, SyntheticImage};
pub use verify::{CheckVerdict, VerifyReport, verify_defragmented};

/// Percentage of `part` in `total`, 0 when `total` is 0.
#[must_use]
#[expect(clippy::cast_precision_loss)] // display only
pub fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (part as f64 / total as f64) * 100.0
    }
}
