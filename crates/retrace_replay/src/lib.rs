//! RETRACE Replay Diagnostics
//!
//! Divergence detection for replays: call trace comparison against the
//! recording, divergence reports with the common prefix and both tails,
//! and stack difference reports.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod detector;
pub mod diff;
pub mod trace;

pub use detector::{DetectorConfig, DivergenceDetector};
pub use diff::{DIVERGENCE_MARKER, DivergenceReport, StackDifference, common_prefix, common_prefix_all};
pub use trace::TraceEvent;
