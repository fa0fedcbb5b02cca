//! Telemetry → interests: alarm normalization, detection, overlap merge.

pub mod alarms;
pub mod detector;
pub mod merge;

pub use alarms::{normalize, NormalizeOptions};
pub use detector::{canonicalize, Detection, InterestDetector};
pub use merge::{merge_overlapping, overlapping};
