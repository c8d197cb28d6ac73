//! Reference-vs-live flaw detection: ORB/RANSAC registration, change
//! detection, connected-component extraction and box merging, plus the
//! webcam session and v4l2loopback output around it.

pub mod capture;
pub mod detection;
pub mod output;
pub mod session;

pub use detection::{
    DetectError, Detection, FlawBox, FlawDetector, PipelineConfig, RegistrationError,
};
pub use session::{Session, SessionState};
