//! Live detection session: the reference image, a single-flight frame gate
//! and the per-frame pipeline call.

mod worker;

pub use worker::{DetectionWorker, WorkerConfig, WorkerStats};

use image::RgbImage;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::detection::{DetectError, Detection, FlawBox, FlawDetector};
use crate::output::Overlay;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No reference; frames pass through untouched.
    Idle,
    /// Reference set, waiting for the next frame.
    ReferenceSet,
    /// A frame is in the pipeline; new frames are dropped.
    Processing,
}

/// Single-flight guard implementing drop-latest backpressure.
#[derive(Debug, Default)]
pub struct FrameGate {
    busy: Arc<AtomicBool>,
}

impl FrameGate {
    /// Claim the gate, or `None` if a frame is already in flight.
    pub fn try_enter(&self) -> Option<FrameTicket> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FrameTicket {
                busy: Arc::clone(&self.busy),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Proof that a frame was admitted. Reopens the gate when dropped, so it can
/// travel to the processing thread with its frame.
#[derive(Debug)]
pub struct FrameTicket {
    busy: Arc<AtomicBool>,
}

impl Drop for FrameTicket {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// What happened to an admitted frame.
#[derive(Debug)]
pub enum FrameOutcome {
    NoReference { frame_size: (u32, u32) },
    Detected(Detection),
    /// Pipeline failed for this frame; nothing is reported.
    Skipped {
        frame_size: (u32, u32),
        error: DetectError,
    },
}

impl FrameOutcome {
    pub fn boxes(&self) -> &[FlawBox] {
        match self {
            FrameOutcome::Detected(detection) => &detection.boxes,
            _ => &[],
        }
    }

    pub fn frame_size(&self) -> (u32, u32) {
        match self {
            FrameOutcome::NoReference { frame_size } => *frame_size,
            FrameOutcome::Detected(detection) => detection.frame_size,
            FrameOutcome::Skipped { frame_size, .. } => *frame_size,
        }
    }

    pub fn overlay(&self) -> Overlay {
        let (width, height) = self.frame_size();
        Overlay::new(self.boxes().to_vec(), width, height)
    }
}

pub struct Session {
    detector: FlawDetector,
    reference: RwLock<Option<Arc<RgbImage>>>,
    /// Bumped under the reference write lock on every change.
    generation: AtomicU64,
    latest: Mutex<Option<Arc<RgbImage>>>,
    gate: FrameGate,
}

impl Session {
    pub fn new(detector: FlawDetector) -> Self {
        Self {
            detector,
            reference: RwLock::new(None),
            generation: AtomicU64::new(0),
            latest: Mutex::new(None),
            gate: FrameGate::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        if self.gate.is_busy() {
            SessionState::Processing
        } else if self.reference.read().is_some() {
            SessionState::ReferenceSet
        } else {
            SessionState::Idle
        }
    }

    pub fn has_reference(&self) -> bool {
        self.reference.read().is_some()
    }

    /// Changes whenever the reference is set, captured or cleared. Results
    /// computed under an older generation describe a reference that is gone.
    pub fn reference_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn replace_reference(&self, image: Option<Arc<RgbImage>>) -> Option<Arc<RgbImage>> {
        let mut reference = self.reference.write();
        self.generation.fetch_add(1, Ordering::AcqRel);
        std::mem::replace(&mut *reference, image)
    }

    /// Replace the reference. Frames already in flight finish against the
    /// reference they started with.
    pub fn set_reference(&self, image: RgbImage) {
        let (width, height) = image.dimensions();
        self.replace_reference(Some(Arc::new(image)));
        tracing::info!("Reference set ({}x{})", width, height);
    }

    /// Use the most recently observed frame as the reference.
    /// Returns `false` when no frame has been seen yet.
    pub fn capture_reference(&self) -> bool {
        let latest = self.latest.lock().clone();
        match latest {
            Some(frame) => {
                let (width, height) = frame.dimensions();
                self.replace_reference(Some(frame));
                tracing::info!("Reference captured from live frame ({}x{})", width, height);
                true
            }
            None => {
                tracing::warn!("No frame captured yet, reference unchanged");
                false
            }
        }
    }

    pub fn clear_reference(&self) {
        if self.replace_reference(None).is_some() {
            tracing::info!("Reference cleared");
        }
    }

    /// Remember `frame` as the candidate for [`Session::capture_reference`].
    pub fn observe(&self, frame: Arc<RgbImage>) {
        *self.latest.lock() = Some(frame);
    }

    /// Admit a frame unless one is already being processed.
    pub fn try_admit(&self) -> Option<FrameTicket> {
        self.gate.try_enter()
    }

    /// Run the pipeline on an admitted frame. The gate reopens when this returns.
    pub fn process(&self, frame: &RgbImage, ticket: FrameTicket) -> FrameOutcome {
        let _ticket = ticket;
        let frame_size = frame.dimensions();

        let reference = self.reference.read().clone();
        let Some(reference) = reference else {
            return FrameOutcome::NoReference { frame_size };
        };

        match self.detector.detect(&reference, frame) {
            Ok(detection) => FrameOutcome::Detected(detection),
            Err(error) => {
                if error.is_recoverable() {
                    tracing::warn!("Skipping frame: {}", error);
                } else {
                    tracing::error!("Skipping frame: {}", error);
                }
                FrameOutcome::Skipped { frame_size, error }
            }
        }
    }

    /// [`Session::try_admit`] then [`Session::process`]; `None` if dropped.
    pub fn try_process(&self, frame: &RgbImage) -> Option<FrameOutcome> {
        let ticket = self.try_admit()?;
        Some(self.process(frame, ticket))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::test_utils::{blocky_rgb, uniform, with_square};
    use crate::detection::RegistrationError;

    fn session() -> Session {
        Session::new(FlawDetector::default())
    }

    #[test]
    fn state_follows_reference_and_gate() {
        let session = session();
        assert_eq!(session.state(), SessionState::Idle);

        session.set_reference(uniform(8, 8, [1, 2, 3]));
        assert_eq!(session.state(), SessionState::ReferenceSet);

        let ticket = session.try_admit().unwrap();
        assert_eq!(session.state(), SessionState::Processing);
        drop(ticket);
        assert_eq!(session.state(), SessionState::ReferenceSet);

        session.clear_reference();
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn every_reference_change_advances_generation() {
        let session = session();
        let start = session.reference_generation();

        session.set_reference(uniform(8, 8, [1, 2, 3]));
        let after_set = session.reference_generation();
        assert!(after_set > start);

        session.clear_reference();
        let after_clear = session.reference_generation();
        assert!(after_clear > after_set);

        assert!(!session.capture_reference());
        assert_eq!(session.reference_generation(), after_clear);

        session.observe(Arc::new(uniform(8, 8, [4, 5, 6])));
        assert!(session.capture_reference());
        assert!(session.reference_generation() > after_clear);
    }

    #[test]
    fn second_frame_is_dropped_while_one_is_in_flight() {
        let session = session();
        let first = session.try_admit();
        assert!(first.is_some());
        assert!(session.try_admit().is_none());
        assert!(session.try_process(&uniform(4, 4, [0, 0, 0])).is_none());

        drop(first);
        assert!(session.try_admit().is_some());
    }

    #[test]
    fn ticket_reopens_gate_from_another_thread() {
        let session = session();
        let ticket = session.try_admit().unwrap();
        std::thread::spawn(move || drop(ticket)).join().unwrap();
        assert!(!session.gate.is_busy());
    }

    #[test]
    fn frames_without_reference_report_nothing() {
        let session = session();
        let outcome = session.try_process(&uniform(40, 30, [9, 9, 9])).unwrap();
        assert!(matches!(outcome, FrameOutcome::NoReference { .. }));
        assert_eq!(outcome.overlay(), Overlay::empty(40, 30));
    }

    #[test]
    fn capture_reference_uses_latest_frame() {
        let session = session();
        assert!(!session.capture_reference());

        let frame = blocky_rgb(160, 120, 5);
        session.observe(Arc::new(frame.clone()));
        assert!(session.capture_reference());

        let outcome = session.try_process(&frame).unwrap();
        match outcome {
            FrameOutcome::Detected(detection) => assert!(detection.boxes.is_empty()),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn registration_failure_skips_frame_with_empty_boxes() {
        let session = session();
        let reference = uniform(160, 120, [100, 100, 100]);
        session.set_reference(reference.clone());

        let frame = with_square(&reference, 40, 40, 30, [220, 220, 220]);
        let outcome = session.try_process(&frame).unwrap();
        assert!(matches!(
            outcome,
            FrameOutcome::Skipped {
                error: DetectError::Registration(RegistrationError::DegenerateInput { .. }),
                ..
            }
        ));
        assert!(outcome.boxes().is_empty());
        assert_eq!(session.state(), SessionState::ReferenceSet);
    }
}
