//! Capture and processing threads around a [`Session`].
//!
//! The capture thread paces the source, hands every frame to the sink with
//! the most recent overlay and offers frames to the processing thread through
//! the session's gate. Frames offered while a detection is running are
//! dropped, never queued.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{FrameOutcome, FrameTicket, Session};
use crate::capture::CaptureSource;
use crate::output::{OutputSink, Overlay};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Capture pacing.
    pub target_fps: u32,
    /// Log throughput every this many captured frames.
    pub stats_interval: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            target_fps: 30,
            stats_interval: 30,
        }
    }
}

/// Frame counters, reported on stop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub captured: u64,
    /// Offered while a detection was in flight.
    pub dropped: u64,
    pub processed: u64,
    /// Processed but failed in the pipeline (no registration, bad input).
    pub skipped: u64,
}

#[derive(Default)]
struct Shared {
    running: AtomicBool,
    captured: AtomicU64,
    dropped: AtomicU64,
    processed: AtomicU64,
    skipped: AtomicU64,
    /// Latest overlay and the reference generation it was computed under.
    overlay: Mutex<Option<(u64, Overlay)>>,
}

impl Shared {
    fn stats(&self) -> WorkerStats {
        WorkerStats {
            captured: self.captured.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

pub struct DetectionWorker {
    shared: Arc<Shared>,
    capture_thread: Option<JoinHandle<Result<()>>>,
    process_thread: Option<JoinHandle<()>>,
}

impl DetectionWorker {
    /// Spawn the capture and processing threads. The capture source is
    /// opened on its own thread; a failure to open it is returned here.
    pub fn start<F, C, O>(
        open_capture: F,
        sink: O,
        session: Arc<Session>,
        config: WorkerConfig,
    ) -> Result<Self>
    where
        F: FnOnce() -> Result<C> + Send + 'static,
        C: CaptureSource,
        O: OutputSink + Send + 'static,
    {
        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            ..Shared::default()
        });
        // The gate admits one frame at a time, so one slot never blocks.
        let (tx, rx) = sync_channel::<(Arc<RgbImage>, FrameTicket)>(1);
        let (ready_tx, ready_rx) = sync_channel::<()>(1);

        let process_thread = {
            let shared = Arc::clone(&shared);
            let session = Arc::clone(&session);
            std::thread::Builder::new()
                .name("flaw-detect".into())
                .spawn(move || process_loop(&session, &shared, rx))
                .context("Failed to spawn processing thread")?
        };

        let capture_thread = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("flaw-capture".into())
                .spawn(move || {
                    let result = open_capture().and_then(|capture| {
                        let _ = ready_tx.send(());
                        capture_loop(capture, sink, &session, &shared, &config, tx)
                    });
                    shared.running.store(false, Ordering::Release);
                    result
                })
                .context("Failed to spawn capture thread")?
        };

        let worker = Self {
            shared,
            capture_thread: Some(capture_thread),
            process_thread: Some(process_thread),
        };

        if ready_rx.recv().is_err() {
            // The capture thread ended before the source opened.
            return Err(match worker.stop() {
                Err(e) => e,
                Ok(_) => anyhow!("capture thread exited before opening its source"),
            });
        }

        tracing::info!("Detection worker started");
        Ok(worker)
    }

    /// False once stopped or after the capture loop failed.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> WorkerStats {
        self.shared.stats()
    }

    /// Stop both threads and wait for them. A capture or output failure that
    /// ended the loop early is returned here.
    pub fn stop(mut self) -> Result<WorkerStats> {
        self.shutdown()?;
        let stats = self.shared.stats();
        tracing::info!(
            "Detection worker stopped: captured={}, dropped={}, processed={}, skipped={}",
            stats.captured,
            stats.dropped,
            stats.processed,
            stats.skipped
        );
        Ok(stats)
    }

    fn shutdown(&mut self) -> Result<()> {
        self.shared.running.store(false, Ordering::Release);

        let capture_result = match self.capture_thread.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("capture thread panicked"))?,
            None => Ok(()),
        };
        // The capture thread owned the sender; the processing loop ends once it is gone.
        if let Some(handle) = self.process_thread.take() {
            handle
                .join()
                .map_err(|_| anyhow!("processing thread panicked"))?;
        }
        capture_result
    }
}

impl Drop for DetectionWorker {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!("Detection worker failed: {:#}", e);
        }
    }
}

fn capture_loop<C, O>(
    mut capture: C,
    mut sink: O,
    session: &Session,
    shared: &Shared,
    config: &WorkerConfig,
    tx: SyncSender<(Arc<RgbImage>, FrameTicket)>,
) -> Result<()>
where
    C: CaptureSource,
    O: OutputSink,
{
    let frame_duration = Duration::from_secs_f32(1.0 / config.target_fps.max(1) as f32);
    let stats_interval = config.stats_interval.max(1);
    let mut total_capture_time = Duration::ZERO;
    let mut total_output_time = Duration::ZERO;

    while shared.running.load(Ordering::Acquire) {
        let loop_start = Instant::now();

        let capture_start = Instant::now();
        let frame = Arc::new(capture.capture_frame().context("Failed to capture frame")?);
        total_capture_time += capture_start.elapsed();
        let captured = shared.captured.fetch_add(1, Ordering::Relaxed) + 1;

        session.observe(Arc::clone(&frame));

        match session.try_admit() {
            Some(ticket) => {
                if tx.send((Arc::clone(&frame), ticket)).is_err() {
                    anyhow::bail!("processing thread exited");
                }
            }
            None => {
                shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        let (width, height) = frame.dimensions();
        let generation = session.reference_generation();
        let overlay = match shared.overlay.lock().as_ref() {
            Some((computed_under, latest))
                if *computed_under == generation && session.has_reference() =>
            {
                latest.clone()
            }
            _ => Overlay::empty(width, height),
        };

        let output_start = Instant::now();
        sink.write_frame(&frame, &overlay)
            .context("Failed to write frame")?;
        total_output_time += output_start.elapsed();

        if captured % stats_interval == 0 {
            let avg_capture_ms = total_capture_time.as_secs_f64() * 1000.0 / captured as f64;
            let avg_output_ms = total_output_time.as_secs_f64() * 1000.0 / captured as f64;
            tracing::info!(
                "Frame {}: capture={:.1}ms, output={:.1}ms, processed={}, dropped={}, state={:?}",
                captured,
                avg_capture_ms,
                avg_output_ms,
                shared.processed.load(Ordering::Relaxed),
                shared.dropped.load(Ordering::Relaxed),
                session.state()
            );
        }

        let elapsed = loop_start.elapsed();
        if elapsed < frame_duration {
            std::thread::sleep(frame_duration - elapsed);
        }
    }

    Ok(())
}

fn process_loop(
    session: &Session,
    shared: &Shared,
    rx: Receiver<(Arc<RgbImage>, FrameTicket)>,
) {
    for (frame, ticket) in rx {
        let detect_start = Instant::now();
        // Read before processing: if the reference changes mid-frame the
        // result is tagged stale and never drawn.
        let generation = session.reference_generation();
        let outcome = session.process(&frame, ticket);
        shared.processed.fetch_add(1, Ordering::Relaxed);
        if matches!(outcome, FrameOutcome::Skipped { .. }) {
            shared.skipped.fetch_add(1, Ordering::Relaxed);
        }

        tracing::debug!(
            "Frame processed in {:.1}ms: {} boxes",
            detect_start.elapsed().as_secs_f64() * 1000.0,
            outcome.boxes().len()
        );

        *shared.overlay.lock() = Some((generation, outcome.overlay()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::test_utils::{blocky_rgb, with_square};
    use crate::detection::FlawDetector;

    struct StillSource {
        frame: RgbImage,
        fail_after: Option<u64>,
        served: u64,
    }

    impl StillSource {
        fn new(frame: RgbImage) -> Self {
            Self {
                frame,
                fail_after: None,
                served: 0,
            }
        }
    }

    impl CaptureSource for StillSource {
        fn capture_frame(&mut self) -> Result<RgbImage> {
            if self.fail_after.is_some_and(|n| self.served >= n) {
                anyhow::bail!("camera unplugged");
            }
            self.served += 1;
            Ok(self.frame.clone())
        }

        fn resolution(&self) -> (u32, u32) {
            self.frame.dimensions()
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        overlays: Arc<Mutex<Vec<Overlay>>>,
    }

    impl OutputSink for RecordingSink {
        fn write_frame(&mut self, _frame: &RgbImage, overlay: &Overlay) -> Result<()> {
            self.overlays.lock().push(overlay.clone());
            Ok(())
        }

        fn resolution(&self) -> (u32, u32) {
            (0, 0)
        }
    }

    fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    fn fast() -> WorkerConfig {
        WorkerConfig {
            target_fps: 200,
            stats_interval: 1000,
        }
    }

    #[test]
    fn frames_pass_through_without_reference() {
        let session = Arc::new(Session::new(FlawDetector::default()));
        let sink = RecordingSink::default();
        let overlays = Arc::clone(&sink.overlays);

        let source = StillSource::new(blocky_rgb(64, 48, 1));
        let worker = DetectionWorker::start(
            move || Ok(source),
            sink,
            Arc::clone(&session),
            fast(),
        )
        .unwrap();
        assert!(wait_for(Duration::from_secs(5), || overlays.lock().len() >= 5));
        let stats = worker.stop().unwrap();

        assert!(stats.captured >= 5);
        assert_eq!(stats.captured, stats.dropped + stats.processed);
        assert!(overlays.lock().iter().all(Overlay::is_empty));
    }

    #[test]
    fn flaw_reaches_sink_once_reference_is_set() {
        let reference = blocky_rgb(320, 240, 17);
        let live = with_square(&reference, 100, 100, 50, [255, 255, 255]);

        let session = Arc::new(Session::new(FlawDetector::default()));
        session.set_reference(reference);
        let sink = RecordingSink::default();
        let overlays = Arc::clone(&sink.overlays);

        let source = StillSource::new(live);
        let worker =
            DetectionWorker::start(move || Ok(source), sink, Arc::clone(&session), fast())
                .unwrap();
        let found = wait_for(Duration::from_secs(60), || {
            overlays.lock().iter().any(|o| o.boxes.len() == 1)
        });
        let stats = worker.stop().unwrap();

        assert!(found, "no flaw reported after {stats:?}");
        assert!(stats.processed >= 1);
        assert_eq!(stats.skipped, 0);
    }

    #[test]
    fn boxes_from_a_replaced_reference_are_not_drawn() {
        let reference = blocky_rgb(320, 240, 17);
        let live = with_square(&reference, 100, 100, 50, [255, 255, 255]);

        let session = Arc::new(Session::new(FlawDetector::default()));
        session.set_reference(reference);
        let sink = RecordingSink::default();
        let overlays = Arc::clone(&sink.overlays);

        let source = StillSource::new(live.clone());
        let worker =
            DetectionWorker::start(move || Ok(source), sink, Arc::clone(&session), fast())
                .unwrap();
        assert!(wait_for(Duration::from_secs(60), || {
            overlays.lock().iter().any(|o| o.boxes.len() == 1)
        }));

        // The live frame itself becomes the reference: nothing differs now.
        session.clear_reference();
        session.set_reference(live);
        let switched_at = overlays.lock().len();
        assert!(wait_for(Duration::from_secs(60), || {
            overlays.lock().len() >= switched_at + 10
        }));
        worker.stop().unwrap();

        // One frame may already have been on its way to the sink.
        let overlays = overlays.lock();
        assert!(
            overlays[switched_at + 1..].iter().all(Overlay::is_empty),
            "stale boxes drawn after the reference changed"
        );
    }

    #[test]
    fn capture_failure_stops_worker_and_is_reported() {
        let session = Arc::new(Session::new(FlawDetector::default()));
        let mut source = StillSource::new(blocky_rgb(32, 32, 3));
        source.fail_after = Some(3);

        let worker = DetectionWorker::start(
            move || Ok(source),
            RecordingSink::default(),
            session,
            fast(),
        )
        .unwrap();
        assert!(wait_for(Duration::from_secs(5), || !worker.is_running()));

        let err = worker.stop().unwrap_err();
        assert!(format!("{err:#}").contains("camera unplugged"));
    }

    #[test]
    fn open_failure_is_returned_from_start() {
        let session = Arc::new(Session::new(FlawDetector::default()));
        let result = DetectionWorker::start(
            || -> Result<StillSource> { anyhow::bail!("no such camera") },
            RecordingSink::default(),
            session,
            fast(),
        );
        let err = result.err().expect("start should fail");
        assert!(format!("{err:#}").contains("no such camera"));
    }
}
