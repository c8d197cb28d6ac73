use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use flawcam::capture::WebcamCapture;
use flawcam::detection::{FlawDetector, PipelineConfig};
use flawcam::output::{draw_overlay, LogOutput, OutputSink, Overlay, V4L2Output};
use flawcam::session::{DetectionWorker, Session, WorkerConfig};
use image::RgbImage;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(flatten)]
    tuning: Tuning,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compare a reference image against a target image and print the flaw boxes
    Compare {
        /// Reference ("base") image
        #[arg(long)]
        base: PathBuf,

        /// Image to inspect
        #[arg(long)]
        target: PathBuf,

        /// Write the target with flaw boxes drawn to this path
        #[arg(long)]
        annotate: Option<PathBuf>,
    },

    /// Run detection on a live webcam feed
    Live(LiveArgs),
}

#[derive(Args, Debug)]
struct LiveArgs {
    /// Input webcam device index
    #[arg(short, long, default_value_t = 0)]
    input_device: u32,

    /// Output v4l2loopback device path
    /// If not provided, flaw boxes are only logged
    #[arg(short, long)]
    output_device: Option<String>,

    /// Capture resolution width
    #[arg(long, default_value_t = 1280)]
    capture_width: u32,

    /// Capture resolution height
    #[arg(long, default_value_t = 720)]
    capture_height: u32,

    /// Output resolution width
    #[arg(long, default_value_t = 1280)]
    output_width: u32,

    /// Output resolution height
    #[arg(long, default_value_t = 720)]
    output_height: u32,

    /// Target frames per second
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Reference image to start with instead of capturing one
    #[arg(long)]
    reference: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct Tuning {
    /// RANSAC reprojection tolerance in pixels
    #[arg(long, global = true, default_value_t = 0.5)]
    ransac_threshold: f64,

    /// Smoothed intensity difference above which a pixel counts as changed
    #[arg(long, global = true, default_value_t = 5)]
    diff_threshold: u8,

    /// Feature budget per image
    #[arg(long, global = true, default_value_t = 5000)]
    max_features: usize,

    /// Extract regions from the thresholded map without erode/dilate cleanup
    #[arg(long, global = true)]
    raw_change_map: bool,
}

impl Tuning {
    fn pipeline_config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.registration.ransac_threshold = self.ransac_threshold;
        config.registration.max_features = self.max_features;
        config.change.diff_threshold = self.diff_threshold;
        config.change.morphological_cleanup = !self.raw_change_map;
        config
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let detector = FlawDetector::new(cli.tuning.pipeline_config());
    tracing::debug!("Pipeline config: {:?}", detector.config());

    match cli.command {
        Command::Compare {
            base,
            target,
            annotate,
        } => compare(&detector, &base, &target, annotate.as_deref()),
        Command::Live(args) => live(detector, args),
    }
}

fn load_rgb(path: &Path) -> Result<RgbImage> {
    let image = image::open(path).with_context(|| format!("Failed to load {}", path.display()))?;
    Ok(image.to_rgb8())
}

fn compare(
    detector: &FlawDetector,
    base: &Path,
    target: &Path,
    annotate: Option<&Path>,
) -> Result<()> {
    let base = load_rgb(base)?;
    let target = load_rgb(target)?;

    let boxes = match detector.detect(&base, &target) {
        Ok(detection) => {
            if let Some(alignment) = &detection.alignment {
                tracing::info!(
                    "Aligned with {}/{} inliers, {} changed pixels",
                    alignment.inliers,
                    alignment.matches,
                    detection.changed_pixels
                );
                tracing::debug!("Homography:{}", alignment.homography.matrix());
            }
            detection.boxes
        }
        Err(e) if e.is_recoverable() => {
            tracing::warn!("No registration possible: {}", e);
            Vec::new()
        }
        Err(e) => return Err(e).context("Detection failed"),
    };

    println!("{}", serde_json::to_string(&boxes)?);

    if let Some(path) = annotate {
        let (width, height) = target.dimensions();
        let mut annotated = target;
        draw_overlay(&mut annotated, &Overlay::new(boxes, width, height));
        annotated
            .save(path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::info!("Annotated image written to {}", path.display());
    }

    Ok(())
}

fn live(detector: FlawDetector, args: LiveArgs) -> Result<()> {
    tracing::info!("flawcam starting");
    tracing::info!("Capture: {}x{}", args.capture_width, args.capture_height);
    tracing::info!("Target FPS: {}", args.fps);

    let session = Arc::new(Session::new(detector));
    if let Some(path) = &args.reference {
        session.set_reference(load_rgb(path)?);
    }

    let sink: Box<dyn OutputSink + Send> = match &args.output_device {
        Some(device) => {
            tracing::info!("Output: {}x{}", args.output_width, args.output_height);
            Box::new(
                V4L2Output::new(device, args.output_width, args.output_height)
                    .context("Failed to initialize v4l2loopback output")?,
            )
        }
        None => {
            tracing::info!("No output device, logging flaw boxes only");
            Box::new(LogOutput::new(args.capture_width, args.capture_height))
        }
    };

    // The camera handle is not Send, so it is opened on the capture thread.
    let (index, width, height, fps) = (
        args.input_device,
        args.capture_width,
        args.capture_height,
        args.fps,
    );
    let worker = DetectionWorker::start(
        move || {
            WebcamCapture::new(index, width, height, fps)
                .context("Failed to initialize webcam capture")
        },
        sink,
        Arc::clone(&session),
        WorkerConfig {
            target_fps: args.fps,
            ..WorkerConfig::default()
        },
    )?;

    tracing::info!("Enter/r: capture reference, c: clear reference, q: quit");
    control_loop(&session, &worker)?;

    worker.stop()?;
    Ok(())
}

/// Reads commands from stdin until `q`, EOF or the worker stops on its own.
fn control_loop(session: &Session, worker: &DetectionWorker) -> Result<()> {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("Failed to read stdin")?;
        if !worker.is_running() {
            break;
        }
        match line.trim() {
            "" | "r" => {
                session.capture_reference();
            }
            "c" => session.clear_reference(),
            "q" => return Ok(()),
            other => tracing::warn!("Unknown command {:?}", other),
        }
    }

    // Without a terminal, keep running until the capture side gives up.
    while worker.is_running() {
        std::thread::sleep(Duration::from_millis(200));
    }
    Ok(())
}
