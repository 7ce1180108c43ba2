//! Facial emotion detection API server.

use anyhow::Result;
use clap::Parser;
use facial_emotion_api::{
    analysis::{decode_image, FacialAnalyzer},
    config::{Config, EXAMPLE_CONFIG},
    server,
};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to bind (overrides the configuration file)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides the configuration file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to configuration file (YAML format)
    #[arg(short = 'C', long)]
    config: Option<String>,

    /// Enable debug output
    #[arg(short, long)]
    debug: bool,

    /// Analyze a single image file, print the result and exit
    #[arg(short, long)]
    image: Option<PathBuf>,

    /// Print an example configuration file and exit
    #[arg(long)]
    print_config: bool,
}

#[cfg(feature = "onnx")]
fn build_analyzer(config: &Config) -> Result<FacialAnalyzer> {
    use facial_emotion_api::{
        attributes::OnnxAttributeClassifier,
        face_detection::{FaceDetector, ScrfdDetector},
        mark_detection::MarkDetector,
        pnp::PnpSolver,
        pose_estimation::PoseEstimator,
    };

    config.validate_model_paths()?;
    let detection = &config.face_detection;

    let face_detector: Arc<dyn FaceDetector> = Arc::new(ScrfdDetector::new(
        &config.models.face_detector,
        detection.confidence_threshold,
        detection.iou_threshold,
    )?);
    let mark_detector = MarkDetector::new(
        &config.models.face_landmarks,
        Arc::clone(&face_detector),
        detection.bbox_expansion,
    )?;
    let classifier = OnnxAttributeClassifier::new(&config.models.emotion, &config.models.age_gender)?;
    let pose_estimator =
        PoseEstimator::with_solver(Arc::new(mark_detector), PnpSolver::new(config.pose.refine_iterations));

    Ok(FacialAnalyzer::new(face_detector, pose_estimator, Arc::new(classifier)))
}

#[cfg(not(feature = "onnx"))]
fn build_analyzer(_config: &Config) -> Result<FacialAnalyzer> {
    anyhow::bail!("built without the `onnx` feature; rebuild with `--features onnx` to load the analysis models")
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    if args.print_config {
        print!("{EXAMPLE_CONFIG}");
        return Ok(());
    }

    // Initialize logger
    if args.debug {
        env_logger::init_from_env(env_logger::Env::new().default_filter_or("debug"));
    } else {
        env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    }

    info!("Facial Emotion Detection API");

    // Load configuration if provided
    let mut config = if let Some(config_path) = &args.config {
        match Config::from_file(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                log::warn!("Failed to load config file: {e}. Using defaults.");
                Config::default()
            }
        }
    } else {
        Config::default()
    };

    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate()?;

    let analyzer = Arc::new(build_analyzer(&config)?);

    if let Some(path) = args.image {
        info!("Analyzing {}", path.display());
        let image = decode_image(&std::fs::read(&path)?)?;
        let record = tokio::task::spawn_blocking(move || analyzer.analyze(&image)).await??;
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    server::serve(analyzer, &config.server).await?;
    Ok(())
}
