//! pacam CLI: pressure-advance calibration from photos of a printed line pattern.

use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

use pacam::{
    CalibrationConfig, CalibrationOutcome, Calibrator, CaptureSource, HttpSegmentation,
    HttpSnapshotCapture, OtsuSegmentation, PaDecision, PrecomputedMask, SegmentationProvider,
};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "pacam")]
#[command(about = "Pick the smoothest line of a pressure-advance test print from a photo")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline on a stored photo.
    Analyze(CliAnalyzeArgs),

    /// Grab a snapshot from a camera URL and run the full pipeline.
    Calibrate(CliCalibrateArgs),

    /// Print pattern geometry, PA table and photo position.
    PatternInfo {
        #[command(flatten)]
        config: CliConfigArgs,
    },

    /// Score a directory of labelled photos and report pass/fail counts.
    Evaluate {
        /// Directory with `<name>_<n[,n...]>.jpg` photos and `<name>_out.png` cut-outs.
        #[arg(long)]
        dir: PathBuf,

        /// Write per-photo results (JSON).
        #[arg(long)]
        out: Option<PathBuf>,

        #[command(flatten)]
        config: CliConfigArgs,
    },
}

#[derive(Debug, Clone, Args)]
struct CliConfigArgs {
    /// Path to a `pacam.config.v1` JSON file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override `pattern.pa_start`.
    #[arg(long)]
    pa_start: Option<f64>,

    /// Override `pattern.pa_end`.
    #[arg(long)]
    pa_end: Option<f64>,

    /// Override `pattern.pa_step`.
    #[arg(long)]
    pa_step: Option<f64>,
}

#[derive(Debug, Clone, Args)]
struct CliSegmentArgs {
    /// Precomputed mask or RGBA cut-out.
    #[arg(long, conflicts_with_all = ["segment_url", "otsu"])]
    mask: Option<PathBuf>,

    /// Segmentation service endpoint (overrides `segmentation.endpoint`).
    #[arg(long, conflicts_with = "otsu")]
    segment_url: Option<String>,

    /// Segment locally with an Otsu threshold.
    #[arg(long)]
    otsu: bool,

    /// With --otsu, treat dark pixels as filament.
    #[arg(long, requires = "otsu")]
    dark_foreground: bool,
}

#[derive(Debug, Clone, Args)]
struct CliRunArgs {
    /// Root directory for run artifacts (overrides `run.artifacts_dir`).
    #[arg(long)]
    out_dir: Option<PathBuf>,

    /// Explicit run id instead of `run-<captured_at_ms>`.
    #[arg(long)]
    run_id: Option<String>,

    /// Print the run report JSON to stdout.
    #[arg(long)]
    print_report: bool,
}

#[derive(Debug, Clone, Args)]
struct CliAnalyzeArgs {
    /// Path to the photo of the printed pattern.
    #[arg(long)]
    image: PathBuf,

    #[command(flatten)]
    segment: CliSegmentArgs,

    #[command(flatten)]
    config: CliConfigArgs,

    #[command(flatten)]
    run: CliRunArgs,
}

#[derive(Debug, Clone, Args)]
struct CliCalibrateArgs {
    /// Camera snapshot URL (e.g. `http://printer/webcam/?action=snapshot`).
    #[arg(long)]
    snapshot_url: String,

    #[command(flatten)]
    segment: CliSegmentArgs,

    #[command(flatten)]
    config: CliConfigArgs,

    #[command(flatten)]
    run: CliRunArgs,
}

impl CliConfigArgs {
    fn load(&self) -> CliResult<CalibrationConfig> {
        let mut config = match &self.config {
            Some(path) => CalibrationConfig::from_json_file(path)?,
            None => CalibrationConfig::default(),
        };
        if let Some(v) = self.pa_start {
            config.pattern.pa_start = v;
        }
        if let Some(v) = self.pa_end {
            config.pattern.pa_end = v;
        }
        if let Some(v) = self.pa_step {
            config.pattern.pa_step = v;
        }
        config.validate()?;
        Ok(config)
    }
}

impl CliSegmentArgs {
    fn to_provider(&self, config: &CalibrationConfig) -> CliResult<Box<dyn SegmentationProvider>> {
        if let Some(path) = &self.mask {
            tracing::info!("Using precomputed mask {}", path.display());
            return Ok(Box::new(PrecomputedMask::from_path(path)?));
        }
        if self.otsu {
            return Ok(Box::new(OtsuSegmentation {
                dark_foreground: self.dark_foreground,
            }));
        }
        let mut seg_cfg = config.segmentation.clone();
        if let Some(url) = &self.segment_url {
            seg_cfg.endpoint = Some(url.clone());
        }
        let http = HttpSegmentation::from_config(&seg_cfg).map_err(|e| -> CliError {
            format!("{e} (pass --segment-url, --mask or --otsu)").into()
        })?;
        tracing::info!("Using segmentation service {}", http.endpoint());
        Ok(Box::new(http))
    }
}

fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Analyze(args) => run_analyze(&args),
        Commands::Calibrate(args) => run_calibrate(&args),
        Commands::PatternInfo { config } => run_pattern_info(&config),
        Commands::Evaluate { dir, out, config } => run_evaluate(&dir, out.as_deref(), &config),
    }
}

// ── analyze / calibrate ────────────────────────────────────────────────

fn run_analyze(args: &CliAnalyzeArgs) -> CliResult<()> {
    let mut config = args.config.load()?;
    apply_run_args(&mut config, &args.run);
    let segmenter = args.segment.to_provider(&config)?;
    let calibrator = Calibrator::new(config)?;

    tracing::info!("Loading image: {}", args.image.display());
    let (w, h) = image::image_dimensions(&args.image).map_err(|e| -> CliError {
        format!("Failed to open image {}: {}", args.image.display(), e).into()
    })?;
    tracing::info!("Image size: {}x{}", w, h);
    let capture = calibrator.file_capture(&args.image);
    finish_run(&calibrator, &capture, segmenter.as_ref(), &args.run)
}

fn run_calibrate(args: &CliCalibrateArgs) -> CliResult<()> {
    let mut config = args.config.load()?;
    apply_run_args(&mut config, &args.run);
    let segmenter = args.segment.to_provider(&config)?;
    let capture =
        HttpSnapshotCapture::new(&args.snapshot_url, config.camera.placement, &config.capture);
    let calibrator = Calibrator::new(config)?;

    let [x, y, z] = calibrator
        .pattern()
        .photo_position(&calibrator.config().camera.placement);
    tracing::info!("Expecting toolhead at X{x:.1} Y{y:.1} Z{z:.1} for the snapshot");
    finish_run(&calibrator, &capture, segmenter.as_ref(), &args.run)
}

fn apply_run_args(config: &mut CalibrationConfig, run: &CliRunArgs) {
    if let Some(dir) = &run.out_dir {
        config.run.artifacts_dir = Some(dir.clone());
    }
}

fn finish_run(
    calibrator: &Calibrator,
    capture: &dyn CaptureSource,
    segmenter: &dyn SegmentationProvider,
    run: &CliRunArgs,
) -> CliResult<()> {
    let outcome = match &run.run_id {
        Some(id) => calibrator.calibrate_with_run_id(capture, segmenter, id),
        None => calibrator.calibrate(capture, segmenter),
    };

    if run.print_report {
        println!("{}", outcome.report.to_json_pretty()?);
    }
    if let Some(dir) = &outcome.artifacts_dir {
        tracing::info!("Artifacts written to {}", dir.display());
    }
    print_outcome(&outcome)
}

fn print_outcome(outcome: &CalibrationOutcome) -> CliResult<()> {
    match &outcome.decision {
        PaDecision::Apply {
            pa_value,
            line_index,
        } => {
            tracing::info!(
                "Run {} completed in {:.0} ms",
                outcome.run_id(),
                outcome.report.total_ms
            );
            println!("Best line: {}", line_index + 1);
            println!("Best pressure advance value: {pa_value}");
            Ok(())
        }
        PaDecision::RetainPrevious { reason } => {
            let message = outcome
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| reason.to_string());
            Err(format!(
                "run {} failed ({}): {message}; keeping previous pressure advance",
                outcome.run_id(),
                outcome.state()
            )
            .into())
        }
    }
}

// ── pattern-info ──────────────────────────────────────────────────────

fn run_pattern_info(args: &CliConfigArgs) -> CliResult<()> {
    let config = args.load()?;
    let model = config.pattern_model()?;
    let [across, along] = model.pattern_extent_mm();
    let [x, y, z] = model.photo_position(&config.camera.placement);

    println!("pacam test pattern");
    println!("  lines:          {}", model.line_count);
    println!(
        "  PA range:       {} .. {} step {}",
        model.pa_start, model.pa_end, model.pa_step
    );
    println!("  line spacing:   {} mm", model.line_spacing_mm);
    println!("  extent:         {across:.1}x{along:.1} mm (across x along)");
    println!(
        "  origin:         X{:.1} Y{:.1} mm",
        model.x_start, model.y_start
    );
    println!("  photo position: X{x:.1} Y{y:.1} Z{z:.1}");
    println!();
    println!("  line   PA");
    for (index, pa) in model.pa_table() {
        println!("  {:>4}   {:.4}", index + 1, pa);
    }

    Ok(())
}

// ── evaluate ───────────────────────────────────────────────────────────

#[derive(Debug)]
struct LabelledPhoto {
    photo: PathBuf,
    cutout: PathBuf,
    expected: Vec<usize>,
}

/// `name_3,4.jpg` -> (`name`, [3, 4]).
fn parse_label(file_name: &str) -> Option<(&str, Vec<usize>)> {
    let stem = file_name.strip_suffix(".jpg")?;
    let (name, lines) = stem.rsplit_once('_')?;
    if name.is_empty() || lines.is_empty() {
        return None;
    }
    let expected = lines
        .split(',')
        .map(|s| s.parse::<usize>().ok().filter(|&n| n > 0))
        .collect::<Option<Vec<_>>>()?;
    Some((name, expected))
}

fn collect_dataset(dir: &Path) -> CliResult<Vec<LabelledPhoto>> {
    let mut photos = Vec::new();
    for entry in std::fs::read_dir(dir)
        .map_err(|e| -> CliError { format!("failed to read {}: {e}", dir.display()).into() })?
    {
        let path = entry?.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some((name, expected)) = parse_label(file_name) else {
            continue;
        };
        let cutout = dir.join(format!("{name}_out.png"));
        if !cutout.is_file() {
            tracing::warn!("Skipping {file_name}: no {name}_out.png");
            continue;
        }
        photos.push(LabelledPhoto {
            photo: path.clone(),
            cutout,
            expected,
        });
    }
    photos.sort_by(|a, b| a.photo.cmp(&b.photo));
    Ok(photos)
}

fn run_evaluate(dir: &Path, out: Option<&Path>, args: &CliConfigArgs) -> CliResult<()> {
    let calibrator = Calibrator::new(args.load()?)?;
    let dataset = collect_dataset(dir)?;
    if dataset.is_empty() {
        return Err(format!("no labelled photos found in {}", dir.display()).into());
    }

    let mut passed = 0usize;
    let mut failed = 0usize;
    let mut results = Vec::with_capacity(dataset.len());
    for item in &dataset {
        let label = item
            .photo
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match calibrator.analyze_files(&item.photo, &item.cutout) {
            Ok(analysis) => {
                let line = analysis.selection.index + 1;
                let ok = item.expected.contains(&line);
                if ok {
                    passed += 1;
                    println!("PASS  {label}: line {line}");
                } else {
                    failed += 1;
                    println!("FAIL  {label}: line {line}, expected {:?}", item.expected);
                }
                results.push(serde_json::json!({
                    "photo": label,
                    "expected": item.expected,
                    "line": line,
                    "pa_value": analysis.selection.pa_value,
                    "margin": analysis.selection.margin,
                    "pass": ok,
                }));
            }
            Err(e) => {
                failed += 1;
                println!("FAIL  {label}: {e}");
                results.push(serde_json::json!({
                    "photo": label,
                    "expected": item.expected,
                    "error": e.to_string(),
                    "kind": e.kind(),
                    "pass": false,
                }));
            }
        }
    }

    println!();
    println!("{passed} passed, {failed} failed of {}", dataset.len());
    if let Some(path) = out {
        let summary = serde_json::json!({
            "passed": passed,
            "failed": failed,
            "results": results,
        });
        std::fs::write(path, serde_json::to_string_pretty(&summary)?)?;
        tracing::info!("Wrote {}", path.display());
    }
    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
