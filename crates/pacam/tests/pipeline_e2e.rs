//! End-to-end runs through the public API on a rendered photo of the pattern.

use std::path::PathBuf;

use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage, Rgba, RgbaImage};
use pacam::{
    ArtifactStore, CalibrationConfig, CalibrationOrchestrator, Calibrator, CameraPlacement,
    ErrorKind, ForegroundMask, FrameCapture, OtsuSegmentation, PaDecision, PrecomputedMask,
    RawImage, RunReport, RunState, SegmentationError, SegmentationProvider, MASK_FILE,
    RAW_IMAGE_FILE, RECTIFIED_IMAGE_FILE, RECTIFIED_MASK_FILE, REPORT_FILE,
};

const PX_PER_MM: f64 = 9.0;
const ORIGIN: [f64; 2] = [70.0, 60.0];
const TILT_DEG: f64 = 3.0;
const LINE_HALF_WIDTH_MM: f64 = 0.3;
const OUTLINE_MM: f64 = 1.0;

/// Photo of the default 21-line pattern, slightly rotated, with every line except
/// `straight` wobbling sideways. Returns the RGB photo and its exact mask.
fn render(straight: usize) -> (RgbImage, GrayImage) {
    let model = CalibrationConfig::default().pattern_model().unwrap();
    let [across, along] = model.pattern_extent_mm();
    let (sin, cos) = TILT_DEG.to_radians().sin_cos();

    let mut rgb = RgbImage::from_pixel(800, 500, Rgb([20, 20, 24]));
    let mut mask = GrayImage::new(800, 500);
    for y in 0..500u32 {
        for x in 0..800u32 {
            let dx = x as f64 + 0.5 - ORIGIN[0];
            let dy = y as f64 + 0.5 - ORIGIN[1];
            let u = (cos * dx + sin * dy) / PX_PER_MM;
            let v = (-sin * dx + cos * dy) / PX_PER_MM;
            if !(0.0..across).contains(&u) || !(0.0..along).contains(&v) {
                continue;
            }
            let outline = u < OUTLINE_MM
                || v < OUTLINE_MM
                || u > across - OUTLINE_MM
                || v > along - OUTLINE_MM;
            let on_line = (0..model.line_count).any(|i| {
                let wobble = if i == straight {
                    0.0
                } else {
                    0.25 * (std::f64::consts::TAU * v / 4.0).sin()
                };
                (u - model.line_center_mm(i) - wobble).abs() < LINE_HALF_WIDTH_MM
            });
            if outline || on_line {
                rgb.put_pixel(x, y, Rgb([205, 200, 190]));
                mask.put_pixel(x, y, Luma([255]));
            } else {
                rgb.put_pixel(x, y, Rgb([40, 42, 45]));
            }
        }
    }
    (rgb, mask)
}

fn raw(rgb: RgbImage) -> RawImage {
    RawImage::new(rgb, CameraPlacement::default(), 1_700_000_123_456)
}

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("pacam-e2e-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

struct Unreachable;

impl SegmentationProvider for Unreachable {
    fn segment(&self, _photo: &RawImage) -> Result<ForegroundMask, SegmentationError> {
        Err(SegmentationError::Timeout { timeout_ms: 120_000 })
    }

    fn name(&self) -> &str {
        "unreachable"
    }
}

#[test]
fn completed_run_persists_artifacts_and_report() {
    let (rgb, mask) = render(11);
    let root = scratch("complete");
    let orch = CalibrationOrchestrator::new(CalibrationConfig::default())
        .unwrap()
        .with_artifact_store(ArtifactStore::new(&root));

    let outcome = orch.run(
        &FrameCapture(raw(rgb)),
        &PrecomputedMask::new(ForegroundMask::from_luma(&mask, 127)),
    );

    assert!(outcome.is_completed(), "{:?}", outcome.error);
    let expected_pa = orch.pattern().index_to_pa(11);
    assert_eq!(
        outcome.decision,
        PaDecision::Apply {
            pa_value: expected_pa,
            line_index: 11
        }
    );

    let dir = outcome.artifacts_dir.clone().unwrap();
    assert_eq!(dir, root.join("run-1700000123456"));
    for file in [
        RAW_IMAGE_FILE,
        MASK_FILE,
        RECTIFIED_IMAGE_FILE,
        RECTIFIED_MASK_FILE,
        REPORT_FILE,
    ] {
        assert!(dir.join(file).is_file(), "missing {file}");
    }
    let rectified = image::open(dir.join(RECTIFIED_IMAGE_FILE)).unwrap();
    assert_eq!((rectified.width(), rectified.height()), (720, 400));

    let text = std::fs::read_to_string(dir.join(REPORT_FILE)).unwrap();
    let report: RunReport = serde_json::from_str(&text).unwrap();
    assert_eq!(report.schema_version, "pacam.report.v1");
    assert_eq!(report.state, RunState::Completed);
    let selection = report.selection.unwrap();
    assert_eq!(selection.line_number, 12);
    assert_eq!(selection.result.ranking.len(), 21);
    assert!(selection.result.margin.unwrap() > 0.0);
    assert_eq!(report.lines.len(), 21);

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn local_otsu_segmentation_finds_the_straight_line() {
    let (rgb, _) = render(4);
    let calibrator = Calibrator::new(CalibrationConfig::default()).unwrap();
    let outcome = calibrator.calibrate_with_run_id(
        &FrameCapture(raw(rgb)),
        &OtsuSegmentation::default(),
        "otsu-run",
    );
    assert_eq!(outcome.state(), RunState::Completed, "{:?}", outcome.error);
    assert_eq!(outcome.run_id(), "otsu-run");
    assert_eq!(outcome.report.selection.as_ref().unwrap().line_number, 5);
    assert_eq!(outcome.report.segmentation.as_ref().unwrap().provider, "otsu");
}

#[test]
fn segmentation_timeout_writes_failure_report() {
    let (rgb, _) = render(0);
    let root = scratch("network");
    let mut cfg = CalibrationConfig::default();
    cfg.run.artifacts_dir = Some(root.clone());
    let calibrator = Calibrator::new(cfg).unwrap();

    let outcome = calibrator.calibrate(&FrameCapture(raw(rgb)), &Unreachable);
    assert_eq!(outcome.state(), RunState::Failed(ErrorKind::Network));
    assert_eq!(outcome.pa_value(), None);

    let dir = outcome.artifacts_dir.clone().unwrap();
    assert!(dir.join(RAW_IMAGE_FILE).is_file());
    assert!(!dir.join(RECTIFIED_IMAGE_FILE).exists());
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.join(REPORT_FILE)).unwrap()).unwrap();
    assert_eq!(json["state"]["state"], "failed");
    assert_eq!(json["state"]["reason"], "network");
    assert_eq!(json["decision"]["action"], "retain_previous");
    assert_eq!(json["failure"]["kind"], "network");

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn repeated_run_ids_do_not_overwrite() {
    let (rgb, mask) = render(2);
    let root = scratch("repeat");
    let orch = CalibrationOrchestrator::new(CalibrationConfig::default())
        .unwrap()
        .with_artifact_store(ArtifactStore::new(&root));
    let capture = FrameCapture(raw(rgb));
    let seg = PrecomputedMask::new(ForegroundMask::from_luma(&mask, 127));

    let first = orch.run(&capture, &seg);
    let second = orch.run(&capture, &seg);
    assert_eq!(first.pa_value(), second.pa_value());
    assert_ne!(first.artifacts_dir, second.artifacts_dir);
    assert_eq!(
        second.artifacts_dir.unwrap(),
        root.join("run-1700000123456-1")
    );

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn analyze_files_reads_photo_and_cutout() {
    let (rgb, mask) = render(16);
    let dir = scratch("files");
    std::fs::create_dir_all(&dir).unwrap();
    let photo_path = dir.join("print_17.png");
    let cutout_path = dir.join("print_out.png");
    rgb.save(&photo_path).unwrap();
    let cutout = RgbaImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let p = rgb.get_pixel(x, y);
        let a = mask.get_pixel(x, y)[0];
        Rgba([p[0], p[1], p[2], a])
    });
    DynamicImage::ImageRgba8(cutout).save(&cutout_path).unwrap();

    let calibrator = Calibrator::new(CalibrationConfig::default()).unwrap();
    let analysis = calibrator.analyze_files(&photo_path, &cutout_path).unwrap();
    assert_eq!(analysis.selection.index, 16);
    assert_eq!(analysis.scored.scores.len(), 21);
    assert!(analysis.scored.scores.iter().all(|s| s.valid));

    let _ = std::fs::remove_dir_all(&dir);
}
