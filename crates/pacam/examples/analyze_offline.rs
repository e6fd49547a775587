use pacam::{CalibrationConfig, Calibrator};
use std::error::Error;
use std::path::Path;

fn main() -> Result<(), Box<dyn Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!(
            "Usage: {} <photo.jpg> <cutout.png> [config.json] [out.json]",
            args[0]
        );
        std::process::exit(2);
    }

    let config = match args.get(3) {
        Some(path) => CalibrationConfig::from_json_file(Path::new(path))?,
        None => CalibrationConfig::default(),
    };
    let calibrator = Calibrator::new(config)?;
    let analysis = calibrator.analyze_files(Path::new(&args[1]), Path::new(&args[2]))?;

    for s in &analysis.scored.scores {
        if s.valid {
            println!("line {:>2}  pa={:.4}  score={:.4}", s.index + 1, s.pa_value, s.score);
        } else {
            println!("line {:>2}  pa={:.4}  invalid", s.index + 1, s.pa_value);
        }
    }
    println!("Best line: {}", analysis.selection.index + 1);
    println!("Best pressure advance value: {}", analysis.selection.pa_value);

    if let Some(out_path) = args.get(4) {
        let json = serde_json::to_string_pretty(&analysis.selection)?;
        std::fs::write(out_path, json)?;
        println!("Wrote {out_path}");
    }
    Ok(())
}
