//! Calibration run orchestration.
//!
//! This is the glue layer: it owns the run state machine, calls the external
//! collaborators (capture, segmentation), runs the image-analysis stages in order and
//! turns the outcome into a PA decision plus a persisted report.
//!
//! ```text
//! AwaitingCapture → AcquiringMask → Rectifying → Extracting → Scoring → Selecting → Completed
//!        └──────────────┴──────────────┴────────────┴──────────┴──────────┴──→ Failed(kind)
//! ```
//!
//! Algorithmic stages live in `crate::rectify`, `crate::extract`, `crate::score` and
//! `crate::select`.

mod result;
mod run;
mod state;

pub use result::{Analysis, CalibrationOutcome, PaDecision, StageTiming};
pub use run::CalibrationOrchestrator;
pub use state::{RunState, StateMachine, TransitionError};
