pub mod agg;
pub mod elapsed;
pub mod history;
pub mod poller;
pub mod report;
pub mod thresholds;
pub mod token;

pub use history::{ChartHistory, HistoryPoint, OverallPoint};
pub use poller::{EventFn, PollEvent, Poller, PollerConfig, RunStatus};
pub use report::{ParsedBatch, RejectedReport, StepReport, VuReport};
pub use token::{LoadOptions, LoadStage, Threshold, Token, STILL_RUNNING};
