pub mod barrier;
pub mod config;
pub mod cusum;
pub mod data;
pub mod error;
pub mod events;
pub mod job;
pub mod labels;
pub mod parallel;
pub mod pipeline;
pub mod storage;
pub mod volatility;
pub mod weights;

pub use barrier::{BarrierMultiples, BarrierTouches, EventSpec, ExitKind, Side};
pub use config::{BarrierBoundary, LabelConfig, SideMode, ValidatedConfig};
pub use cusum::{CusumEvent, CusumMode, CusumState, EventDirection, Threshold};
pub use data::{DateWindow, PriceColumns, PriceSeries, SortedIndex, TimeSeries};
pub use error::{LabelError, LabelResult};
pub use events::{EventRequest, ResolvedEvent};
pub use job::{run_labeling_job, JobConfig, JobOutcome};
pub use labels::{Label, LabelSummary};
pub use parallel::{Molecule, ParallelExecutor};
pub use pipeline::{LabeledEvent, LabelingOutput, LabelingPipeline};
