//! runloom: an execution engine that runs an arbitrary predictor subprocess
//! behind a permit-bounded HTTP prediction API.

mod health;
mod prediction;
mod predictor;
mod supervisor;
mod version;

pub mod bridge;
pub mod config;
pub mod input_validation;
pub mod io;
pub mod orchestrator;
pub mod permit;
pub mod scheduler;
pub mod service;
mod setup_log_accumulator;
pub mod shutdown;
pub mod transport;
pub mod webhook;

pub use orchestrator::Orchestrator;

pub use supervisor::{PredictionHandle, PredictionSupervisor, SyncPredictionGuard};

pub use health::{Health, SetupResult, SetupStatus};
pub use input_validation::{InputValidator, ValidationError};
pub use prediction::{CancellationToken, Prediction, PredictionOutput, PredictionStatus};
pub use predictor::{PredictionError, PredictionResult};
pub use service::{CreatePredictionError, HealthSnapshot, PredictionService};
pub use setup_log_accumulator::{SetupLogAccumulator, drain_accumulated_logs};
pub use version::{RUNLOOM_VERSION, VersionInfo};
