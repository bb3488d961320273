//! Selfcal - direction-independent self-calibration pipeline orchestrator
//!
//! This crate sequences the external imager and calibrator over a single
//! working dataset, owns the run directory and every artifact written into
//! it, and turns operator interrupts into an orderly shutdown of the tool
//! that is currently running.

pub mod cluster;
pub mod commands;
pub mod config;
pub mod controller;
pub mod error;
pub mod prepare;
pub mod report;
pub mod runner;
pub mod signals;
pub mod telemetry;
pub mod workspace;

pub use cluster::{ClusterResourceProbe, ClusterResources};
pub use controller::{RunReport, SelfCalController};
pub use error::{InputError, PipelineError, ToolExecutionError, WorkspaceError};
pub use prepare::MeasurementSetPreparer;
pub use runner::{ExternalToolRunner, ToolInvocation, ToolLauncher};
pub use workspace::WorkspaceManager;
