pub mod cache;
pub mod cache_store;
pub mod cli;
pub mod commands;
pub mod config;
pub mod frame_loader;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod psf_fitting;
pub mod star_detection;
pub mod statistics;
pub mod synthetic;
pub mod worklist;

// Main entry point
pub mod cli_main;

// Re-export commonly used items
pub use cache::MetricsCache;
pub use config::Config;
pub use frame_loader::{FitsLoader, FrameLoader, LoadError};
pub use models::{FrameMetrics, PixelMatrix, PsfFit, StarCandidate};
pub use orchestrator::{BatchHandle, BatchReport, BatchState, CancelHandle, Orchestrator};
pub use star_detection::ImageStatistics;
pub use statistics::{BandStatistics, Metric};
