//! Orchestration engine for hardware accelerated transcoding.
//!
//! Frames live in [`pool::SurfacePool`]s and travel between
//! [`stage::Stage`]s as [`item::OutputItem`]s. The [`driver::Driver`] runs
//! the stages on one thread; [`bus::Pipeline`] puts a run together.

pub mod alloc;
pub mod bus;
pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod filter;
pub mod frame;
pub mod io;
pub mod item;
pub mod packet;
pub mod pool;
pub mod stage;
pub mod timestamp;

pub use bus::{Pipeline, PipelineBuilder};
pub use config::PipelineConfig;
pub use driver::{Driver, RunStats};
pub use error::{PipelineError, Result, StageStatus};
