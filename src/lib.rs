//! Flash translation layer engine: pools, append-point allocation,
//! mapping, garbage collection and pluggable placement strategies over a
//! raw NAND-like device.

pub mod append_point;
pub mod block;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod gc;
pub mod hints;
pub mod inflight;
pub mod logging;
pub mod mapping;
pub mod metrics;
pub mod pipeline;
pub mod pool;
pub mod strategy;
pub mod types;

pub use config::{EngineConfig, Flags, TargetType};
pub use device::{DeviceDriver, DeviceGeometry, SimDevice};
pub use engine::Engine;
pub use error::{FtlError, Result};
pub use gc::GcController;
pub use hints::{HintPayload, HintSource};
