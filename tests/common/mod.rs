use std::sync::Arc;
use std::time::Duration;

use ftl_core::device::{ChannelGeometry, DeviceGeometry};
use ftl_core::{DeviceDriver, Engine, EngineConfig, SimDevice};

/// Builds an `Engine` over a fresh `SimDevice` sized to the config's
/// logical address space, with generous (short) simulated timings so
/// integration tests run fast.
pub async fn build_engine(config: EngineConfig) -> Arc<Engine> {
    let n = config.total_logical_pages();
    let geometry = DeviceGeometry {
        channels: vec![ChannelGeometry {
            laddr_begin: 0,
            laddr_end: n as u64,
            gran_erase: config.nr_pages_per_blk * config.host_pages_per_flash_page,
            gran_read: 1,
            gran_write: 1,
            t_r: Duration::from_micros(1),
            t_w: Duration::from_micros(1),
            t_e: Duration::from_micros(1),
        }],
    };
    let device: Arc<dyn DeviceDriver> = Arc::new(SimDevice::new(n, 4096, geometry));
    Engine::new(config, device).expect("valid config")
}

pub fn page(byte: u8) -> Vec<u8> {
    vec![byte; 4096]
}
