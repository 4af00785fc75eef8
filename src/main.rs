// FTL core engine demo binary.
//
// Wires a config (from `ftl.toml` if present, defaults otherwise), an
// in-memory simulated device and the engine, then drives a short soak
// workload so the pipeline, GC and the active placement strategy all see
// real traffic.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use ftl_core::device::{ChannelGeometry, DeviceGeometry};
use ftl_core::{DeviceDriver, Engine, EngineConfig, GcController, SimDevice};
use tracing::info;

#[tokio::main]
async fn main() -> ftl_core::Result<()> {
    ftl_core::logging::init();

    let config = match fs::read_to_string("ftl.toml") {
        Ok(text) => EngineConfig::load_toml(&text)?,
        Err(_) => EngineConfig::default(),
    };
    config.validate()?;

    let n = config.total_logical_pages();
    let target_type = config.target_type;
    info!(?target_type, n, "starting ftl-core");

    let geometry = DeviceGeometry {
        channels: vec![ChannelGeometry {
            laddr_begin: 0,
            laddr_end: n as u64,
            gran_erase: config.nr_pages_per_blk * config.host_pages_per_flash_page,
            gran_read: 1,
            gran_write: 1,
            t_r: Duration::from_micros(config.t_read_us),
            t_w: Duration::from_micros(config.t_write_us),
            t_e: Duration::from_micros(config.t_erase_us),
        }],
    };
    let device: Arc<dyn DeviceDriver> = Arc::new(SimDevice::new(n, 4096, geometry));
    let engine = Engine::new(config, device)?;
    let gc = GcController::spawn(engine.clone());

    run_soak(&engine).await?;

    let snapshot = engine.metrics_snapshot();
    info!(?snapshot, "soak workload complete");
    gc.shutdown().await;
    Ok(())
}

/// Writes and reads back a sliding window of logical pages, forcing
/// enough page turnover that the garbage collector has real work to do.
async fn run_soak(engine: &Arc<Engine>) -> ftl_core::Result<()> {
    let n = engine.config.total_logical_pages() as u64;
    let rounds = 64u64;
    for round in 0..rounds {
        let l = round % n;
        let sector = l * 8;
        let payload = vec![(round % 256) as u8; 4096];
        engine.write(sector, &payload).await?;
        let back = engine.read(sector).await?;
        debug_assert_eq!(back.len(), 4096);
    }
    Ok(())
}
