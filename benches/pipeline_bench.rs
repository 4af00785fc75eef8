// Request pipeline throughput benchmarks.
// Exercises the host write/read path end to end (allocation, mapping
// update, device I/O and timing simulation) under the default placement
// strategy.

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ftl_core::device::{ChannelGeometry, DeviceGeometry};
use ftl_core::{DeviceDriver, Engine, EngineConfig, GcController, SimDevice};
use tokio::runtime::Runtime;

fn build_engine(nr_pools: usize, blks_per_pool: usize) -> Arc<Engine> {
    let config = EngineConfig {
        nr_pools,
        nr_blks_per_pool: blks_per_pool,
        nr_pages_per_blk: 256,
        nr_aps_per_pool: 1,
        host_pages_per_flash_page: 1,
        t_read_us: 1,
        t_write_us: 1,
        t_erase_us: 1,
        ..EngineConfig::default()
    };
    let n = config.total_logical_pages();
    let geometry = DeviceGeometry {
        channels: vec![ChannelGeometry {
            laddr_begin: 0,
            laddr_end: n as u64,
            gran_erase: config.nr_pages_per_blk,
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

fn bench_sequential_writes(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("sequential_writes");
    for pools in [1usize, 4] {
        group.bench_with_input(BenchmarkId::from_parameter(pools), &pools, |b, &pools| {
            let engine = build_engine(pools, 16);
            // Background GC keeps reclaiming space as the benchmark churns
            // through writes well past the store's raw capacity.
            let _gc = rt.block_on(async { GcController::spawn(engine.clone()) });
            let n = engine.config.total_logical_pages() as u64;
            let payload = vec![0xABu8; 4096];
            let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
            b.to_async(&rt).iter(|| {
                let engine = engine.clone();
                let payload = payload.clone();
                let counter = counter.clone();
                async move {
                    let l = counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed) % n;
                    engine.write(black_box(l * 8), &payload).await.unwrap();
                }
            });
        });
    }
    group.finish();
}

fn bench_read_after_write(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let engine = build_engine(2, 16);
    let payload = vec![0xCDu8; 4096];
    rt.block_on(engine.write(0, &payload)).unwrap();

    c.bench_function("read_after_write", |b| {
        b.to_async(&rt).iter(|| {
            let engine = engine.clone();
            async move {
                black_box(engine.read(0).await.unwrap());
            }
        });
    });
}

criterion_group!(benches, bench_sequential_writes, bench_read_after_write);
criterion_main!(benches);
