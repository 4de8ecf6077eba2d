use chrono::{DateTime, Duration, Utc};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use plantwire_core::{CatalogDocument, EntityCatalog, FaultKind};
use plantwire_sim::{AnomalyScorer, FaultEngine, FaultSettings, StatWindow, signal};
use rand::SeedableRng;
use rand::rngs::StdRng;

fn start() -> DateTime<Utc> {
    DateTime::from_timestamp(1_772_431_200, 0).unwrap()
}

/// One sensor tick for every sensor of a machine: offset, sample, window, score.
fn bench_sensor_tick(c: &mut Criterion) {
    let catalog = EntityCatalog::from_document(CatalogDocument::demo(1, 1, 8)).unwrap();
    let scorer = AnomalyScorer::default();

    let mut group = c.benchmark_group("sensor_tick");
    for faulted in [false, true] {
        let machine = catalog.machines().next().unwrap();
        let sensors: Vec<_> = catalog.sensors_of(&machine.id).cloned().collect();
        let mut engine = FaultEngine::new(
            machine.id.clone(),
            catalog.sensor_kinds_of(&machine.id),
            FaultSettings::default(),
        );
        if faulted {
            engine
                .inject_manual(FaultKind::SensorDrift, Some(3600), 0.7, start())
                .unwrap();
        }
        let mut windows: Vec<_> = sensors.iter().map(|_| StatWindow::new(300)).collect();
        let mut rng = StdRng::seed_from_u64(11);
        let mut now = start();

        group.throughput(Throughput::Elements(sensors.len() as u64));
        group.bench_with_input(BenchmarkId::new("machine", faulted), &faulted, |b, _| {
            b.iter(|| {
                now += Duration::seconds(10);
                for (sensor, window) in sensors.iter().zip(windows.iter_mut()) {
                    let offset = engine.offset(sensor, now, &mut rng);
                    let value = signal::sample(sensor, offset, &mut rng);
                    let stats = window.push(now, value);
                    black_box(scorer.score(&sensor.thresholds, value, &stats));
                }
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_sensor_tick);
criterion_main!(benches);
