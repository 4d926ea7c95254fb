use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use ulid::Ulid;

use slotkeeper::engine::{Engine, EngineError};
use slotkeeper::model::*;
use slotkeeper::notify::NotifyHub;

/// 2026-01-01T00:00:00Z
const BASE: Ms = 1_767_225_600_000;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    let max = latencies[latencies.len() - 1];
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        max.as_secs_f64() * 1000.0,
    );
}

fn bench_wal(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("slotkeeper_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).expect("create bench dir");
    dir.join(name)
}

struct Shop {
    location: Ulid,
    customer: Ulid,
}

async fn open_shop(engine: &Engine) -> Shop {
    let shop = Shop {
        location: Ulid::new(),
        customer: Ulid::new(),
    };
    engine
        .create_location(shop.location, "bench".into())
        .await
        .expect("create location");
    engine
        .register_customer(shop.customer, shop.location, "bench".into())
        .await
        .expect("register customer");
    shop
}

fn hour_slot(shop: &Shop, slot: i64) -> BookingRequest {
    BookingRequest {
        id: Ulid::new(),
        location_id: shop.location,
        customer_id: shop.customer,
        staff_id: None,
        start: BASE + slot * HOUR_MS,
        end: Some(BASE + (slot + 1) * HOUR_MS),
        service: ServiceSelection::Custom {
            name: "bench".into(),
            description: None,
            price: Decimal::new(5000, 2),
            duration_minutes: None,
        },
        discount: Decimal::ZERO,
        notes: None,
        vehicle: None,
    }
}

async fn phase1_sequential(engine: &Engine) {
    let shop = open_shop(engine).await;
    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        engine
            .create_appointment(hour_slot(&shop, i as i64))
            .await
            .expect("sequential booking");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(engine: Arc<Engine>) {
    let n_tasks = 10;
    let n_per_task = 200;
    let start = Instant::now();

    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let shop = open_shop(&engine).await;
            for j in 0..n_per_task {
                engine
                    .create_appointment(hour_slot(&shop, j))
                    .await
                    .expect("concurrent booking");
            }
        }));
    }
    for h in futures::future::join_all(handles).await {
        h.expect("task panicked");
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} locations x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

/// Many tasks race for the same slots of one location; each slot must end up
/// with exactly one appointment.
async fn phase3_contention(engine: Arc<Engine>) {
    let shop = Arc::new(open_shop(&engine).await);
    let slots = 100;
    let racers = 8;
    let won = Arc::new(AtomicUsize::new(0));
    let lost = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let mut handles = Vec::new();
    for _ in 0..racers {
        let (engine, shop, won, lost) = (engine.clone(), shop.clone(), won.clone(), lost.clone());
        handles.push(tokio::spawn(async move {
            for slot in 0..slots {
                match engine.create_appointment(hour_slot(&shop, slot)).await {
                    Ok(_) => won.fetch_add(1, Ordering::Relaxed),
                    Err(EngineError::Conflict(_)) => lost.fetch_add(1, Ordering::Relaxed),
                    Err(e) => panic!("unexpected error: {e}"),
                };
            }
        }));
    }
    for h in futures::future::join_all(handles).await {
        h.expect("task panicked");
    }

    let won = won.load(Ordering::Relaxed);
    let lost = lost.load(Ordering::Relaxed);
    println!(
        "  {racers} racers x {slots} slots: {won} booked, {lost} conflicts in {:.2}s",
        start.elapsed().as_secs_f64()
    );
    assert_eq!(won, slots as usize, "every slot must be booked exactly once");
}

async fn phase4_read_under_load(engine: Arc<Engine>) {
    let shop = Arc::new(open_shop(&engine).await);
    for i in 0..500 {
        engine
            .create_appointment(hour_slot(&shop, i))
            .await
            .expect("prefill");
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut writers = Vec::new();
    for _ in 0..5 {
        let (engine, stop) = (engine.clone(), stop.clone());
        writers.push(tokio::spawn(async move {
            let own = open_shop(&engine).await;
            let mut i = 0;
            while !stop.load(Ordering::Relaxed) {
                let _ = engine.create_appointment(hour_slot(&own, i)).await;
                i += 1;
            }
        }));
    }

    let mut readers = Vec::new();
    for _ in 0..10 {
        let (engine, shop) = (engine.clone(), shop.clone());
        readers.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(500);
            for i in 0..500 {
                let from = BASE + (i % 400) * HOUR_MS;
                let t = Instant::now();
                engine
                    .calendar(shop.location, from, from + 24 * HOUR_MS)
                    .await
                    .expect("calendar");
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in futures::future::join_all(readers).await {
        all.extend(h.expect("reader panicked"));
    }
    stop.store(true, Ordering::Relaxed);
    futures::future::join_all(writers).await;

    print_latency("calendar query", &mut all);
}

async fn phase5_compaction(engine: Arc<Engine>) {
    let appends = engine.wal_appends_since_compact().await;
    let start = Instant::now();
    engine.compact_wal().await.expect("compaction");
    println!(
        "  compacted {appends} appends in {:.2}ms",
        start.elapsed().as_secs_f64() * 1000.0
    );
}

#[tokio::main]
async fn main() {
    println!("=== slotkeeper stress benchmark ===\n");

    let engine = Arc::new(
        Engine::new(bench_wal("stress.wal"), Arc::new(NotifyHub::new())).expect("open engine"),
    );

    println!("[phase 1] sequential write throughput");
    phase1_sequential(&engine).await;

    println!("\n[phase 2] concurrent write throughput");
    phase2_concurrent(engine.clone()).await;

    println!("\n[phase 3] contention on one location");
    phase3_contention(engine.clone()).await;

    println!("\n[phase 4] read latency under write load");
    phase4_read_under_load(engine.clone()).await;

    println!("\n[phase 5] WAL compaction");
    phase5_compaction(engine).await;

    println!("\n=== done ===");
}
