use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

const DAY: i64 = 86_400_000;
/// 2030-03-17; every stay in the bench lies after it.
const T0: i64 = 1_900_000_000_000;

async fn connect(host: &str, port: u16, db: &str) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(db)
        .user("roost")
        .password("roost");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn fresh_tenant(phase: &str) -> String {
    format!("bench_{phase}_{}", Ulid::new())
}

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
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().map_or(0.0, |d| d.as_secs_f64() * 1000.0),
    );
}

struct Listing {
    owner: Ulid,
    guest: Ulid,
    property: Ulid,
}

/// One owner, one guest and one property in the client's tenant.
async fn setup(client: &tokio_postgres::Client) -> Listing {
    let owner = Ulid::new();
    let guest = Ulid::new();
    let property = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO users (id, email, name, role, business_name) VALUES ('{owner}', 'owner-{owner}@bench.io', 'Owner', 'owner', 'Bench Stays')"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO users (id, email, name, role) VALUES ('{guest}', 'guest-{guest}@bench.io', 'Guest', 'guest')"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO properties (id, owner_id, name, location, price) VALUES ('{property}', '{owner}', 'Bench Loft', 'Lisbon', 95)"
        ))
        .await
        .unwrap();
    Listing { owner, guest, property }
}

fn booking_sql(property: Ulid, guest: Ulid, night: i64) -> String {
    let bid = Ulid::new();
    // Night n is [T0 + 2n days, T0 + 2n days + 1 day]; gaps keep stays disjoint.
    let s = T0 + 2 * night * DAY;
    let e = s + DAY;
    format!(
        r#"INSERT INTO bookings (id, property_id, guest_id, start, "end") VALUES ('{bid}', '{property}', '{guest}', {s}, {e})"#
    )
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port, &fresh_tenant("seq")).await;
    let listing = setup(&client).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let t = Instant::now();
        client
            .batch_execute(&booking_sql(listing.property, listing.guest, i as i64))
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent(host: &str, port: u16) {
    let n_tasks = 10;
    let n_per_task = 200;
    let tenant = fresh_tenant("concurrent");

    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_tasks {
        let host = host.to_string();
        let tenant = tenant.clone();
        handles.push(tokio::spawn(async move {
            // Shared tenant, one property per task: writers only contend on the WAL.
            let client = connect(&host, port, &tenant).await;
            let listing = setup(&client).await;
            for j in 0..n_per_task {
                client
                    .batch_execute(&booking_sql(listing.property, listing.guest, j))
                    .await
                    .unwrap();
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_contention(host: &str, port: u16) {
    let n_clients = 20;
    let n_nights = 100;
    let tenant = fresh_tenant("contention");

    let setup_client = connect(host, port, &tenant).await;
    let listing = Arc::new(setup(&setup_client).await);

    let accepted = Arc::new(AtomicUsize::new(0));
    let refused = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();

    for _ in 0..n_clients {
        let host = host.to_string();
        let tenant = tenant.clone();
        let listing = listing.clone();
        let accepted = accepted.clone();
        let refused = refused.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            // Every client races for the same nights.
            for night in 0..n_nights {
                match client
                    .batch_execute(&booking_sql(listing.property, listing.guest, night))
                    .await
                {
                    Ok(()) => accepted.fetch_add(1, Ordering::Relaxed),
                    Err(_) => refused.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let accepted = accepted.load(Ordering::Relaxed);
    let refused = refused.load(Ordering::Relaxed);
    println!(
        "  {n_clients} clients x {n_nights} nights in {:.2}s: {accepted} accepted, {refused} refused",
        elapsed.as_secs_f64()
    );
    if accepted != n_nights as usize {
        println!("  !! expected exactly {n_nights} accepted bookings");
    }
}

async fn phase4_read_under_load(host: &str, port: u16) {
    let tenant = fresh_tenant("reads");
    let setup_client = connect(host, port, &tenant).await;
    let listing = Arc::new(setup(&setup_client).await);
    for night in 0..200 {
        setup_client
            .batch_execute(&booking_sql(listing.property, listing.guest, night))
            .await
            .unwrap();
    }

    // Writers book their own properties in the same tenant.
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let host = host.to_string();
        let tenant = tenant.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            let own = setup(&client).await;
            let mut night = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let _ = client
                    .batch_execute(&booking_sql(own.property, own.guest, night))
                    .await;
                night += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let host = host.to_string();
        let tenant = tenant.clone();
        let listing = listing.clone();
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            // Half the readers take the owner's view, half the guest's.
            let sql = if r % 2 == 0 {
                format!(
                    "SELECT * FROM property_detail WHERE property_id = '{}' AND owner_id = '{}'",
                    listing.property, listing.owner
                )
            } else {
                format!("SELECT * FROM guest_statistics WHERE guest_id = '{}'", listing.guest)
            };
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client.simple_query(&sql).await.unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("summary query", &mut all_latencies);
}

#[tokio::main]
async fn main() {
    let host = std::env::var("ROOST_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("ROOST_PORT")
        .unwrap_or_else(|_| "5434".into())
        .parse()
        .expect("invalid ROOST_PORT");

    println!("=== roost stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential booking throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] concurrent booking throughput");
    phase2_concurrent(&host, port).await;

    println!("\n[phase 3] contention on the same nights");
    phase3_contention(&host, port).await;

    println!("\n[phase 4] summary latency under write load");
    phase4_read_under_load(&host, port).await;

    println!("\n=== benchmark complete ===");
}
