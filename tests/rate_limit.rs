use std::sync::Arc;
use std::time::{Duration, Instant};

use evnet::rate::{
    Bucket, CompoundRateLimitedLayer, Direction, RateLimitManager, RateLimitedLayer, RateLimiter,
    UNLIMITED,
};
use evnet::{AddressFamily, EventHandler, EventLoop, ListenSocket, Socket, ThreadPool};

mod util;

use util::{Driver, Mode};

/// Simulates a consumer with a natural demand rate by polling its bucket.
fn spawn_consumer(
    bucket: Arc<Bucket>,
    demand_per_second: u64,
    stop_after: Duration,
) -> std::thread::JoinHandle<u64> {
    std::thread::spawn(move || {
        let step = Duration::from_millis(20);
        let per_step = (demand_per_second / 50).max(1);
        let deadline = Instant::now() + stop_after;
        let mut consumed = 0;
        while Instant::now() < deadline {
            let available = bucket.available(Direction::Inbound);
            if available > 0 {
                let take = per_step.min(available);
                if available != UNLIMITED {
                    bucket.consume(Direction::Inbound, take);
                }
                consumed += take;
            }
            std::thread::sleep(step);
        }
        consumed
    })
}

/// The hierarchy scenario: one root limiter at 10 kB/s, three direct leaf
/// buckets with demands of 1, 2 and 1000 B/s, and four more buckets under
/// three sub-limiters limited to 1000, 2500 and unlimited B/s. The total
/// and the sub-limited groups must match their caps within 10%.
#[test]
fn hierarchical_fairness_and_caps() {
    util::init();
    let pool = ThreadPool::new();
    let event_loop = EventLoop::spawn(&pool);
    let manager = RateLimitManager::new(&event_loop);

    let root = RateLimiter::new();
    root.set_limits(10_000, UNLIMITED);
    manager.add(&root);

    let direct: Vec<(Arc<Bucket>, u64)> = [1u64, 2, 1000]
        .iter()
        .map(|demand| {
            let bucket = Arc::new(Bucket::new());
            root.add_bucket(&bucket);
            (bucket, *demand)
        })
        .collect();

    let sub_a = RateLimiter::new();
    sub_a.set_limits(1_000, UNLIMITED);
    root.add_limiter(&sub_a);
    let sub_a_buckets: Vec<(Arc<Bucket>, u64)> = [3u64, 1000]
        .iter()
        .map(|demand| {
            let bucket = Arc::new(Bucket::new());
            sub_a.add_bucket(&bucket);
            (bucket, *demand)
        })
        .collect();

    let sub_b = RateLimiter::new();
    sub_b.set_limits(2_500, UNLIMITED);
    root.add_limiter(&sub_b);
    let sub_b_bucket = Arc::new(Bucket::new());
    sub_b.add_bucket(&sub_b_bucket);

    let sub_c = RateLimiter::new();
    root.add_limiter(&sub_c);
    let sub_c_bucket = Arc::new(Bucket::new());
    sub_c.add_bucket(&sub_c_bucket);

    // Warm up, then measure.
    let warmup = Duration::from_secs(3);
    let measure = Duration::from_secs(5);
    let total_time = warmup + measure;

    let mut handles = Vec::new();
    let mut demands = Vec::new();
    for (bucket, demand) in &direct {
        handles.push(spawn_consumer(bucket.clone(), *demand, total_time));
        demands.push(*demand);
    }
    let sub_a_start = handles.len();
    for (bucket, demand) in &sub_a_buckets {
        handles.push(spawn_consumer(bucket.clone(), *demand, total_time));
        demands.push(*demand);
    }
    let sub_a_end = handles.len();
    handles.push(spawn_consumer(sub_b_bucket.clone(), 100_000, total_time));
    handles.push(spawn_consumer(sub_c_bucket.clone(), 100_000, total_time));

    std::thread::sleep(total_time + Duration::from_millis(200));
    let consumed: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let total: u64 = consumed.iter().sum();

    // Low-demand buckets are never throttled.
    assert!(consumed[0] >= demands[0] * (total_time.as_secs() - 1));
    assert!(consumed[1] >= demands[1] * (total_time.as_secs() - 1));

    // Total stays within 10% of the cap over the whole run.
    let cap = 10_000 * total_time.as_secs();
    assert!(
        total as f64 >= cap as f64 * 0.9 && total as f64 <= cap as f64 * 1.1,
        "total {} outside [{}, {}]",
        total,
        cap as f64 * 0.9,
        cap as f64 * 1.1
    );

    // The 1000 B/s sub-limiter holds its group to its cap.
    let sub_a_total: u64 = consumed[sub_a_start..sub_a_end].iter().sum();
    let sub_cap = 1_000 * total_time.as_secs();
    assert!(
        sub_a_total as f64 >= sub_cap as f64 * 0.9 && sub_a_total as f64 <= sub_cap as f64 * 1.1,
        "sub-limited group consumed {} outside [{}, {}]",
        sub_a_total,
        sub_cap as f64 * 0.9,
        sub_cap as f64 * 1.1
    );

    drop(manager);
    event_loop.stop();
}

#[test]
fn removal_returns_unspent_tokens() {
    util::init();
    let pool = ThreadPool::new();
    let event_loop = EventLoop::spawn(&pool);
    let manager = RateLimitManager::new(&event_loop);

    let root = RateLimiter::new();
    root.set_limits(1_000, 1_000);
    manager.add(&root);

    let bucket = Arc::new(Bucket::new());
    root.add_bucket(&bucket);

    // Trigger some ticks.
    let _ = bucket.available(Direction::Inbound);
    std::thread::sleep(Duration::from_millis(600));

    bucket.remove();
    // Removing twice is fine, and the removed bucket no longer hands out
    // tokens.
    bucket.remove();
    assert_eq!(bucket.available(Direction::Inbound), UNLIMITED);

    drop(manager);
    event_loop.stop();
}

/// A rate-limited layer on a loopback connection caps the transfer rate.
#[test]
fn rate_limited_layer_caps_throughput() {
    util::init();
    let pool = ThreadPool::new();
    let event_loop = EventLoop::spawn(&pool);
    let manager = RateLimitManager::new(&event_loop);

    let limiter = RateLimiter::new();
    limiter.set_limits(UNLIMITED, 50_000);
    manager.add(&limiter);

    let sink_driver = Driver::new(Mode::Sink, Vec::new());
    let sink_handler: Arc<dyn EventHandler> = sink_driver.clone();
    let listener = Arc::new(ListenSocket::new(&pool, &event_loop, None).unwrap());
    listener.bind("127.0.0.1".parse().unwrap());
    listener.listen(AddressFamily::Ipv4, 0).unwrap();
    let port = listener.local_port().unwrap();

    let flood_driver = Driver::new(Mode::Flood, vec![0xa5; 16 * 1024]);
    let client = Arc::new(Socket::new(&pool, &event_loop, None).unwrap());
    client
        .connect("127.0.0.1", port, AddressFamily::Unknown)
        .unwrap();

    let server = loop {
        match listener.fast_accept() {
            Ok(descriptor) => {
                break Arc::new(
                    Socket::from_descriptor(descriptor, &pool, &event_loop, Some(sink_handler.clone()))
                        .unwrap(),
                )
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10))
            }
            Err(err) => panic!("accept failed: {}", err),
        }
    };
    sink_driver.attach(server.clone());
    sink_driver.mark_connected();

    let flood_handler: Arc<dyn EventHandler> = flood_driver.clone();
    let layer = RateLimitedLayer::new(
        &event_loop,
        Some(flood_handler),
        client.clone(),
        Some(&limiter),
    );
    flood_driver.attach(layer.clone());
    assert!(flood_driver.wait_connected(Duration::from_secs(5)));

    // Warm up, then measure the steady-state rate.
    std::thread::sleep(Duration::from_secs(2));
    let start = flood_driver.total_sent();
    let window = Duration::from_secs(4);
    std::thread::sleep(window);
    let sent = flood_driver.total_sent() - start;

    let rate = sent as f64 / window.as_secs_f64();
    assert!(
        (42_500.0..=57_500.0).contains(&rate),
        "rate {} outside the expected band",
        rate
    );
    assert_eq!(flood_driver.error(), 0);

    drop(manager);
    event_loop.stop();
}

/// The compound layer honors the strictest of its limiters and recovers
/// when the limiter is removed.
#[test]
fn compound_layer_tracks_minimum() {
    util::init();
    let pool = ThreadPool::new();
    let event_loop = EventLoop::spawn(&pool);
    let manager = RateLimitManager::new(&event_loop);

    let loose = RateLimiter::new();
    loose.set_limits(UNLIMITED, 1_000_000);
    manager.add(&loose);
    let strict = RateLimiter::new();
    strict.set_limits(UNLIMITED, 20_000);
    manager.add(&strict);

    let sink_driver = Driver::new(Mode::Sink, Vec::new());
    let sink_handler: Arc<dyn EventHandler> = sink_driver.clone();
    let listener = Arc::new(ListenSocket::new(&pool, &event_loop, None).unwrap());
    listener.bind("127.0.0.1".parse().unwrap());
    listener.listen(AddressFamily::Ipv4, 0).unwrap();
    let port = listener.local_port().unwrap();

    let flood_driver = Driver::new(Mode::Flood, vec![0x5a; 16 * 1024]);
    let client = Arc::new(Socket::new(&pool, &event_loop, None).unwrap());
    client
        .connect("127.0.0.1", port, AddressFamily::Unknown)
        .unwrap();

    let server = loop {
        match listener.fast_accept() {
            Ok(descriptor) => {
                break Arc::new(
                    Socket::from_descriptor(descriptor, &pool, &event_loop, Some(sink_handler.clone()))
                        .unwrap(),
                )
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(10))
            }
            Err(err) => panic!("accept failed: {}", err),
        }
    };
    sink_driver.attach(server.clone());
    sink_driver.mark_connected();

    let flood_handler: Arc<dyn EventHandler> = flood_driver.clone();
    let layer = CompoundRateLimitedLayer::new(&event_loop, Some(flood_handler), client.clone());
    layer.add_limiter(&loose);
    layer.add_limiter(&strict);
    flood_driver.attach(layer.clone());
    assert!(flood_driver.wait_connected(Duration::from_secs(5)));

    std::thread::sleep(Duration::from_secs(2));
    let start = flood_driver.total_sent();
    std::thread::sleep(Duration::from_secs(3));
    let strict_rate = (flood_driver.total_sent() - start) as f64 / 3.0;
    assert!(
        strict_rate < 30_000.0,
        "strict limiter not applied: {}",
        strict_rate
    );

    // Removing the strict limiter lifts the cap; the removal wakeup kicks
    // the blocked writer back into motion.
    layer.remove_limiter(&strict);
    std::thread::sleep(Duration::from_secs(1));
    let start = flood_driver.total_sent();
    std::thread::sleep(Duration::from_secs(2));
    let free_rate = (flood_driver.total_sent() - start) as f64 / 2.0;
    assert!(
        free_rate > 100_000.0,
        "cap not lifted after removal: {}",
        free_rate
    );

    drop(manager);
    event_loop.stop();
}
