use std::net::IpAddr;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use evnet::event::dispatch;
use evnet::lookup::{HostnameLookup, HostnameLookupTag};
use evnet::{AddressFamily, Event, EventHandler, EventLoop, ThreadPool};

mod util;

#[derive(Default)]
struct LookupResult {
    result: Mutex<Option<(i32, Vec<IpAddr>)>>,
    cond: Condvar,
}

impl LookupResult {
    fn wait(&self, timeout: Duration) -> Option<(i32, Vec<IpAddr>)> {
        let deadline = Instant::now() + timeout;
        let mut result = self.result.lock().unwrap();
        while result.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.cond.wait_timeout(result, deadline - now).unwrap();
            result = guard;
        }
        result.clone()
    }
}

impl EventHandler for LookupResult {
    fn on_event(&self, event: &dyn Event) {
        if let Some((error, addresses)) =
            dispatch::<HostnameLookupTag, _, _>(event, |(_, error, addresses)| {
                (*error, addresses.clone())
            })
        {
            *self.result.lock().unwrap() = Some((error, addresses));
            self.cond.notify_all();
        }
    }
}

#[test]
fn localhost_resolves() {
    util::init();
    let pool = ThreadPool::new();
    let event_loop = EventLoop::spawn(&pool);

    let result = Arc::new(LookupResult::default());
    let handler: Arc<dyn EventHandler> = result.clone();
    let lookup = HostnameLookup::new(&pool, &event_loop, handler);

    lookup
        .lookup("localhost", AddressFamily::Unknown)
        .expect("cannot start lookup");

    let (error, addresses) = result.wait(Duration::from_secs(10)).expect("no result");
    assert_eq!(error, 0);
    assert!(!addresses.is_empty());
    assert!(addresses
        .iter()
        .any(|ip| ip.is_loopback()));

    // After a reset a new lookup can start immediately.
    lookup.reset();
    lookup
        .lookup("localhost", AddressFamily::Ipv4)
        .expect("cannot start lookup after reset");

    event_loop.stop();
}
