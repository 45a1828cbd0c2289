//! The rate limit manager, limiters and buckets.
//!
//! Locking discipline: every node guards its state with its own mutex. The
//! periodic tick traverses the tree top-down, locking parents before
//! children. Removal goes the other way, child first, and breaks deadlocks
//! by try-locking the parent with a yield back-off. Wakeups of waiting
//! consumers are collected during the traversal and fired with no locks
//! held.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::event::{dispatch, Event, EventHandler, EventLoop, TimerId, TimerTag};
use crate::rate::{Direction, Rate, DIRECTIONS, UNLIMITED};

/// Ticks per second of the token distribution timer.
const FREQUENCY: u64 = 5;

const TICK: Duration = Duration::from_millis(1000 / FREQUENCY);

/// The largest bucket-size multiplier a persistently saturated bucket can
/// reach.
const MAX_OVERFLOW_MULTIPLIER: Rate = 1024 * 1024;

/// Signals token availability to a consumer blocked on an empty bucket.
///
/// Implemented e.g. by the rate-limited socket layers, which wake their
/// event handler with a synthesized read or write event.
pub trait BucketObserver: Send + Sync {
    /// Called after a tick made tokens available while a consumer was
    /// waiting.
    fn wakeup(&self, direction: Direction);
}

// ---------------------------------------------------------------------------
// Node state

#[derive(Clone)]
pub(crate) enum Child {
    Limiter(Arc<LimiterShared>),
    Bucket(Arc<BucketShared>),
}

pub(crate) enum Parent {
    Manager(Weak<ManagerShared>),
    Limiter(Weak<LimiterShared>),
}

#[derive(Copy, Clone)]
struct BucketDir {
    available: Rate,
    overflow_multiplier: Rate,
    bucket_size: Rate,
    waiting: bool,
    unsaturated: bool,
}

impl Default for BucketDir {
    fn default() -> BucketDir {
        BucketDir {
            available: UNLIMITED,
            overflow_multiplier: 1,
            bucket_size: UNLIMITED,
            waiting: false,
            unsaturated: false,
        }
    }
}

pub(crate) struct BucketState {
    parent: Option<Parent>,
    idx: usize,
    mgr: Option<Weak<ManagerShared>>,
    dirs: [BucketDir; 2],
}

pub(crate) struct BucketShared {
    state: Mutex<BucketState>,
    observer: Mutex<Option<Weak<dyn BucketObserver>>>,
}

#[derive(Copy, Clone)]
struct LimiterDir {
    limit: Rate,
    merged_tokens: Rate,
    overflow: Rate,
    debt: Rate,
    unused_capacity: Rate,
    carry: Rate,
    unsaturated: usize,
}

impl Default for LimiterDir {
    fn default() -> LimiterDir {
        LimiterDir {
            limit: UNLIMITED,
            merged_tokens: 0,
            overflow: 0,
            debt: 0,
            unused_capacity: 0,
            carry: 0,
            unsaturated: 0,
        }
    }
}

pub(crate) struct LimiterState {
    parent: Option<Parent>,
    idx: usize,
    mgr: Option<Weak<ManagerShared>>,
    children: Vec<Child>,
    scratch: Vec<usize>,
    weight: usize,
    dirs: [LimiterDir; 2],
}

pub(crate) struct LimiterShared {
    state: Mutex<LimiterState>,
}

pub(crate) struct ManagerShared {
    limiters: Mutex<Vec<Arc<LimiterShared>>>,
    // The timer slot has its own lock: it is touched from within tree
    // traversals (via record_activity), which must never wait on the
    // limiter list.
    timer: Mutex<Option<TimerId>>,
    activity: AtomicI32,
    burst_tolerance: AtomicU64,
    event_loop: EventLoop,
    // The manager's own event handler, target of the tick timer. Holds a
    // weak reference back, so no cycle.
    handler: Mutex<Option<Arc<dyn EventHandler>>>,
}

type Wakeups = Vec<(Arc<dyn BucketObserver>, Direction)>;

// ---------------------------------------------------------------------------
// Manager

/// Context for rate limiters.
///
/// Each active [`RateLimiter`] must be added to a manager. The manager runs
/// the timer that periodically adds tokens to buckets; the timer is started
/// and stopped automatically so that nothing runs while there is no
/// activity.
pub struct RateLimitManager {
    shared: Arc<ManagerShared>,
}

struct ManagerHandler {
    shared: Weak<ManagerShared>,
}

impl EventHandler for ManagerHandler {
    fn on_event(&self, event: &dyn Event) {
        if let Some(shared) = self.shared.upgrade() {
            dispatch::<TimerTag, _, _>(event, |id| on_timer(&shared, *id));
        }
    }
}

impl RateLimitManager {
    /// Creates a manager driving its timer through `event_loop`.
    pub fn new(event_loop: &EventLoop) -> RateLimitManager {
        let shared = Arc::new(ManagerShared {
            limiters: Mutex::new(Vec::new()),
            timer: Mutex::new(None),
            activity: AtomicI32::new(2),
            burst_tolerance: AtomicU64::new(1),
            event_loop: event_loop.clone(),
            handler: Mutex::new(None),
        });
        let handler: Arc<dyn EventHandler> = Arc::new(ManagerHandler {
            shared: Arc::downgrade(&shared),
        });
        *shared.handler.lock().unwrap() = Some(handler);
        RateLimitManager { shared }
    }

    /// Adds a limiter to the manager. A limiter that was attached elsewhere
    /// is detached first.
    pub fn add(&self, limiter: &RateLimiter) {
        let node = &limiter.shared;
        remove_limiter_from_parent(node);

        let mut limiters = self.shared.limiters.lock().unwrap();
        set_mgr_recursive_limiter(node, Some(Arc::downgrade(&self.shared)));
        {
            let mut st = node.state.lock().unwrap();
            st.parent = Some(Parent::Manager(Arc::downgrade(&self.shared)));
            st.idx = limiters.len();
        }
        limiters.push(Arc::clone(node));
        drop(limiters);

        // Give the new limiter its first tick right away.
        let mut wakeups = Wakeups::new();
        process_limiter(&self.shared, node, &mut wakeups);
        fire_wakeups(wakeups);
    }

    /// Burst tolerance, a multiplier to bucket sizes; helps achieving the
    /// average rate on bursty connections. Clamped to `1..=10`.
    pub fn set_burst_tolerance(&self, tolerance: Rate) {
        self.shared
            .burst_tolerance
            .store(tolerance.clamp(1, 10), Ordering::Relaxed);
    }
}

impl Drop for RateLimitManager {
    fn drop(&mut self) {
        let handler = self.shared.handler.lock().unwrap().take();
        if let Some(handler) = handler {
            if let Some(timer) = self.shared.timer.lock().unwrap().take() {
                self.shared.event_loop.stop_timer(timer);
            }
            self.shared.event_loop.remove_handler(&handler);
        }
    }
}

impl std::fmt::Debug for RateLimitManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let limiters = self.shared.limiters.lock().unwrap();
        f.debug_struct("RateLimitManager")
            .field("limiters", &limiters.len())
            .finish()
    }
}

fn on_timer(shared: &Arc<ManagerShared>, _id: TimerId) {
    if shared.activity.fetch_add(1, Ordering::SeqCst) + 1 >= 2 {
        if let Some(timer) = shared.timer.lock().unwrap().take() {
            shared.event_loop.stop_timer(timer);
        }
    }

    let limiters = shared.limiters.lock().unwrap().clone();
    let mut wakeups = Wakeups::new();
    for limiter in &limiters {
        process_limiter(shared, limiter, &mut wakeups);
    }
    fire_wakeups(wakeups);
}

pub(crate) fn record_activity(shared: &Arc<ManagerShared>) {
    if shared.activity.swap(0, Ordering::SeqCst) == 2 {
        let handler = shared.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            let timer = shared.event_loop.add_timer(&handler, TICK, false);
            let old = shared.timer.lock().unwrap().replace(timer);
            if let Some(old) = old {
                shared.event_loop.stop_timer(old);
            }
        }
    }
}

fn record_activity_weak(mgr: &Option<Weak<ManagerShared>>) {
    if let Some(shared) = mgr.as_ref().and_then(Weak::upgrade) {
        record_activity(&shared);
    }
}

fn burst_tolerance(mgr: &Option<Weak<ManagerShared>>) -> Rate {
    mgr.as_ref()
        .and_then(Weak::upgrade)
        .map(|m| m.burst_tolerance.load(Ordering::Relaxed))
        .unwrap_or(1)
}

fn fire_wakeups(wakeups: Wakeups) {
    for (observer, direction) in wakeups {
        observer.wakeup(direction);
    }
}

/// One full tick for a root limiter: update stats, add tokens, distribute
/// overflow, then collect wakeups.
fn process_limiter(
    shared: &Arc<ManagerShared>,
    limiter: &Arc<LimiterShared>,
    wakeups: &mut Wakeups,
) {
    let mut active = false;
    update_stats_limiter(limiter, &mut active);
    if active {
        record_activity(shared);
    }

    let burst = shared.burst_tolerance.load(Ordering::Relaxed);
    for d in DIRECTIONS {
        add_tokens_limiter(limiter, burst, d, UNLIMITED, UNLIMITED);
        distribute_overflow_limiter(limiter, burst, d, 0);
    }

    collect_wakeups_limiter(limiter, wakeups);
}

// ---------------------------------------------------------------------------
// Limiter

/// A limiter for the attached buckets and sub-limiters.
///
/// Distributes tokens fairly between its children, with overflow
/// redistributed so that the total limit is not exceeded. A limiter is
/// either added to a [`RateLimitManager`] or as sub-limiter to another
/// limiter; for leaf buckets the effective limit is the lowest limit
/// imposed by any of their parents.
///
/// Dropping the limiter detaches it and releases its children.
pub struct RateLimiter {
    shared: Arc<LimiterShared>,
}

impl Default for RateLimiter {
    fn default() -> RateLimiter {
        RateLimiter::new()
    }
}

impl RateLimiter {
    /// Creates a detached limiter with unlimited rate.
    pub fn new() -> RateLimiter {
        RateLimiter {
            shared: Arc::new(LimiterShared {
                state: Mutex::new(LimiterState {
                    parent: None,
                    idx: usize::MAX,
                    mgr: None,
                    children: Vec::new(),
                    scratch: Vec::new(),
                    weight: 0,
                    dirs: [LimiterDir::default(); 2],
                }),
            }),
        }
    }

    /// Sets the number of octets all children combined may consume each
    /// second. Pass [`UNLIMITED`] for no limit (the default).
    pub fn set_limits(&self, download_limit: Rate, upload_limit: Rate) {
        let mut st = self.shared.state.lock().unwrap();
        let mut changed = do_set_limit(&mut st, Direction::Inbound, download_limit);
        changed |= do_set_limit(&mut st, Direction::Outbound, upload_limit);
        let mgr = st.mgr.clone();
        drop(st);
        if changed {
            record_activity_weak(&mgr);
        }
    }

    /// Returns the current limit.
    pub fn limit(&self, direction: Direction) -> Rate {
        self.shared.state.lock().unwrap().dirs[direction as usize].limit
    }

    /// Adds a bucket. A bucket that was attached elsewhere is detached
    /// first.
    pub fn add_bucket(&self, bucket: &Bucket) {
        remove_bucket_from_parent(&bucket.shared);
        add_child(&self.shared, Child::Bucket(Arc::clone(&bucket.shared)));
    }

    /// Adds a sub-limiter. A limiter that was attached elsewhere is
    /// detached first.
    pub fn add_limiter(&self, limiter: &RateLimiter) {
        remove_limiter_from_parent(&limiter.shared);
        add_child(&self.shared, Child::Limiter(Arc::clone(&limiter.shared)));
    }

    pub(crate) fn shared(&self) -> &Arc<LimiterShared> {
        &self.shared
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        // Release the children, then detach from the parent.
        {
            let mut st = self.shared.state.lock().unwrap();
            for child in st.children.drain(..) {
                match child {
                    Child::Limiter(l) => {
                        let mut cst = l.state.lock().unwrap();
                        cst.parent = None;
                        cst.idx = usize::MAX;
                    }
                    Child::Bucket(b) => {
                        let mut cst = b.state.lock().unwrap();
                        cst.parent = None;
                        cst.idx = usize::MAX;
                    }
                }
            }
        }
        remove_limiter_from_parent(&self.shared);
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.shared.state.lock().unwrap();
        f.debug_struct("RateLimiter")
            .field("children", &st.children.len())
            .field("weight", &st.weight)
            .finish()
    }
}

fn do_set_limit(st: &mut LimiterState, direction: Direction, limit: Rate) -> bool {
    let weight = if st.weight == 0 { 1 } else { st.weight } as Rate;
    let data = &mut st.dirs[direction as usize];
    if data.limit == limit {
        return false;
    }
    data.limit = limit;
    if data.limit != UNLIMITED {
        data.merged_tokens = data.merged_tokens.min(data.limit / weight);
    }
    true
}

fn set_mgr_recursive_limiter(node: &Arc<LimiterShared>, mgr: Option<Weak<ManagerShared>>) {
    let children = {
        let mut st = node.state.lock().unwrap();
        let same = match (&st.mgr, &mgr) {
            (Some(a), Some(b)) => Weak::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        if same {
            return;
        }
        st.mgr = mgr.clone();
        st.children.clone()
    };
    for child in children {
        match child {
            Child::Limiter(l) => set_mgr_recursive_limiter(&l, mgr.clone()),
            Child::Bucket(b) => b.state.lock().unwrap().mgr = mgr.clone(),
        }
    }
}

/// Attaches a child to a limiter, handing it a half share of the current
/// tick's tokens as an advance. The advance is recorded as debt and repaid
/// from future ticks.
fn add_child(parent: &Arc<LimiterShared>, child: Child) {
    let mut st = parent.state.lock().unwrap();
    let mgr = st.mgr.clone();
    match &child {
        Child::Limiter(l) => set_mgr_recursive_limiter(l, mgr.clone()),
        Child::Bucket(b) => b.state.lock().unwrap().mgr = mgr.clone(),
    }
    let idx = st.children.len();
    match &child {
        Child::Limiter(l) => {
            let mut cst = l.state.lock().unwrap();
            cst.parent = Some(Parent::Limiter(Arc::downgrade(parent)));
            cst.idx = idx;
        }
        Child::Bucket(b) => {
            let mut cst = b.state.lock().unwrap();
            cst.parent = Some(Parent::Limiter(Arc::downgrade(parent)));
            cst.idx = idx;
        }
    }
    st.children.push(child.clone());

    let mut active = false;
    let (child_weight, _) = update_stats_child(&child, &mut active);
    if active {
        record_activity_weak(&mgr);
    }

    let bucket_weight = child_weight.max(1) as Rate;
    st.weight += bucket_weight as usize;

    let burst = burst_tolerance(&mgr);
    for d in DIRECTIONS {
        let data = &st.dirs[d as usize];
        let tokens = if data.merged_tokens == UNLIMITED {
            UNLIMITED
        } else {
            data.merged_tokens / (bucket_weight * 2)
        };
        add_tokens_child(&child, burst, d, tokens, tokens);
        distribute_overflow_child(&child, burst, d, 0);
        if tokens != UNLIMITED {
            st.dirs[d as usize].debt += tokens * bucket_weight;
        }
    }
}

fn update_stats_child(child: &Child, active: &mut bool) -> (usize, [usize; 2]) {
    match child {
        Child::Limiter(l) => update_stats_limiter(l, active),
        Child::Bucket(b) => (1, update_stats_bucket(b, active)),
    }
}

fn update_stats_limiter(node: &Arc<LimiterShared>, active: &mut bool) -> (usize, [usize; 2]) {
    let children = {
        let mut st = node.state.lock().unwrap();
        st.weight = 0;
        st.dirs[0].unsaturated = 0;
        st.dirs[1].unsaturated = 0;
        st.children.clone()
    };

    let mut weight = 0;
    let mut unsaturated = [0, 0];
    for child in &children {
        let (w, u) = update_stats_child(child, active);
        weight += w;
        unsaturated[0] += u[0];
        unsaturated[1] += u[1];
    }

    let mut st = node.state.lock().unwrap();
    st.weight = weight;
    st.dirs[0].unsaturated = unsaturated[0];
    st.dirs[1].unsaturated = unsaturated[1];
    (
        weight,
        [
            gated_unsaturated(&st, Direction::Inbound),
            gated_unsaturated(&st, Direction::Outbound),
        ],
    )
}

// A limiter only counts as unsaturated while it has unused capacity left.
fn gated_unsaturated(st: &LimiterState, d: Direction) -> usize {
    let data = &st.dirs[d as usize];
    if data.unused_capacity != 0 {
        data.unsaturated
    } else {
        0
    }
}

fn unsaturated_child(child: &Child, d: Direction) -> usize {
    match child {
        Child::Limiter(l) => gated_unsaturated(&l.state.lock().unwrap(), d),
        Child::Bucket(b) => {
            if b.state.lock().unwrap().dirs[d as usize].unsaturated {
                1
            } else {
                0
            }
        }
    }
}

fn add_tokens_child(child: &Child, burst: Rate, d: Direction, tokens: Rate, limit: Rate) -> Rate {
    match child {
        Child::Limiter(l) => add_tokens_limiter(l, burst, d, tokens, limit),
        Child::Bucket(b) => add_tokens_bucket(b, burst, d, tokens, limit),
    }
}

fn distribute_overflow_child(child: &Child, burst: Rate, d: Direction, tokens: Rate) -> Rate {
    match child {
        Child::Limiter(l) => distribute_overflow_limiter(l, burst, d, tokens),
        Child::Bucket(b) => distribute_overflow_bucket(b, d, tokens),
    }
}

fn pay_debt(st: &mut LimiterState, d: Direction) {
    let weight = if st.weight == 0 { 1 } else { st.weight } as Rate;
    let data = &mut st.dirs[d as usize];
    if data.merged_tokens != UNLIMITED {
        let debt_reduction = data.merged_tokens.min(data.debt / weight);
        data.merged_tokens -= debt_reduction;
        data.debt -= debt_reduction * weight;
    } else {
        data.debt = 0;
    }
}

/// Adds this tick's tokens to the subtree. `tokens` and `limit` are
/// normalized to a weight-one child; the return value is the subtree's
/// overflow, the tokens that could not be stored.
fn add_tokens_limiter(
    node: &Arc<LimiterShared>,
    burst: Rate,
    d: Direction,
    tokens: Rate,
    limit: Rate,
) -> Rate {
    let mut st = node.state.lock().unwrap();
    let di = d as usize;
    st.scratch.clear();
    st.dirs[di].overflow = 0;

    if st.weight == 0 {
        st.dirs[di].merged_tokens = st.dirs[di].limit.min(tokens);
        pay_debt(&mut st, d);
        return if tokens == UNLIMITED { 0 } else { tokens };
    }
    let weight = st.weight as Rate;

    let mut merged_limit = limit;
    if st.dirs[di].limit != UNLIMITED {
        let my_limit = (st.dirs[di].carry + st.dirs[di].limit) / weight;
        st.dirs[di].carry = (st.dirs[di].carry + st.dirs[di].limit) % weight;
        if my_limit < merged_limit {
            merged_limit = my_limit;
        }
        // Keep the rounding losses for later ticks.
        st.dirs[di].carry += (merged_limit % FREQUENCY) * weight;
    }

    st.dirs[di].unused_capacity = 0;
    st.dirs[di].merged_tokens = if merged_limit != UNLIMITED {
        merged_limit / FREQUENCY
    } else {
        UNLIMITED
    };
    if tokens < st.dirs[di].merged_tokens {
        st.dirs[di].merged_tokens = tokens;
    }

    pay_debt(&mut st, d);

    if st.dirs[di].limit == UNLIMITED {
        st.dirs[di].unused_capacity = UNLIMITED;
    } else {
        let spent = st.dirs[di]
            .merged_tokens
            .saturating_mul(weight)
            .saturating_mul(FREQUENCY);
        if spent < st.dirs[di].limit {
            st.dirs[di].unused_capacity = (st.dirs[di].limit - spent) / FREQUENCY;
        } else {
            st.dirs[di].unused_capacity = 0;
        }
    }

    let merged_tokens = st.dirs[di].merged_tokens;
    let children = st.children.clone();
    for (i, child) in children.iter().enumerate() {
        let overflow = add_tokens_child(child, burst, d, merged_tokens, merged_limit);
        if overflow != 0 {
            st.dirs[di].overflow += overflow;
        }
        if unsaturated_child(child, d) != 0 {
            st.scratch.push(i);
        } else {
            st.dirs[di].overflow += distribute_overflow_child(child, burst, d, 0);
        }
    }

    if st.dirs[di].overflow >= st.dirs[di].unused_capacity {
        st.dirs[di].unused_capacity = 0;
    } else if st.dirs[di].unused_capacity != UNLIMITED {
        st.dirs[di].unused_capacity -= st.dirs[di].overflow;
    }

    if tokens == UNLIMITED {
        0
    } else {
        (tokens - merged_tokens) * weight
    }
}

/// Distributes overflow tokens among the subtree's unsaturated children,
/// iterating until the overflow is exhausted or nobody can take more.
/// Returns the leftover normalized to the caller's accounting.
fn distribute_overflow_limiter(
    node: &Arc<LimiterShared>,
    burst: Rate,
    d: Direction,
    overflow: Rate,
) -> Rate {
    let mut st = node.state.lock().unwrap();
    let di = d as usize;

    let usable_external = if st.dirs[di].unused_capacity == UNLIMITED {
        overflow
    } else {
        overflow.min(st.dirs[di].unused_capacity)
    };
    let overflow_sum = st.dirs[di].overflow + usable_external;
    let mut remaining = overflow_sum;

    loop {
        let scratch = st.scratch.clone();
        let mut unsaturated = 0;
        for idx in &scratch {
            unsaturated += unsaturated_child(&st.children[*idx], d);
        }
        st.dirs[di].unsaturated = unsaturated;

        let extra_tokens = if unsaturated != 0 {
            remaining / unsaturated as Rate
        } else {
            0
        };
        if unsaturated != 0 {
            remaining %= unsaturated as Rate;
        }

        let mut i = 0;
        while i < st.scratch.len() {
            let child = st.children[st.scratch[i]].clone();
            let sub_overflow = distribute_overflow_child(&child, burst, d, extra_tokens);
            if sub_overflow != 0 || unsaturated_child(&child, d) == 0 {
                remaining += sub_overflow;
                let last = st.scratch.len() - 1;
                st.scratch[i] = st.scratch[last];
                st.scratch.pop();
            } else {
                i += 1;
            }
        }

        if extra_tokens == 0 {
            let scratch = st.scratch.clone();
            let mut unsaturated = 0;
            for idx in &scratch {
                unsaturated += unsaturated_child(&st.children[*idx], d);
            }
            st.dirs[di].unsaturated = unsaturated;
            break;
        }
    }

    if usable_external > remaining {
        // Exhausted the internal overflow.
        if st.dirs[di].unused_capacity != UNLIMITED {
            st.dirs[di].unused_capacity -= usable_external - remaining;
        }
        st.dirs[di].overflow = 0;
        remaining + overflow - usable_external
    } else {
        // Internal overflow not exhausted.
        st.dirs[di].overflow = remaining - usable_external;
        overflow
    }
}

fn collect_wakeups_limiter(node: &Arc<LimiterShared>, wakeups: &mut Wakeups) {
    let children = node.state.lock().unwrap().children.clone();
    for child in children {
        match child {
            Child::Limiter(l) => collect_wakeups_limiter(&l, wakeups),
            Child::Bucket(b) => collect_wakeups_bucket(&b, wakeups),
        }
    }
}

fn gather_unspent_child(child: &Child) -> [Rate; 2] {
    match child {
        Child::Limiter(l) => gather_unspent_limiter(&mut l.state.lock().unwrap()),
        Child::Bucket(b) => gather_unspent_bucket(&mut b.state.lock().unwrap()),
    }
}

fn gather_unspent_limiter(st: &mut LimiterState) -> [Rate; 2] {
    let mut ret = [0, 0];
    let children = st.children.clone();
    for child in &children {
        let unspent = gather_unspent_child(child);
        ret[0] += unspent[0];
        ret[1] += unspent[1];
    }
    for (i, item) in ret.iter_mut().enumerate() {
        let debt_reduction = (*item).min(st.dirs[i].debt);
        *item -= debt_reduction;
        st.dirs[i].debt -= debt_reduction;
    }
    ret
}

fn gather_unspent_bucket(st: &mut BucketState) -> [Rate; 2] {
    let mut ret = [0, 0];
    for (i, item) in ret.iter_mut().enumerate() {
        if st.dirs[i].available != UNLIMITED {
            *item = st.dirs[i].available;
            st.dirs[i].available = 0;
        }
    }
    ret
}

// ---------------------------------------------------------------------------
// Removal
//
// Removal locks the node first and then try-locks the parent. If the parent
// is contended (e.g. by a tick traversal holding it while waiting for this
// node), the node's lock is released and the thread yields before retrying.

fn fix_sibling_idx(children: &[Child], idx: usize) {
    match &children[idx] {
        Child::Limiter(l) => l.state.lock().unwrap().idx = idx,
        Child::Bucket(b) => b.state.lock().unwrap().idx = idx,
    }
}

fn remove_limiter_from_parent(node: &Arc<LimiterShared>) {
    loop {
        let mut st = node.state.lock().unwrap();
        let (parent, idx) = match (&st.parent, st.idx) {
            (Some(_), idx) if idx != usize::MAX => (st.parent.take().unwrap(), idx),
            _ => {
                st.parent = None;
                st.idx = usize::MAX;
                return;
            }
        };

        match &parent {
            Parent::Manager(weak) => {
                let mgr = match weak.upgrade() {
                    Some(mgr) => mgr,
                    None => {
                        st.idx = usize::MAX;
                        return;
                    }
                };
                if let Ok(mut limiters) = mgr.limiters.try_lock() {
                    if idx < limiters.len() {
                        limiters.swap_remove(idx);
                        if idx < limiters.len() {
                            limiters[idx].state.lock().unwrap().idx = idx;
                        }
                    }
                    st.idx = usize::MAX;
                    return;
                };
            }
            Parent::Limiter(weak) => {
                let parent_node = match weak.upgrade() {
                    Some(parent_node) => parent_node,
                    None => {
                        st.idx = usize::MAX;
                        return;
                    }
                };
                if let Ok(mut pst) = parent_node.state.try_lock() {
                    if idx < pst.children.len() {
                        pst.children.swap_remove(idx);
                        if idx < pst.children.len() {
                            fix_sibling_idx(&pst.children, idx);
                        }
                    }
                    let unspent = gather_unspent_limiter(&mut st);
                    for (i, unspent) in unspent.iter().enumerate() {
                        pst.dirs[i].debt -= pst.dirs[i].debt.min(*unspent);
                    }
                    st.idx = usize::MAX;
                    return;
                };
            }
        }

        // Contended; back off and retry.
        st.parent = Some(parent);
        drop(st);
        std::thread::yield_now();
    }
}

fn remove_bucket_from_parent(node: &Arc<BucketShared>) {
    loop {
        let mut st = node.state.lock().unwrap();
        let (parent, idx) = match (&st.parent, st.idx) {
            (Some(_), idx) if idx != usize::MAX => (st.parent.take().unwrap(), idx),
            _ => {
                st.parent = None;
                st.idx = usize::MAX;
                st.dirs = [BucketDir::default(); 2];
                return;
            }
        };

        if let Parent::Limiter(weak) = &parent {
            let parent_node = match weak.upgrade() {
                Some(parent_node) => parent_node,
                None => {
                    st.idx = usize::MAX;
                    st.dirs = [BucketDir::default(); 2];
                    return;
                }
            };
            if let Ok(mut pst) = parent_node.state.try_lock() {
                if idx < pst.children.len() {
                    pst.children.swap_remove(idx);
                    if idx < pst.children.len() {
                        fix_sibling_idx(&pst.children, idx);
                    }
                }
                // Unspent tokens of the removed bucket repay the parent's
                // debt.
                let unspent = gather_unspent_bucket(&mut st);
                for (i, unspent) in unspent.iter().enumerate() {
                    pst.dirs[i].debt -= pst.dirs[i].debt.min(*unspent);
                }
                st.idx = usize::MAX;
                st.dirs = [BucketDir::default(); 2];
                return;
            };
        } else {
            // Buckets are never attached to the manager directly.
            st.idx = usize::MAX;
            st.dirs = [BucketDir::default(); 2];
            return;
        }

        st.parent = Some(parent);
        drop(st);
        std::thread::yield_now();
    }
}

// ---------------------------------------------------------------------------
// Bucket

/// A rate-limited token bucket, leaf of the limiter tree.
///
/// Dropping the bucket detaches it from its limiter; unspent tokens flow
/// back into the parent's debt accounting.
pub struct Bucket {
    shared: Arc<BucketShared>,
}

impl Default for Bucket {
    fn default() -> Bucket {
        Bucket::new()
    }
}

impl Bucket {
    /// Creates a detached bucket.
    pub fn new() -> Bucket {
        Bucket {
            shared: Arc::new(BucketShared {
                state: Mutex::new(BucketState {
                    parent: None,
                    idx: usize::MAX,
                    mgr: None,
                    dirs: [BucketDir::default(); 2],
                }),
                observer: Mutex::new(None),
            }),
        }
    }

    /// Installs the observer signalled by [`BucketObserver::wakeup`] when
    /// tokens become available after the bucket ran empty.
    pub fn set_observer(&self, observer: Weak<dyn BucketObserver>) {
        *self.shared.observer.lock().unwrap() = Some(observer);
    }

    /// Returns the available octets.
    ///
    /// If this returns 0, the bucket records the caller as waiting; wait
    /// for the observer's wakeup before consuming again.
    pub fn available(&self, direction: Direction) -> Rate {
        let mut st = self.shared.state.lock().unwrap();
        let mgr = st.mgr.clone();
        let data = &mut st.dirs[direction as usize];
        if data.available == 0 {
            data.waiting = true;
            drop(st);
            record_activity_weak(&mgr);
            return 0;
        }
        data.available
    }

    /// Consumes octets. Only call with an amount no larger than the
    /// available octets, and not at all while an unlimited amount is
    /// available.
    pub fn consume(&self, direction: Direction, amount: Rate) {
        if amount == 0 {
            return;
        }
        let mut st = self.shared.state.lock().unwrap();
        let mgr = st.mgr.clone();
        let data = &mut st.dirs[direction as usize];
        if data.available != UNLIMITED {
            data.available = data.available.saturating_sub(amount);
            drop(st);
            record_activity_weak(&mgr);
        }
    }

    /// Whether a consumer is recorded as waiting for tokens.
    pub fn is_waiting(&self, direction: Direction) -> bool {
        self.shared.state.lock().unwrap().dirs[direction as usize].waiting
    }

    /// Detaches the bucket from its limiter.
    pub fn remove(&self) {
        remove_bucket_from_parent(&self.shared);
    }
}

impl Drop for Bucket {
    fn drop(&mut self) {
        self.remove();
    }
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.shared.state.lock().unwrap();
        f.debug_struct("Bucket")
            .field("available_in", &st.dirs[0].available)
            .field("available_out", &st.dirs[1].available)
            .finish()
    }
}

fn update_stats_bucket(node: &Arc<BucketShared>, active: &mut bool) -> [usize; 2] {
    let mut st = node.state.lock().unwrap();
    let mut unsaturated = [0, 0];
    for d in DIRECTIONS {
        let data = &mut st.dirs[d as usize];
        if data.bucket_size == UNLIMITED {
            data.overflow_multiplier = 1;
        } else if data.available > data.bucket_size / 2 && data.overflow_multiplier > 1 {
            data.overflow_multiplier /= 2;
        } else {
            data.unsaturated = data.waiting;
            if data.waiting {
                *active = true;
            }
        }
        unsaturated[d as usize] = data.unsaturated as usize;
    }
    unsaturated
}

fn add_tokens_bucket(
    node: &Arc<BucketShared>,
    burst: Rate,
    d: Direction,
    tokens: Rate,
    limit: Rate,
) -> Rate {
    let mut st = node.state.lock().unwrap();
    let data = &mut st.dirs[d as usize];

    if limit == UNLIMITED {
        data.bucket_size = UNLIMITED;
        data.available = UNLIMITED;
        return 0;
    }

    data.bucket_size = limit
        .saturating_mul(data.overflow_multiplier)
        .saturating_mul(burst);
    if data.available == UNLIMITED {
        data.available = tokens;
        0
    } else if data.bucket_size < data.available {
        data.available = data.bucket_size;
        tokens
    } else {
        let mut capacity = data.bucket_size - data.available;
        if capacity < tokens && data.unsaturated {
            data.unsaturated = false;
            if data.overflow_multiplier < MAX_OVERFLOW_MULTIPLIER {
                // Double the bucket to absorb bursty consumers.
                capacity += data.bucket_size;
                data.bucket_size *= 2;
                data.overflow_multiplier *= 2;
            }
        }
        let added = tokens.min(capacity);
        data.available += added;
        tokens - added
    }
}

fn distribute_overflow_bucket(node: &Arc<BucketShared>, d: Direction, tokens: Rate) -> Rate {
    let mut st = node.state.lock().unwrap();
    let data = &mut st.dirs[d as usize];

    if data.available == UNLIMITED {
        return 0;
    }

    let mut capacity = data.bucket_size - data.available;
    if capacity < tokens && data.unsaturated {
        data.unsaturated = false;
        if data.overflow_multiplier < MAX_OVERFLOW_MULTIPLIER {
            capacity += data.bucket_size;
            data.bucket_size *= 2;
            data.overflow_multiplier *= 2;
        }
    }
    let added = tokens.min(capacity);
    data.available += added;
    tokens - added
}

fn collect_wakeups_bucket(node: &Arc<BucketShared>, wakeups: &mut Wakeups) {
    let mut woken = [false, false];
    {
        let mut st = node.state.lock().unwrap();
        for d in DIRECTIONS {
            let data = &mut st.dirs[d as usize];
            if data.waiting && data.available != 0 {
                data.waiting = false;
                woken[d as usize] = true;
            }
        }
    }
    if woken[0] || woken[1] {
        let observer = node
            .observer
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade);
        if let Some(observer) = observer {
            for d in DIRECTIONS {
                if woken[d as usize] {
                    wakeups.push((Arc::clone(&observer), d));
                }
            }
        }
    }
}
