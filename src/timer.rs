//! Hierarchical timer wheel.
//!
//! Three cascading levels of 512 buckets; a level-0 bucket spans 128 ms and
//! each upper level's bucket spans 512 times its lower level, so arming and
//! stopping are O(1) and a full sweep covers deadlines up to
//! [`MAX_RELTIME`] milliseconds out.
//!
//! Timers are grouped into classes which carry the callback, the periodic
//! flag and usage statistics; entries carry the deadline, period, jitter and
//! an opaque context value handed back to the callback. Entries live in a
//! generation-tagged arena and the bucket lists are threaded through arena
//! indices, so a stale [`Timer`] handle can never reach a recycled slot.

use std::cell::RefCell;
use std::rc::Rc;

use log::{trace, warn};

use crate::clock::{Clock, NEVER};

const DEPTH: usize = 3;
const SLOT_BITS: u32 = 9;
const SLOTS: usize = 1 << SLOT_BITS;
const SLICE_BITS: u32 = 7;
const SLICE: u64 = 1 << SLICE_BITS;

/// Maximum relative deadline a timer can be armed with, exclusive.
pub const MAX_RELTIME: u64 = SLICE << (SLOT_BITS * DEPTH as u32);

const NIL: u32 = u32::MAX;

/// Opaque context value handed to the class callback when an entry fires.
pub type TimerCtx = usize;

/// Callback bound to a timer class. It receives the wheel itself, so it may
/// arm, stop or drop timers, including the one that is firing.
pub type TimerCallback = Rc<dyn Fn(&TimerWheel, TimerCtx)>;

/// Handle to a timer class.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimerClass {
    idx: usize,
}

impl TimerClass {
    /// Sentinel for two-phase construction; never registered in the wheel.
    pub(crate) const PLACEHOLDER: TimerClass = TimerClass { idx: usize::MAX };
}

/// Handle to a timer entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Timer {
    idx: u32,
    gen: u32,
}

impl Timer {
    /// Sentinel for two-phase construction; never resolves to an entry.
    pub(crate) const PLACEHOLDER: Timer = Timer {
        idx: u32::MAX,
        gen: u32::MAX,
    };
}

struct Class {
    name: &'static str,
    periodic: bool,
    callback: Option<TimerCallback>,
    usage: u32,
    changes: u32,
}

struct Entry {
    class: usize,
    ctx: TimerCtx,
    /// Absolute deadline; 0 while not armed.
    deadline: u64,
    /// Arming interval for periodic classes, 0 for one-shots.
    period: u64,
    jitter_pct: u8,
    /// Cached random draw; refreshed on every periodic fire, cleared on stop.
    random: u32,
    prev: u32,
    next: u32,
    level: u8,
    slot: u16,
    linked: bool,
}

struct EntrySlot {
    gen: u32,
    data: Option<Entry>,
}

#[derive(Clone, Copy)]
struct ListHead {
    head: u32,
    tail: u32,
}

const EMPTY_LIST: ListHead = ListHead {
    head: NIL,
    tail: NIL,
};

struct Wheel {
    clock: Clock,
    entries: Vec<EntrySlot>,
    entry_free: Vec<u32>,
    classes: Vec<Option<Class>>,
    class_free: Vec<usize>,
    buckets: [[ListHead; SLOTS]; DEPTH],
    bucket_ptr: [usize; DEPTH],
    next_fire: u64,
    total: u32,
}

/// Shared handle to the timer wheel.
#[derive(Clone)]
pub struct TimerWheel {
    inner: Rc<RefCell<Wheel>>,
    clock: Clock,
}

impl TimerWheel {
    pub fn new(clock: Clock) -> TimerWheel {
        let mut bucket_ptr = [0usize; DEPTH];
        let mut now = clock.now() >> SLICE_BITS;
        for ptr in bucket_ptr.iter_mut() {
            *ptr = (now & (SLOTS as u64 - 1)) as usize;
            now >>= SLOT_BITS;
        }

        TimerWheel {
            inner: Rc::new(RefCell::new(Wheel {
                clock: clock.clone(),
                entries: Vec::new(),
                entry_free: Vec::new(),
                classes: Vec::new(),
                class_free: Vec::new(),
                buckets: [[EMPTY_LIST; SLOTS]; DEPTH],
                bucket_ptr,
                next_fire: NEVER,
                total: 0,
            })),
            clock,
        }
    }

    /// Register a new class of timers.
    pub fn add_class(
        &self,
        name: &'static str,
        periodic: bool,
        callback: TimerCallback,
    ) -> TimerClass {
        let mut w = self.inner.borrow_mut();
        let class = Class {
            name,
            periodic,
            callback: Some(callback),
            usage: 0,
            changes: 0,
        };
        let idx = match w.class_free.pop() {
            Some(idx) => {
                w.classes[idx] = Some(class);
                idx
            }
            None => {
                w.classes.push(Some(class));
                w.classes.len() - 1
            }
        };
        TimerClass { idx }
    }

    /// Remove a class. All entries of the class are stopped and dropped;
    /// their handles become stale.
    pub fn remove_class(&self, class: TimerClass) {
        let mut w = self.inner.borrow_mut();
        for idx in 0..w.entries.len() as u32 {
            let matches = w.entries[idx as usize]
                .data
                .as_ref()
                .map_or(false, |e| e.class == class.idx);
            if matches {
                w.stop_entry(idx);
                w.free_entry(idx);
            }
        }
        if let Some(slot) = w.classes.get_mut(class.idx) {
            if slot.take().is_some() {
                w.class_free.push(class.idx);
            }
        }
    }

    /// Allocate an unarmed timer entry.
    pub fn create(&self, class: TimerClass, jitter_pct: u8, ctx: TimerCtx) -> Timer {
        let mut w = self.inner.borrow_mut();
        debug_assert!(jitter_pct <= 100);
        let entry = Entry {
            class: class.idx,
            ctx,
            deadline: 0,
            period: 0,
            jitter_pct,
            random: 0,
            prev: NIL,
            next: NIL,
            level: 0,
            slot: 0,
            linked: false,
        };
        let idx = match w.entry_free.pop() {
            Some(idx) => {
                w.entries[idx as usize].data = Some(entry);
                idx
            }
            None => {
                w.entries.push(EntrySlot { gen: 0, data: Some(entry) });
                w.entries.len() as u32 - 1
            }
        };
        Timer {
            idx,
            gen: w.entries[idx as usize].gen,
        }
    }

    /// Stop and drop a timer entry. A stale handle is a no-op.
    pub fn destroy(&self, timer: Timer) {
        let mut w = self.inner.borrow_mut();
        if !w.is_live(timer) {
            return;
        }
        w.stop_entry(timer.idx);
        w.free_entry(timer.idx);
    }

    /// Start a timer if `rel_time` is nonzero, stop it otherwise.
    pub fn set(&self, timer: Timer, rel_time: u64) {
        if rel_time == 0 {
            self.stop(timer);
        } else {
            self.start(timer, rel_time);
        }
    }

    /// Start or restart a timer `rel_time` milliseconds from now.
    pub fn start(&self, timer: Timer, rel_time: u64) {
        let mut w = self.inner.borrow_mut();
        if !w.is_live(timer) {
            warn!("start on stale timer handle {:?}", timer);
            return;
        }
        w.start(timer.idx, rel_time);
    }

    /// Stop a timer. Stopping an unarmed or stale timer is a no-op; stopping
    /// a periodic timer from inside its own callback suppresses the re-arm.
    pub fn stop(&self, timer: Timer) {
        let mut w = self.inner.borrow_mut();
        if !w.is_live(timer) {
            return;
        }
        w.stop_entry(timer.idx);
    }

    pub fn is_armed(&self, timer: Timer) -> bool {
        let w = self.inner.borrow();
        w.is_live(timer) && w.entry(timer.idx).deadline != 0
    }

    /// Absolute deadline of an armed timer.
    pub fn deadline(&self, timer: Timer) -> Option<u64> {
        let w = self.inner.borrow();
        if !w.is_live(timer) {
            return None;
        }
        match w.entry(timer.idx).deadline {
            0 => None,
            d => Some(d),
        }
    }

    /// Number of armed entries of a class.
    pub fn class_usage(&self, class: TimerClass) -> u32 {
        let w = self.inner.borrow();
        w.classes[class.idx].as_ref().map_or(0, |c| c.usage)
    }

    /// Lifetime mutation count of a class.
    pub fn class_changes(&self, class: TimerClass) -> u32 {
        let w = self.inner.borrow();
        w.classes[class.idx].as_ref().map_or(0, |c| c.changes)
    }

    /// Timestamp when the next timer will fire, [`NEVER`] with an empty
    /// queue.
    pub fn next_event(&self) -> u64 {
        self.inner.borrow().next_fire
    }

    /// Fire every timer whose deadline has been reached. Invoked by the
    /// socket scheduler at each wakeup.
    pub fn walk(&self) {
        loop {
            {
                let w = self.inner.borrow();
                if w.next_fire > self.clock.now() {
                    return;
                }
            }

            // Drain the active level-0 bucket. The borrow is released around
            // each callback so it may re-enter the wheel.
            loop {
                let fired = {
                    let mut w = self.inner.borrow_mut();
                    let slot = w.bucket_ptr[0];
                    match w.pop_front(0, slot) {
                        None => None,
                        Some(idx) => {
                            let gen = w.entries[idx as usize].gen;
                            let (class, ctx) = {
                                let e = w.entry(idx);
                                (e.class, e.ctx)
                            };
                            let (periodic, callback) = {
                                let c = w.classes[class].as_ref().expect("class of armed timer");
                                (c.periodic, c.callback.clone())
                            };
                            if !periodic {
                                // Fully disarmed before the callback runs, so
                                // the callback may destroy the entry.
                                w.disarm(idx);
                            }
                            Some((idx, gen, class, ctx, periodic, callback))
                        }
                    }
                };

                let Some((idx, gen, class, ctx, periodic, callback)) = fired else {
                    break;
                };

                if let Some(callback) = callback {
                    trace!("fire timer {} ctx {:#x}", idx, ctx);
                    callback(self, ctx);
                }

                let mut w = self.inner.borrow_mut();
                if let Some(c) = w.classes.get_mut(class).and_then(Option::as_mut) {
                    c.changes += 1;
                }
                if periodic {
                    // Re-arm unless the callback stopped or restarted it.
                    let rearm = w.entries.get(idx as usize).map_or(false, |slot| {
                        slot.gen == gen
                            && slot
                                .data
                                .as_ref()
                                .map_or(false, |e| e.deadline != 0 && !e.linked)
                    });
                    if rearm {
                        let period = {
                            let e = w.entry_mut(idx);
                            e.random = rand::random();
                            e.period
                        };
                        w.start(idx, period);
                    }
                }
            }

            self.inner.borrow_mut().calculate_next_event();
        }
    }

    #[cfg(test)]
    fn bucket_of(&self, timer: Timer) -> Option<(usize, usize)> {
        let w = self.inner.borrow();
        if !w.is_live(timer) {
            return None;
        }
        let e = w.entry(timer.idx);
        e.linked.then_some((e.level as usize, e.slot as usize))
    }
}

impl std::fmt::Debug for TimerWheel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let w = self.inner.borrow();
        f.debug_struct("TimerWheel")
            .field("armed", &w.total)
            .field("next_fire", &w.next_fire)
            .finish()
    }
}

impl Wheel {
    fn is_live(&self, timer: Timer) -> bool {
        self.entries
            .get(timer.idx as usize)
            .map_or(false, |slot| slot.gen == timer.gen && slot.data.is_some())
    }

    fn entry(&self, idx: u32) -> &Entry {
        self.entries[idx as usize].data.as_ref().expect("live timer entry")
    }

    fn entry_mut(&mut self, idx: u32) -> &mut Entry {
        self.entries[idx as usize].data.as_mut().expect("live timer entry")
    }

    fn free_entry(&mut self, idx: u32) {
        let slot = &mut self.entries[idx as usize];
        slot.data = None;
        slot.gen = slot.gen.wrapping_add(1);
        self.entry_free.push(idx);
    }

    fn start(&mut self, idx: u32, rel_time: u64) {
        assert!(rel_time > 0, "timer started without interval");
        let rel_time = if rel_time >= MAX_RELTIME {
            warn!("timer interval {} ms is beyond the wheel, clamped", rel_time);
            MAX_RELTIME - 1
        } else {
            rel_time
        };
        let now = self.clock.now();

        let (stored, was_linked, class, jitter_pct, mut random) = {
            let e = self.entry(idx);
            (e.deadline, e.linked, e.class, e.jitter_pct, e.random)
        };

        if stored != 0 {
            if was_linked {
                self.unlink(idx);
            }
        } else if let Some(c) = self.classes[class].as_mut() {
            c.usage += 1;
        }
        let (periodic, name) = {
            let c = self.classes[class].as_mut().expect("class of started timer");
            c.changes += 1;
            (c.periodic, c.name)
        };

        // Compute the random value only once per armed lifetime.
        if random == 0 {
            random = rand::random();
        }

        let mut deadline = now + jittered(rel_time, jitter_pct, random);

        // Never arm into the timeslice currently being dispatched; a
        // fast periodic would otherwise refire inside a single walk.
        let current_slice = now >> SLICE_BITS;
        if (deadline >> SLICE_BITS) <= current_slice {
            deadline = (current_slice + 1) << SLICE_BITS;
        }

        {
            let e = self.entry_mut(idx);
            e.random = random;
            e.deadline = deadline;
            e.period = if periodic { rel_time } else { 0 };
        }

        let (level, slot) = self.insert_into_bucket(idx, deadline, now);

        if stored == 0 {
            self.total += 1;
        }
        if deadline < self.next_fire {
            self.next_fire = deadline;
            // An insertion behind the active scan pointer invalidates the
            // cached position.
            if level == 0 && slot < self.bucket_ptr[0] {
                self.calculate_next_event();
            }
        } else if stored != 0 && stored == self.next_fire {
            self.calculate_next_event();
        }

        trace!(
            "start {} timer {} firing at {}",
            name,
            idx,
            crate::clock::to_clock_string(deadline)
        );
    }

    fn stop_entry(&mut self, idx: u32) {
        let (deadline, linked, class) = {
            let e = self.entry(idx);
            (e.deadline, e.linked, e.class)
        };
        if deadline == 0 {
            return;
        }

        if linked {
            self.unlink(idx);
        }
        {
            let e = self.entry_mut(idx);
            e.deadline = 0;
            e.period = 0;
            e.random = 0;
        }
        if let Some(c) = self.classes[class].as_mut() {
            trace!("stop {} timer {}", c.name, idx);
            c.usage -= 1;
            c.changes += 1;
        }
        self.total -= 1;

        if self.next_fire == deadline {
            self.calculate_next_event();
        }
    }

    /// Disarm a popped one-shot during a walk; the next-event cache is
    /// recomputed once the bucket is drained.
    fn disarm(&mut self, idx: u32) {
        let class = {
            let e = self.entry_mut(idx);
            e.deadline = 0;
            e.period = 0;
            e.random = 0;
            e.class
        };
        if let Some(c) = self.classes[class].as_mut() {
            c.usage -= 1;
            c.changes += 1;
        }
        self.total -= 1;
    }

    fn insert_into_bucket(&mut self, idx: u32, deadline: u64, now: u64) -> (usize, usize) {
        let mut slot = deadline >> SLICE_BITS;
        let mut relative = (deadline >> SLICE_BITS) - (now >> SLICE_BITS);

        for level in 0..DEPTH {
            if relative < SLOTS as u64 {
                let slot = (slot & (SLOTS as u64 - 1)) as usize;
                self.push_tail(level, slot, idx);
                return (level, slot);
            }
            slot >>= SLOT_BITS;
            relative >>= SLOT_BITS;
        }

        // rel_time < MAX_RELTIME keeps every deadline inside the deepest
        // level.
        unreachable!("timer deadline beyond the wheel");
    }

    fn push_tail(&mut self, level: usize, slot: usize, idx: u32) {
        let tail = self.buckets[level][slot].tail;
        {
            let e = self.entry_mut(idx);
            e.level = level as u8;
            e.slot = slot as u16;
            e.prev = tail;
            e.next = NIL;
            e.linked = true;
        }
        if tail == NIL {
            self.buckets[level][slot].head = idx;
        } else {
            self.entry_mut(tail).next = idx;
        }
        self.buckets[level][slot].tail = idx;
    }

    fn unlink(&mut self, idx: u32) {
        let (prev, next, level, slot) = {
            let e = self.entry(idx);
            (e.prev, e.next, e.level as usize, e.slot as usize)
        };
        if prev == NIL {
            self.buckets[level][slot].head = next;
        } else {
            self.entry_mut(prev).next = next;
        }
        if next == NIL {
            self.buckets[level][slot].tail = prev;
        } else {
            self.entry_mut(next).prev = prev;
        }
        let e = self.entry_mut(idx);
        e.prev = NIL;
        e.next = NIL;
        e.linked = false;
    }

    fn pop_front(&mut self, level: usize, slot: usize) -> Option<u32> {
        let head = self.buckets[level][slot].head;
        if head == NIL {
            return None;
        }
        self.unlink(head);
        Some(head)
    }

    fn calculate_next_event(&mut self) {
        if self.total == 0 {
            self.next_fire = NEVER;
            return;
        }

        let slot = self
            .look_for_event(0)
            .expect("armed timers but empty wheel");
        self.bucket_ptr[0] = slot;

        let head = self.buckets[0][slot].head;
        let deadline = self.entry(head).deadline;
        self.next_fire = deadline & !(SLICE - 1);
    }

    fn look_for_event(&mut self, depth: usize) -> Option<usize> {
        // Look in existing data before loading another layer.
        for i in self.bucket_ptr[depth]..SLOTS {
            if self.buckets[depth][i].head != NIL {
                return Some(i);
            }
        }

        // Cascade one bucket down from the level above if possible.
        if depth + 1 < DEPTH {
            if let Some(idx) = self.look_for_event(depth + 1) {
                self.copy_bucket(depth + 1, idx);
            }
        }

        (0..SLOTS).find(|&i| self.buckets[depth][i].head != NIL)
    }

    fn copy_bucket(&mut self, depth: usize, idx: usize) {
        debug_assert!(depth > 0 && depth < DEPTH && idx < SLOTS);

        let shift = SLICE_BITS + SLOT_BITS * (depth as u32 - 1);
        self.bucket_ptr[depth] = idx + 1;

        while let Some(entry) = self.pop_front(depth, idx) {
            let deadline = self.entry(entry).deadline;
            let slot = ((deadline >> shift) & (SLOTS as u64 - 1)) as usize;
            self.push_tail(depth - 1, slot, entry);
        }
    }
}

/// Jitter shortens the interval, never lengthens it; the raw deadline is an
/// upper bound.
fn jittered(rel_time: u64, jitter_pct: u8, random: u32) -> u64 {
    if jitter_pct == 0 || jitter_pct > 99 {
        return rel_time;
    }
    let span = jitter_pct as u64 * rel_time / 100;
    rel_time - (random as u64 % (span + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn fixed_clock(now: u64) -> Clock {
        let clock = Clock::new().unwrap();
        clock.set_now(now);
        clock
    }

    fn recorder() -> (Rc<RefCell<Vec<char>>>, impl Fn(char) -> TimerCallback) {
        let fired: Rc<RefCell<Vec<char>>> = Rc::new(RefCell::new(Vec::new()));
        let make = {
            let fired = fired.clone();
            move |tag: char| -> TimerCallback {
                let fired = fired.clone();
                Rc::new(move |_, _| fired.borrow_mut().push(tag))
            }
        };
        (fired, make)
    }

    #[test]
    fn fire_order() {
        let clock = fixed_clock(1000);
        let wheel = TimerWheel::new(clock.clone());
        let (fired, make) = recorder();

        let ca = wheel.add_class("a", false, make('a'));
        let cb = wheel.add_class("b", false, make('b'));
        let cc = wheel.add_class("c", false, make('c'));

        let a = wheel.create(ca, 0, 0);
        let b = wheel.create(cb, 0, 0);
        let c = wheel.create(cc, 0, 0);

        wheel.start(a, 200);
        wheel.start(b, 100);
        wheel.start(c, 300);

        clock.set_now(1350);
        wheel.walk();

        assert_eq!(*fired.borrow(), vec!['b', 'a', 'c']);
        assert_eq!(wheel.next_event(), NEVER);
        assert!(!wheel.is_armed(a));
        assert_eq!(wheel.class_usage(ca), 0);
        assert_eq!(wheel.class_usage(cb), 0);
        assert_eq!(wheel.class_usage(cc), 0);
    }

    #[test]
    fn periodic_rearm_and_stop_in_callback() {
        let clock = fixed_clock(1000);
        let wheel = TimerWheel::new(clock.clone());

        let fires = Rc::new(RefCell::new(0u32));
        let timer_cell: Rc<RefCell<Option<Timer>>> = Rc::new(RefCell::new(None));

        let class = {
            let fires = fires.clone();
            let timer_cell = timer_cell.clone();
            wheel.add_class(
                "periodic",
                true,
                Rc::new(move |wheel, _| {
                    *fires.borrow_mut() += 1;
                    if *fires.borrow() == 2 {
                        wheel.stop(timer_cell.borrow().unwrap());
                    }
                }),
            )
        };

        let d = wheel.create(class, 0, 0);
        *timer_cell.borrow_mut() = Some(d);
        wheel.start(d, 100);

        clock.set_now(1100);
        wheel.walk();
        assert_eq!(*fires.borrow(), 1);
        assert!(wheel.is_armed(d));
        assert_eq!(wheel.deadline(d), Some(1200));
        assert_eq!(wheel.class_usage(class), 1);

        clock.set_now(1200);
        wheel.walk();
        assert_eq!(*fires.borrow(), 2);
        assert!(!wheel.is_armed(d));
        assert_eq!(wheel.class_usage(class), 0);
    }

    #[test]
    fn level0_bucket_matches_deadline_bits() {
        let clock = fixed_clock(50_000);
        let wheel = TimerWheel::new(clock.clone());
        let class = wheel.add_class("bits", false, Rc::new(|_, _| {}));

        for rel in [130, 1000, 5000, 60_000] {
            let t = wheel.create(class, 0, 0);
            wheel.start(t, rel);
            let deadline = wheel.deadline(t).unwrap();
            let (level, slot) = wheel.bucket_of(t).unwrap();
            if level == 0 {
                assert_eq!(((deadline >> 7) & 511) as usize, slot);
            }
            wheel.stop(t);
        }
    }

    #[test]
    fn cascade_from_upper_level() {
        let clock = fixed_clock(10_000);
        let wheel = TimerWheel::new(clock.clone());
        let (fired, make) = recorder();
        let class = wheel.add_class("far", false, make('f'));

        // 100 s is beyond one full level-0 sweep (512 * 128 ms).
        let t = wheel.create(class, 0, 0);
        wheel.start(t, 100_000);
        let (level, _) = wheel.bucket_of(t).unwrap();
        assert!(level > 0);

        clock.set_now(10_000 + 100_000 + 128);
        wheel.walk();
        assert_eq!(*fired.borrow(), vec!['f']);
        assert_eq!(wheel.next_event(), NEVER);
    }

    #[test]
    fn jitter_only_shortens() {
        let clock = fixed_clock(20_000);
        let wheel = TimerWheel::new(clock.clone());
        let class = wheel.add_class("jitter", false, Rc::new(|_, _| {}));

        for _ in 0..32 {
            let t = wheel.create(class, 50, 0);
            wheel.start(t, 10_000);
            let deadline = wheel.deadline(t).unwrap();
            assert!(deadline <= 20_000 + 10_000);
            assert!(deadline >= 20_000 + 10_000 / 2);
            wheel.destroy(t);
        }
    }

    #[test]
    fn usage_tracks_armed_entries() {
        let clock = fixed_clock(1000);
        let wheel = TimerWheel::new(clock.clone());
        let class = wheel.add_class("usage", false, Rc::new(|_, _| {}));

        let t1 = wheel.create(class, 0, 0);
        let t2 = wheel.create(class, 0, 0);

        wheel.start(t1, 500);
        wheel.start(t2, 700);
        assert_eq!(wheel.class_usage(class), 2);

        // Restart does not double-count.
        wheel.start(t1, 900);
        assert_eq!(wheel.class_usage(class), 2);

        wheel.stop(t1);
        assert_eq!(wheel.class_usage(class), 1);

        // Stopping twice is a no-op.
        wheel.stop(t1);
        assert_eq!(wheel.class_usage(class), 1);

        wheel.destroy(t2);
        assert_eq!(wheel.class_usage(class), 0);

        // Stale handle.
        wheel.stop(t2);
        assert_eq!(wheel.class_usage(class), 0);
    }

    #[test]
    fn set_zero_stops() {
        let clock = fixed_clock(1000);
        let wheel = TimerWheel::new(clock.clone());
        let class = wheel.add_class("set", false, Rc::new(|_, _| {}));

        let t = wheel.create(class, 0, 0);
        wheel.set(t, 400);
        assert!(wheel.is_armed(t));
        wheel.set(t, 0);
        assert!(!wheel.is_armed(t));
        assert_eq!(wheel.next_event(), NEVER);
    }

    #[test]
    fn no_due_entries_after_walk() {
        let clock = fixed_clock(1000);
        let wheel = TimerWheel::new(clock.clone());
        let class = wheel.add_class("sweep", false, Rc::new(|_, _| {}));

        let mut timers = Vec::new();
        for rel in (100..4000).step_by(170) {
            let t = wheel.create(class, 0, 0);
            wheel.start(t, rel);
            timers.push(t);
        }

        clock.set_now(3000);
        wheel.walk();

        for t in timers {
            if let Some(deadline) = wheel.deadline(t) {
                assert!(deadline > clock.now());
            }
        }
        assert!(wheel.next_event() > clock.now());
    }
}
