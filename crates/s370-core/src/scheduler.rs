//! The discrete-event scheduler (§4.2): a monotone time wheel of pending
//! device callbacks, the only mechanism by which asynchronous device
//! progress occurs (§1).
//!
//! Callback identity is `(owner, selector, arg)` rather than a boxed
//! closure — a device address, an opaque selector the device itself
//! interprets, and an integer argument — so events are POD and
//! `cancel_event` equality is well-defined (§9 design note: "Scheduler
//! storing capture-by-value closures").

use std::collections::VecDeque;

/// One pending callback. `delta` is ticks since the *previous* entry in the
/// queue (delta-list encoding), not an absolute fire time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Event {
    owner: u16,
    selector: u32,
    arg: i32,
    delta: i64,
}

/// Dispatch callback invoked for a fired event. Takes `&mut EventScheduler`
/// (not `&mut self` recursively) so that the device logic it runs may
/// itself call [`EventScheduler::add_event`] or
/// [`EventScheduler::cancel_event`] without a double-mutable-borrow
/// conflict — the fired event has already been popped before dispatch
/// runs.
pub type Dispatch<'a> = dyn FnMut(&mut EventScheduler, u16, u32, i32) + 'a;

/// Single-threaded cooperative event queue, delta-ordered by time-to-fire.
#[derive(Default)]
pub struct EventScheduler {
    queue: VecDeque<Event>,
}

impl EventScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self { queue: VecDeque::new() }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Insert a new event `ticks` from now. A zero-or-negative `ticks`
    /// fires the callback immediately, synchronously, before returning
    /// (caller-observable per §4.2).
    pub fn add_event(
        &mut self,
        owner: u16,
        selector: u32,
        ticks: i64,
        arg: i32,
        dispatch: &mut Dispatch<'_>,
    ) {
        if ticks <= 0 {
            dispatch(self, owner, selector, arg);
            return;
        }
        let mut remaining = ticks;
        let mut pos = 0;
        while pos < self.queue.len() {
            let entry_delta = self.queue[pos].delta;
            if entry_delta > remaining {
                self.queue[pos].delta = entry_delta - remaining;
                break;
            }
            remaining -= entry_delta;
            pos += 1;
        }
        self.queue.insert(
            pos,
            Event {
                owner,
                selector,
                arg,
                delta: remaining,
            },
        );
    }

    /// Remove the first matching `(owner, selector, arg)` entry, folding
    /// its residual delta into the following entry. Returns whether an
    /// entry was removed.
    pub fn cancel_event(&mut self, owner: u16, selector: u32, arg: i32) -> bool {
        if let Some(pos) = self
            .queue
            .iter()
            .position(|e| e.owner == owner && e.selector == selector && e.arg == arg)
        {
            let removed = self.queue.remove(pos).expect("position just found");
            if let Some(next) = self.queue.get_mut(pos) {
                next.delta += removed.delta;
            }
            true
        } else {
            false
        }
    }

    /// Advance simulated time by `n` ticks, firing every callback whose
    /// cumulative delta has reached zero, in monotonic time order (and
    /// insertion order among same-time events, including events newly
    /// added by a callback within this same `advance` call).
    pub fn advance(&mut self, n: i64, dispatch: &mut Dispatch<'_>) {
        if self.queue.is_empty() {
            return;
        }
        self.queue[0].delta -= n;
        while let Some(front) = self.queue.front() {
            if front.delta > 0 {
                break;
            }
            let ev = self.queue.pop_front().expect("front just checked");
            dispatch(self, ev.owner, ev.selector, ev.arg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn noop(_s: &mut EventScheduler, _o: u16, _sel: u32, _a: i32) {}

    #[test]
    fn empty_advance_is_noop() {
        let mut sched = EventScheduler::new();
        sched.advance(100, &mut noop);
        assert!(sched.is_empty());
    }

    #[test]
    fn zero_tick_event_fires_immediately() {
        let mut sched = EventScheduler::new();
        let fired: RefCell<Vec<(u16, u32, i32)>> = RefCell::new(Vec::new());
        let mut dispatch = |_s: &mut EventScheduler, o: u16, sel: u32, a: i32| {
            fired.borrow_mut().push((o, sel, a));
        };
        sched.add_event(5, 1, 0, 42, &mut dispatch);
        assert_eq!(*fired.borrow(), vec![(5, 1, 42)]);
        assert!(sched.is_empty());
    }

    #[test]
    fn events_fire_in_monotonic_and_insertion_order() {
        let mut sched = EventScheduler::new();
        let fired: RefCell<Vec<u16>> = RefCell::new(Vec::new());
        let mut dispatch =
            |_s: &mut EventScheduler, o: u16, _sel: u32, _a: i32| fired.borrow_mut().push(o);
        sched.add_event(1, 0, 10, 0, &mut dispatch);
        sched.add_event(2, 0, 5, 0, &mut dispatch);
        sched.add_event(3, 0, 10, 0, &mut dispatch);
        sched.advance(5, &mut dispatch);
        assert_eq!(*fired.borrow(), vec![2]);
        sched.advance(5, &mut dispatch);
        assert_eq!(*fired.borrow(), vec![2, 1, 3]);
    }

    #[test]
    fn cancel_absorbs_residual_into_successor() {
        let mut sched = EventScheduler::new();
        let fired: RefCell<Vec<u16>> = RefCell::new(Vec::new());
        let mut dispatch =
            |_s: &mut EventScheduler, o: u16, _sel: u32, _a: i32| fired.borrow_mut().push(o);
        sched.add_event(1, 0, 10, 0, &mut dispatch);
        sched.add_event(2, 0, 10, 0, &mut dispatch); // delta 10 from event 1 (total 20)
        assert!(sched.cancel_event(1, 0, 0));
        sched.advance(20, &mut dispatch);
        assert_eq!(*fired.borrow(), vec![2]);
    }

    #[test]
    fn callback_can_add_new_event_fired_same_advance() {
        let mut sched = EventScheduler::new();
        let fired: RefCell<Vec<u16>> = RefCell::new(Vec::new());
        let mut dispatch = |s: &mut EventScheduler, o: u16, sel: u32, a: i32| {
            fired.borrow_mut().push(o);
            if o == 1 && sel == 0 {
                let mut inner = |_s: &mut EventScheduler, o2: u16, _sel2: u32, _a2: i32| {
                    fired.borrow_mut().push(o2);
                };
                s.add_event(2, 0, 0, a, &mut inner);
            }
        };
        sched.add_event(1, 0, 5, 0, &mut dispatch);
        sched.advance(5, &mut dispatch);
        assert_eq!(*fired.borrow(), vec![1, 2]);
    }
}
