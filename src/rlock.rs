use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

// Inclusive sector range.
type Range = (u64, u64);

#[inline]
fn intersects(a: Range, b: Range) -> bool {
    a.0 <= b.1 && b.0 <= a.1
}

struct Waiter {
    ticket: u64,
    range: Range,
    waker: Option<Waker>,
    granted: bool,
}

#[derive(Default)]
struct LockState {
    locked: Vec<Range>,
    waiters: Vec<Waiter>,
    next_ticket: u64,
}

impl LockState {
    fn locked_conflicts(&self, range: Range) -> bool {
        self.locked.iter().any(|r| intersects(*r, range))
    }

    fn waiter_conflicts(&self, range: Range) -> bool {
        self.waiters
            .iter()
            .any(|w| !w.granted && intersects(w.range, range))
    }

    fn release(&mut self, range: Range) -> Vec<Waker> {
        let pos = self
            .locked
            .iter()
            .position(|r| *r == range)
            .expect("releasing a range that is not locked");
        self.locked.swap_remove(pos);

        // Grant in arrival order. A waiter that conflicts with an earlier
        // grant stays queued, so overlapping waiters cannot starve each
        // other out of order.
        let mut wakers = Vec::new();
        for i in 0..self.waiters.len() {
            if self.waiters[i].granted {
                continue;
            }
            let wr = self.waiters[i].range;
            if !self.locked.iter().any(|r| intersects(*r, wr)) {
                self.locked.push(wr);
                self.waiters[i].granted = true;
                if let Some(w) = self.waiters[i].waker.take() {
                    wakers.push(w);
                }
            }
        }
        wakers
    }
}

/// Exclusive locks over inclusive sector intervals.
///
/// Two lock attempts whose intervals intersect never hold the lock at the
/// same time; grants happen in FIFO order. Locks are held across
/// suspension points and released when the guard drops. If the host
/// scheduler drops a task while it holds a guard, the guard's `Drop` still
/// runs; a task cancelled while *waiting* is removed from the queue.
pub struct RangeLocks {
    state: Rc<RefCell<LockState>>,
}

impl RangeLocks {
    pub fn new() -> Self {
        RangeLocks {
            state: Rc::new(RefCell::new(LockState::default())),
        }
    }

    /// Lock the inclusive sector range `[start, end]`.
    pub fn lock(&self, start: u64, end: u64) -> RangeLockFuture {
        debug_assert!(start <= end);
        RangeLockFuture {
            state: Rc::clone(&self.state),
            range: (start, end),
            ticket: None,
        }
    }
}

impl Default for RangeLocks {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RangeLockGuard {
    state: Rc<RefCell<LockState>>,
    range: Range,
}

impl Drop for RangeLockGuard {
    fn drop(&mut self) {
        let wakers = self.state.borrow_mut().release(self.range);
        for w in wakers {
            w.wake();
        }
    }
}

pub struct RangeLockFuture {
    state: Rc<RefCell<LockState>>,
    range: Range,
    ticket: Option<u64>,
}

impl Future for RangeLockFuture {
    type Output = RangeLockGuard;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<RangeLockGuard> {
        let me = self.get_mut();
        let mut st = me.state.borrow_mut();

        match me.ticket {
            None => {
                // Queue behind any conflicting waiter even if the locked
                // set itself is free, so late arrivals cannot barge.
                if !st.locked_conflicts(me.range) && !st.waiter_conflicts(me.range) {
                    st.locked.push(me.range);
                    drop(st);
                    Poll::Ready(RangeLockGuard {
                        state: Rc::clone(&me.state),
                        range: me.range,
                    })
                } else {
                    let ticket = st.next_ticket;
                    st.next_ticket += 1;
                    st.waiters.push(Waiter {
                        ticket,
                        range: me.range,
                        waker: Some(cx.waker().clone()),
                        granted: false,
                    });
                    me.ticket = Some(ticket);
                    Poll::Pending
                }
            }
            Some(ticket) => {
                let idx = st
                    .waiters
                    .iter()
                    .position(|w| w.ticket == ticket)
                    .expect("lock waiter disappeared");
                if st.waiters[idx].granted {
                    st.waiters.remove(idx);
                    me.ticket = None;
                    drop(st);
                    Poll::Ready(RangeLockGuard {
                        state: Rc::clone(&me.state),
                        range: me.range,
                    })
                } else {
                    st.waiters[idx].waker = Some(cx.waker().clone());
                    Poll::Pending
                }
            }
        }
    }
}

impl Drop for RangeLockFuture {
    fn drop(&mut self) {
        let Some(ticket) = self.ticket else {
            return;
        };
        let mut st = self.state.borrow_mut();
        let Some(idx) = st.waiters.iter().position(|w| w.ticket == ticket) else {
            return;
        };
        let waiter = st.waiters.remove(idx);
        // Cancelled after the grant but before the guard existed: the range
        // is already in the locked set and must be released.
        if waiter.granted {
            let wakers = st.release(waiter.range);
            drop(st);
            for w in wakers {
                w.wake();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::join;

    /// Suspend once, forcing the sibling future in a `join!` to run.
    async fn yield_once() {
        let mut yielded = false;
        futures::future::poll_fn(|cx| {
            if yielded {
                Poll::Ready(())
            } else {
                yielded = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        })
        .await;
    }

    #[test]
    fn test_disjoint_ranges_lock_immediately() {
        block_on(async {
            let locks = RangeLocks::new();
            let a = locks.lock(0, 9).await;
            let b = locks.lock(10, 19).await;
            drop(a);
            drop(b);
        });
    }

    #[test]
    fn test_overlap_is_exclusive() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let locks = RangeLocks::new();

        block_on(async {
            let ev_a = Rc::clone(&events);
            let ev_b = Rc::clone(&events);

            let a = async {
                let _g = locks.lock(0, 10).await;
                ev_a.borrow_mut().push("a-acquired");
                yield_once().await;
                yield_once().await;
                ev_a.borrow_mut().push("a-released");
            };
            let b = async {
                yield_once().await;
                let _g = locks.lock(5, 15).await;
                ev_b.borrow_mut().push("b-acquired");
            };
            join!(a, b);
        });

        assert_eq!(
            *events.borrow(),
            vec!["a-acquired", "a-released", "b-acquired"]
        );
    }

    #[test]
    fn test_fifo_grant_order() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let locks = RangeLocks::new();

        block_on(async {
            let ev_a = Rc::clone(&events);
            let ev_b = Rc::clone(&events);
            let ev_c = Rc::clone(&events);

            let a = async {
                let _g = locks.lock(0, 5).await;
                yield_once().await;
                yield_once().await;
                ev_a.borrow_mut().push("a");
            };
            // b and c queue in the same round, b first; both contend for
            // the same range
            let b = async {
                yield_once().await;
                let _g = locks.lock(0, 5).await;
                ev_b.borrow_mut().push("b");
            };
            let c = async {
                yield_once().await;
                let _g = locks.lock(0, 5).await;
                ev_c.borrow_mut().push("c");
            };
            join!(a, b, c);
        });

        assert_eq!(*events.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_waiter_blocks_barging() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let locks = RangeLocks::new();

        block_on(async {
            let ev_a = Rc::clone(&events);
            let ev_b = Rc::clone(&events);
            let ev_c = Rc::clone(&events);

            let a = async {
                let _g = locks.lock(0, 5).await;
                yield_once().await;
                yield_once().await;
                ev_a.borrow_mut().push("a");
            };
            let b = async {
                yield_once().await;
                let _g = locks.lock(3, 8).await;
                ev_b.borrow_mut().push("b");
            };
            // c's range is free while b waits, but it overlaps waiter b
            // and must queue behind it
            let c = async {
                yield_once().await;
                let _g = locks.lock(6, 9).await;
                ev_c.borrow_mut().push("c");
            };
            join!(a, b, c);
        });

        assert_eq!(*events.borrow(), vec!["a", "b", "c"]);
    }
}
