//! One-shot futures and the fiber-ready queue.
//!
//! A fiber is a deferred callback on the memoizer's ready queue; the stir
//! loop runs them between operation completions. A [`Fut`] is a one-shot
//! cell that transitions exactly once, Undet → Det or Undet → Never, and
//! schedules its waiters as fibers at that transition. Everything here is
//! single-threaded; handles are `Rc` clones that must stay on the driver
//! thread.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// The reserved failure sentinel.
///
/// [`Memo::fail`](crate::Memo::fail) records the failure and hands one back;
/// a fiber returning `Err(Abort)` is treated as an already-reported build
/// failure, not as an unexpected error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Abort;

pub type FiberResult = Result<(), Abort>;

pub(crate) type FiberFn = Box<dyn FnOnce() -> FiberResult>;

/// The fiber-ready queue, shared between the memoizer and every future.
#[derive(Clone, Default)]
pub(crate) struct FiberQueue(Rc<RefCell<VecDeque<FiberFn>>>);

impl FiberQueue {
    pub(crate) fn new() -> FiberQueue {
        FiberQueue::default()
    }

    pub(crate) fn push(&self, fiber: FiberFn) {
        self.0.borrow_mut().push_back(fiber);
    }

    pub(crate) fn pop(&self) -> Option<FiberFn> {
        self.0.borrow_mut().pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }
}

enum FutState<T> {
    Undet {
        det: Vec<Box<dyn FnOnce(T) -> FiberResult>>,
        any: Vec<Box<dyn FnOnce(Option<T>) -> FiberResult>>,
    },
    Det(T),
    Never,
}

/// A one-shot future determined by the memoizer.
pub struct Fut<T> {
    state: Rc<RefCell<FutState<T>>>,
    queue: FiberQueue,
}

impl<T> Clone for Fut<T> {
    fn clone(&self) -> Self {
        Fut {
            state: Rc::clone(&self.state),
            queue: self.queue.clone(),
        }
    }
}

impl<T: Clone + 'static> Fut<T> {
    pub(crate) fn new(queue: FiberQueue) -> Fut<T> {
        Fut {
            state: Rc::new(RefCell::new(FutState::Undet {
                det: Vec::new(),
                any: Vec::new(),
            })),
            queue,
        }
    }

    /// Determine the future. Panics if it was already determined or made
    /// Never; setting a future twice is a programming error.
    pub fn set(&self, value: T) {
        let (det, any) = match &mut *self.state.borrow_mut() {
            state @ FutState::Undet { .. } => {
                let prev = std::mem::replace(state, FutState::Det(value.clone()));
                match prev {
                    FutState::Undet { det, any } => (det, any),
                    _ => unreachable!(),
                }
            }
            _ => panic!("future set twice"),
        };
        for k in det {
            let v = value.clone();
            self.queue.push(Box::new(move || k(v)));
        }
        for k in any {
            let v = value.clone();
            self.queue.push(Box::new(move || k(Some(v))));
        }
    }

    /// Make the future Never: determination waiters are dropped, `await_set`
    /// waiters observe `None`. Panics if the future was already determined.
    pub fn set_never(&self) {
        let any = match &mut *self.state.borrow_mut() {
            state @ FutState::Undet { .. } => {
                let prev = std::mem::replace(state, FutState::Never);
                match prev {
                    FutState::Undet { any, .. } => any,
                    _ => unreachable!(),
                }
            }
            FutState::Det(_) => panic!("future set twice"),
            FutState::Never => return,
        };
        for k in any {
            self.queue.push(Box::new(move || k(None)));
        }
    }

    /// Run `k` with the value once determined. Dropped silently if the
    /// future ends up Never. Fires through the fiber queue even when the
    /// value is already available, preserving submission order.
    pub fn await_det(&self, k: impl FnOnce(T) -> FiberResult + 'static) {
        match &mut *self.state.borrow_mut() {
            FutState::Undet { det, .. } => det.push(Box::new(k)),
            FutState::Det(v) => {
                let v = v.clone();
                self.queue.push(Box::new(move || k(v)));
            }
            FutState::Never => {}
        }
    }

    /// Run `k` when the future transitions, with `None` on Never.
    pub fn await_set(&self, k: impl FnOnce(Option<T>) -> FiberResult + 'static) {
        match &mut *self.state.borrow_mut() {
            FutState::Undet { any, .. } => any.push(Box::new(k)),
            FutState::Det(v) => {
                let v = v.clone();
                self.queue.push(Box::new(move || k(Some(v))));
            }
            FutState::Never => {
                self.queue.push(Box::new(move || k(None)));
            }
        }
    }

    /// The value, if determined.
    pub fn get(&self) -> Option<T> {
        match &*self.state.borrow() {
            FutState::Det(v) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn is_det(&self) -> bool {
        matches!(&*self.state.borrow(), FutState::Det(_))
    }

    pub fn is_never(&self) -> bool {
        matches!(&*self.state.borrow(), FutState::Never)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(queue: &FiberQueue) {
        while let Some(fiber) = queue.pop() {
            let _ = fiber();
        }
    }

    #[test]
    fn waiters_fire_after_set() {
        let queue = FiberQueue::new();
        let fut: Fut<i32> = Fut::new(queue.clone());

        let seen = Rc::new(RefCell::new(Vec::new()));
        for tag in ["a", "b"] {
            let seen = Rc::clone(&seen);
            fut.await_det(move |v| {
                seen.borrow_mut().push((tag, v));
                Ok(())
            });
        }

        fut.set(7);
        assert!(seen.borrow().is_empty(), "waiters run via the queue");
        drain(&queue);
        assert_eq!(&*seen.borrow(), &[("a", 7), ("b", 7)]);
    }

    #[test]
    fn await_after_set_still_fires() {
        let queue = FiberQueue::new();
        let fut: Fut<i32> = Fut::new(queue.clone());
        fut.set(1);

        let seen = Rc::new(RefCell::new(None));
        let s = Rc::clone(&seen);
        fut.await_det(move |v| {
            *s.borrow_mut() = Some(v);
            Ok(())
        });
        drain(&queue);
        assert_eq!(*seen.borrow(), Some(1));
        assert_eq!(fut.get(), Some(1));
    }

    #[test]
    #[should_panic(expected = "future set twice")]
    fn double_set_panics() {
        let fut: Fut<i32> = Fut::new(FiberQueue::new());
        fut.set(1);
        fut.set(2);
    }

    #[test]
    fn never_drops_det_waiters_and_feeds_set_waiters() {
        let queue = FiberQueue::new();
        let fut: Fut<i32> = Fut::new(queue.clone());

        let det_ran = Rc::new(RefCell::new(false));
        let d = Rc::clone(&det_ran);
        fut.await_det(move |_| {
            *d.borrow_mut() = true;
            Ok(())
        });

        let observed = Rc::new(RefCell::new(Some(0)));
        let o = Rc::clone(&observed);
        fut.await_set(move |v| {
            *o.borrow_mut() = v;
            Ok(())
        });

        fut.set_never();
        drain(&queue);
        assert!(!*det_ran.borrow());
        assert_eq!(*observed.borrow(), None);
        assert!(fut.is_never());
    }

    #[test]
    fn abort_result_is_swallowed_by_the_runner() {
        let queue = FiberQueue::new();
        let fut: Fut<()> = Fut::new(queue.clone());
        fut.await_det(|_| Err(Abort));
        fut.set(());
        drain(&queue);
    }
}
