//! Thread-local autorelease pools.
//!
//! An autoreleased object is owned by the innermost pool of the current
//! thread and released when that pool is popped. Pools nest: [`PoolMark`]
//! records the stack depth at push time and popping releases everything
//! above it, newest first. Each push gets its own sequence number, so a mark
//! that was already popped (directly or with an outer pool) is ignored.
//! An object autoreleased with no pool in place is released at once.
//!
//! # Design
//!
//! - **Per thread, per runtime**: each thread keeps one stack per runtime it
//!   has autoreleased into, so independent runtimes never release each
//!   other's objects
//! - **Frames**: a stack is a chain of fixed-capacity frames
//!   ([`RuntimeConfig::pool_frame_capacity`] entries, one page by default);
//!   frames are allocated on demand and freed as soon as they empty
//! - **Thread exit**: pending entries are released when the thread's storage
//!   is torn down; objects autoreleased after that point are released at once
//!
//! # Example
//!
//! ```
//! use oxobj::{Runtime, RuntimeConfig};
//!
//! let rt = Runtime::new(RuntimeConfig::default());
//! let class = rt.create_class(None, "Temp").unwrap();
//! rt.register_class(class);
//!
//! rt.with_autorelease_pool(|| {
//!     let obj = rt.new_object(class).autorelease();
//!     assert_eq!(rt.retain_count(obj), 1);
//!     assert_eq!(rt.pool_pending(), 1);
//! });
//! assert_eq!(rt.pool_pending(), 0);
//! ```
//!
//! [`RuntimeConfig::pool_frame_capacity`]: crate::RuntimeConfig::pool_frame_capacity

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Weak;

use oxobj_log::{debug, warn};

use crate::runtime::Runtime;
use crate::runtime::object::Id;

// ============================================================================
// Thread-local state
// ============================================================================

thread_local! {
    static POOLS: RefCell<ThreadPools> = const { RefCell::new(ThreadPools::new()) };
}

struct PoolStack {
    runtime_id: u64,
    runtime: Weak<Runtime>,
    frame_capacity: usize,
    /// Oldest frame first.
    frames: Vec<Vec<Id>>,
    len: usize,
    /// `(sequence, depth)` of the pools currently pushed, innermost last.
    marks: Vec<(u64, usize)>,
    next_seq: u64,
}

impl PoolStack {
    fn new(rt: &Runtime) -> Self {
        Self {
            runtime_id: rt.id(),
            runtime: rt.weak_self().clone(),
            frame_capacity: rt.config().pool_frame_capacity.max(1),
            frames: Vec::new(),
            len: 0,
            marks: Vec::new(),
            next_seq: 0,
        }
    }

    fn push(&mut self, id: Id) {
        match self.frames.last_mut() {
            Some(frame) if frame.len() < self.frame_capacity => frame.push(id),
            _ => {
                let mut frame = Vec::with_capacity(self.frame_capacity);
                frame.push(id);
                self.frames.push(frame);
            }
        }
        self.len += 1;
    }

    /// Removes the newest entry if the stack is deeper than `depth`.
    fn pop_above(&mut self, depth: usize) -> Option<Id> {
        if self.len <= depth {
            return None;
        }
        let frame = self.frames.last_mut()?;
        let id = frame.pop()?;
        if frame.is_empty() {
            self.frames.pop();
        }
        self.len -= 1;
        Some(id)
    }
}

struct ThreadPools {
    stacks: Vec<PoolStack>,
}

impl ThreadPools {
    const fn new() -> Self {
        Self { stacks: Vec::new() }
    }

    fn stack(&mut self, rt: &Runtime) -> &mut PoolStack {
        let index = match self.stacks.iter().position(|s| s.runtime_id == rt.id()) {
            Some(index) => index,
            None => {
                self.stacks.push(PoolStack::new(rt));
                self.stacks.len() - 1
            }
        };
        &mut self.stacks[index]
    }

    fn find(&mut self, runtime_id: u64) -> Option<&mut PoolStack> {
        self.stacks.iter_mut().find(|s| s.runtime_id == runtime_id)
    }
}

impl Drop for ThreadPools {
    fn drop(&mut self) {
        while let Some(mut stack) = self.stacks.pop() {
            let Some(rt) = stack.runtime.upgrade() else {
                continue;
            };
            if stack.len > 0 {
                debug!("draining {} autoreleased objects at thread exit", stack.len);
            }
            while let Some(id) = stack.pop_above(0) {
                rt.release(id);
            }
        }
    }
}

/// Adds `id` to the current thread's innermost pool.
pub(crate) fn pool_add(rt: &Runtime, id: Id) {
    let added = POOLS.try_with(|pools| {
        let mut pools = pools.borrow_mut();
        let stack = pools.stack(rt);
        if stack.marks.is_empty() {
            return false;
        }
        stack.push(id);
        true
    });
    match added {
        Ok(true) => {}
        Ok(false) => {
            warn!("{id:?} autoreleased with no pool in place; releasing it now");
            rt.release(id);
        }
        Err(_) => rt.release(id),
    }
}

/// Drops this thread's entries for a runtime that is going away.
pub(crate) fn forget_runtime(runtime_id: u64) {
    let _ = POOLS.try_with(|pools| {
        let Ok(mut pools) = pools.try_borrow_mut() else {
            return;
        };
        if let Some(index) = pools.stacks.iter().position(|s| s.runtime_id == runtime_id) {
            let stack = pools.stacks.swap_remove(index);
            if stack.len > 0 {
                warn!("runtime {runtime_id} dropped with {} autoreleased objects pending", stack.len);
            }
        }
    });
}

// ============================================================================
// Public API
// ============================================================================

/// Position of a pushed pool, returned by [`Runtime::pool_push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolMark {
    runtime_id: u64,
    seq: u64,
    depth: usize,
}

impl Runtime {
    /// Pushes a new autorelease pool on the current thread.
    pub fn pool_push(&self) -> PoolMark {
        let (seq, depth) = POOLS.with_borrow_mut(|pools| {
            let stack = pools.stack(self);
            let seq = stack.next_seq;
            stack.next_seq += 1;
            stack.marks.push((seq, stack.len));
            (seq, stack.len)
        });
        PoolMark {
            runtime_id: self.id(),
            seq,
            depth,
        }
    }

    /// Pops the pool `mark` names and every pool pushed after it, releasing
    /// their objects newest first. Objects autoreleased while popping are
    /// released too.
    pub fn pool_pop(&self, mark: PoolMark) {
        if mark.runtime_id != self.id() {
            warn!("pool mark of runtime {} popped on runtime {}", mark.runtime_id, self.id());
            return;
        }
        let known = POOLS.with_borrow_mut(|pools| {
            let Some(stack) = pools.find(self.id()) else {
                return false;
            };
            let Some(pos) = stack.marks.iter().rposition(|&(seq, _)| seq == mark.seq) else {
                return false;
            };
            stack.marks.truncate(pos);
            true
        });
        if !known {
            warn!("ignoring pop of unknown or already popped pool #{}", mark.seq);
            return;
        }

        loop {
            let next = POOLS.with_borrow_mut(|pools| {
                pools.find(self.id()).and_then(|stack| stack.pop_above(mark.depth))
            });
            match next {
                Some(id) => self.release(id),
                None => break,
            }
        }
    }

    /// Runs `f` inside a fresh autorelease pool.
    pub fn with_autorelease_pool<R>(&self, f: impl FnOnce() -> R) -> R {
        let _pool = AutoreleasePool::new(self);
        f()
    }

    /// Number of objects waiting in this thread's pools for this runtime.
    #[must_use]
    pub fn pool_pending(&self) -> usize {
        POOLS.with_borrow_mut(|pools| pools.find(self.id()).map_or(0, |s| s.len))
    }
}

/// Scope guard around [`Runtime::pool_push`] / [`Runtime::pool_pop`].
pub struct AutoreleasePool<'rt> {
    rt: &'rt Runtime,
    mark: PoolMark,
    // Pools belong to the thread that pushed them.
    _not_send: PhantomData<*const ()>,
}

impl<'rt> AutoreleasePool<'rt> {
    #[must_use]
    pub fn new(rt: &'rt Runtime) -> Self {
        Self {
            rt,
            mark: rt.pool_push(),
            _not_send: PhantomData,
        }
    }

    #[must_use]
    pub fn mark(&self) -> PoolMark {
        self.mark
    }
}

impl Drop for AutoreleasePool<'_> {
    fn drop(&mut self) {
        self.rt.pool_pop(self.mark);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::class::Class;
    use crate::runtime::selector::Sel;
    use std::sync::{Arc, Mutex};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn tracked(rt: &Runtime, name: &str, dealloc: crate::runtime::Imp) -> Class {
        let class = rt.create_class(None, name).unwrap();
        rt.add_ivar(class, "tag", 8, 8).unwrap();
        rt.add_method(class, rt.sels.dealloc, dealloc);
        rt.register_class(class);
        class
    }

    #[test]
    fn test_pop_releases_lifo() {
        static ORDER: Mutex<Vec<u64>> = Mutex::new(Vec::new());
        fn record(rt: &Runtime, receiver: Id, _: Sel, _: &[usize]) -> usize {
            ORDER.lock().unwrap().push(rt.read_ivar::<u64>(receiver, "tag").unwrap());
            0
        }

        let rt = Runtime::new(RuntimeConfig::default());
        let class = tracked(&rt, "Ordered", record);
        let mark = rt.pool_push();
        for tag in 1..=3u64 {
            let id = rt.alloc(class);
            rt.write_ivar(id, "tag", tag).unwrap();
            rt.autorelease(id);
        }
        assert_eq!(rt.pool_pending(), 3);
        rt.pool_pop(mark);
        assert_eq!(*ORDER.lock().unwrap(), vec![3, 2, 1]);
        assert_eq!(rt.pool_pending(), 0);
    }

    #[test]
    fn test_nested_pools() {
        static DEALLOCS: AtomicUsize = AtomicUsize::new(0);
        fn count(_: &Runtime, _: Id, _: Sel, _: &[usize]) -> usize {
            DEALLOCS.fetch_add(1, Ordering::SeqCst);
            0
        }

        let rt = Runtime::new(RuntimeConfig::default());
        let class = tracked(&rt, "Nested", count);
        let outer = rt.pool_push();
        rt.autorelease(rt.alloc(class));
        let inner = rt.pool_push();
        rt.autorelease(rt.alloc(class));
        rt.autorelease(rt.alloc(class));

        rt.pool_pop(inner);
        assert_eq!(DEALLOCS.load(Ordering::SeqCst), 2);
        assert_eq!(rt.pool_pending(), 1);

        // Popping the inner mark again is ignored.
        rt.pool_pop(inner);
        assert_eq!(rt.pool_pending(), 1);

        rt.pool_pop(outer);
        assert_eq!(DEALLOCS.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_inner_pop_leaves_outer_objects() {
        static FREED: Mutex<Vec<u64>> = Mutex::new(Vec::new());
        fn record(rt: &Runtime, receiver: Id, _: Sel, _: &[usize]) -> usize {
            FREED.lock().unwrap().push(rt.read_ivar::<u64>(receiver, "tag").unwrap());
            0
        }

        let rt = Runtime::new(RuntimeConfig::default());
        let class = tracked(&rt, "Tagged", record);
        let tagged = |tag: u64| {
            let id = rt.alloc(class);
            rt.write_ivar(id, "tag", tag).unwrap();
            id
        };

        let p1 = rt.pool_push();
        let a = rt.autorelease(tagged(1));
        let p2 = rt.pool_push();
        rt.autorelease(tagged(2));
        rt.autorelease(tagged(3));
        rt.pool_pop(p2);

        assert_eq!(*FREED.lock().unwrap(), vec![3, 2]);
        assert_eq!(rt.retain_count(a), 1);
        assert_eq!(rt.pool_pending(), 1);

        rt.pool_pop(p1);
        assert_eq!(*FREED.lock().unwrap(), vec![3, 2, 1]);
    }

    #[test]
    fn test_stale_mark_does_not_pop_newer_pool() {
        let rt = Runtime::new(RuntimeConfig::default());
        let class = tracked(&rt, "Shared", |_, _, _, _| 0);
        let obj = rt.alloc(class);
        rt.retain(obj);

        // Both marks sit at the same depth.
        let p1 = rt.pool_push();
        let p2 = rt.pool_push();
        rt.pool_pop(p1);

        let p3 = rt.pool_push();
        rt.autorelease(obj);
        rt.pool_pop(p2);
        assert_eq!(rt.retain_count(obj), 2);
        assert_eq!(rt.pool_pending(), 1);

        rt.pool_pop(p3);
        assert_eq!(rt.retain_count(obj), 1);
        rt.release(obj);
    }

    #[test]
    fn test_autorelease_without_pool_releases_now() {
        static DEALLOCS: AtomicUsize = AtomicUsize::new(0);
        fn count(_: &Runtime, _: Id, _: Sel, _: &[usize]) -> usize {
            DEALLOCS.fetch_add(1, Ordering::SeqCst);
            0
        }

        let rt = Runtime::new(RuntimeConfig::default());
        let class = tracked(&rt, "Unpooled", count);
        let kept = rt.alloc(class);
        rt.retain(kept);
        rt.autorelease(kept);
        assert_eq!(rt.retain_count(kept), 1);

        rt.autorelease(rt.alloc(class));
        assert_eq!(DEALLOCS.load(Ordering::SeqCst), 1);
        assert_eq!(rt.pool_pending(), 0);
        rt.release(kept);
        assert_eq!(DEALLOCS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_pop_outer_pops_inner() {
        let rt = Runtime::new(RuntimeConfig::default());
        let class = tracked(&rt, "Plain", |_, _, _, _| 0);
        let outer = rt.pool_push();
        rt.autorelease(rt.alloc(class));
        let _inner = rt.pool_push();
        rt.autorelease(rt.alloc(class));
        rt.pool_pop(outer);
        assert_eq!(rt.pool_pending(), 0);
    }

    #[test]
    fn test_frames_grow_and_shrink() {
        let rt = Runtime::new(RuntimeConfig::default().with_pool_frame_capacity(4));
        let class = tracked(&rt, "Many", |_, _, _, _| 0);
        let mark = rt.pool_push();
        for _ in 0..10 {
            rt.autorelease(rt.alloc(class));
        }
        let frames = POOLS.with_borrow_mut(|p| p.find(rt.id()).map(|s| s.frames.len()));
        assert_eq!(frames, Some(3));
        rt.pool_pop(mark);
        let frames = POOLS.with_borrow_mut(|p| p.find(rt.id()).map(|s| s.frames.len()));
        assert_eq!(frames, Some(0));
    }

    #[test]
    fn test_guard_and_retained_object_survives() {
        let rt = Runtime::new(RuntimeConfig::default());
        let class = tracked(&rt, "Kept", |_, _, _, _| 0);
        let kept = rt.with_autorelease_pool(|| {
            let id = rt.new_object(class).autorelease();
            rt.retain(id)
        });
        assert_eq!(rt.retain_count(kept), 1);
        rt.release(kept);
    }

    #[test]
    fn test_thread_exit_drains() {
        static DEALLOCS: AtomicUsize = AtomicUsize::new(0);
        fn count(_: &Runtime, _: Id, _: Sel, _: &[usize]) -> usize {
            DEALLOCS.fetch_add(1, Ordering::SeqCst);
            0
        }

        let rt = Runtime::new(RuntimeConfig::default());
        let class = tracked(&rt, "Leftover", count);
        let worker = Arc::clone(&rt);
        thread::spawn(move || {
            let _mark = worker.pool_push();
            worker.autorelease(worker.alloc(class));
            worker.autorelease(worker.alloc(class));
        })
        .join()
        .unwrap();
        assert_eq!(DEALLOCS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_runtimes_have_separate_stacks() {
        let a = Runtime::new(RuntimeConfig::default());
        let b = Runtime::new(RuntimeConfig::default());
        let class = tracked(&a, "OnA", |_, _, _, _| 0);
        let mark_b = b.pool_push();
        let mark_a = a.pool_push();
        a.autorelease(a.alloc(class));
        b.pool_pop(mark_b);
        assert_eq!(a.pool_pending(), 1);
        a.pool_pop(mark_a);
        assert_eq!(a.pool_pending(), 0);
    }
}
