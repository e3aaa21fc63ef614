//! An unbounded single-producer, single-consumer (SPSC) queue, implemented
//! as a lock-free singly-linked list whose spent nodes are recycled.
//!
//! See the documentation for the [`SpscQueue`] type for details.
//!
//! # Structure
//!
//! The queue is one physical chain of nodes threaded through four pointers:
//!
//! ```text
//!  cache_head ──▶ ... ──▶ cache_tail ──▶ ... ──▶ before_head ──▶ ... ──▶ tail ──▶ ∅
//!  ╰─────── free cache ──────╯╰── reclaimed, unseen ──╯╰───── live values ─────╯
//! ```
//!
//! - `(before_head, tail]` holds the live values waiting to be popped;
//!   `before_head` itself is a sentinel whose element storage is dead.
//! - `[cache_tail, before_head]` is the *reclaim region*: nodes the consumer
//!   has finished with, which the producer has not looked at yet.
//! - `[cache_head, cache_tail)` is the *free cache*: nodes the producer may
//!   reuse without allocating.
//!
//! `tail`, `cache_head`, and `cache_tail` belong to the producer side;
//! `before_head` is written by the consumer and read by both sides. Handing
//! spent nodes back through `before_head` is what makes a steady-state
//! [`push`](Producer::push) allocation-free once the consumer keeps up.
//!
//! # Synchronization
//!
//! Exactly two atomic locations carry all cross-thread communication, each
//! with one release/acquire pairing:
//!
//! - Each node's `next` pointer: the producer publishes a new node with a
//!   release store to the current tail's `next`, and the consumer observes
//!   it with an acquire load. This makes the element value written into the
//!   node visible to the consumer.
//! - The queue's `before_head` pointer: the consumer releases spent nodes by
//!   storing the new sentinel with release ordering, and the producer
//!   acquires it when refreshing its `cache_tail` snapshot. This makes the
//!   consumer's reads of the recycled slots happen-before the producer's
//!   next writes to them, so storage can be reused with no ABA hazard.
//!
//! Every other pointer access stays within a single thread's owned region
//! and is relaxed (or entirely non-atomic). Because the producer only
//! re-reads `before_head` when its cached snapshot runs out, the cost of the
//! acquire fence is amortized over an entire reclaimed span of nodes.
use crate::{
    loom::{
        cell::UnsafeCell,
        sync::{
            atomic::{AtomicPtr, Ordering::*},
            Arc,
        },
    },
    mem::{Alloc, AllocError, Heap},
    util::CachePadded,
};
use alloc::alloc::handle_alloc_error;
use core::{
    alloc::Layout,
    fmt,
    mem::{ManuallyDrop, MaybeUninit},
    ptr::{self, NonNull},
};

/// An unbounded lock-free single-producer, single-consumer FIFO queue that
/// recycles its nodes.
///
/// The queue itself is inert: it is constructed, optionally over a custom
/// [allocator](crate::mem::Alloc), and then [`split`](SpscQueue::split) into
/// a [`Producer`] and a [`Consumer`] half. All pushing happens through the
/// `Producer` and all popping through the `Consumer`; since neither handle
/// can be cloned, the single-producer single-consumer contract is enforced
/// by ownership rather than by runtime checks.
///
/// # Examples
///
/// ```
/// use reflux::SpscQueue;
///
/// let (mut tx, mut rx) = SpscQueue::<&'static str>::new().split();
///
/// tx.push("hello").unwrap();
/// tx.push("world").unwrap();
///
/// assert_eq!(rx.pop(), Some("hello"));
/// assert_eq!(rx.pop(), Some("world"));
/// assert_eq!(rx.pop(), None);
/// ```
///
/// # Progress guarantees
///
/// No operation on either half ever blocks, spins, or waits for the other
/// side. [`Consumer::pop`] is wait-free and never allocates;
/// [`Producer::push`] is wait-free when it can reuse a cached node, and
/// otherwise performs exactly one allocation through the queue's allocator.
///
/// # Element lifecycle
///
/// Node storage and element values have decoupled lifetimes: a node's
/// element slot is written when a value is pushed and vacated when that
/// value is popped, while the node itself keeps circulating between the
/// live chain and the free cache until the queue is dropped. Dropping the
/// queue (which happens once both halves are gone) drops any values that
/// were never popped, and frees every node.
pub struct SpscQueue<T, A: Alloc = Heap> {
    /// The sentinel node directly before the front of the queue. The first
    /// live value, if any, is in `before_head.next`.
    ///
    /// Written only by the consumer side; read by both sides.
    before_head: CachePadded<AtomicPtr<Node<T>>>,

    /// The pointers owned by the producer side, padded away from the
    /// consumer's stores to `before_head`.
    producer: CachePadded<ProducerCells<T>>,

    /// Source of node storage. Only the producer role and the destructor
    /// ever call into it.
    alloc: A,
}

/// The producing half of an [`SpscQueue`].
///
/// Exactly one `Producer` exists per queue. It may be sent to another
/// thread, but not cloned or shared; all of its operations take `&mut self`.
pub struct Producer<T, A: Alloc = Heap> {
    queue: Arc<SpscQueue<T, A>>,
}

/// The consuming half of an [`SpscQueue`].
///
/// Exactly one `Consumer` exists per queue. It may be sent to another
/// thread, but not cloned or shared; all of its mutating operations take
/// `&mut self`, which is also what bounds the lifetime of the borrow
/// returned by [`front`](Consumer::front).
///
/// A `Consumer` is an [`Iterator`] over the values currently reaching it;
/// iteration yields `None` once the queue is observed empty (which does not
/// mean the producer is done).
pub struct Consumer<T, A: Alloc = Heap> {
    queue: Arc<SpscQueue<T, A>>,
}

/// Error returned by [`Producer::push`] when the queue's allocator fails.
///
/// The value that could not be pushed is handed back inside the error; the
/// queue is left unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushError<T>(pub T);

struct Node<T> {
    /// The next node in the chain. Null only at the tail.
    next: AtomicPtr<Node<T>>,

    /// Storage for one element. Live only in nodes strictly after the
    /// sentinel; the sentinel itself and every cached node hold dead
    /// storage.
    data: UnsafeCell<MaybeUninit<T>>,
}

struct ProducerCells<T> {
    /// The last live node; its `next` is the append slot.
    tail: UnsafeCell<*mut Node<T>>,

    /// The front of the free-node cache (the oldest reclaimable node).
    cache_head: UnsafeCell<*mut Node<T>>,

    /// The producer's snapshot of where the cache ends. Refreshed from
    /// `before_head` whenever the cache runs out, so most node reuse needs
    /// no fence at all.
    cache_tail: UnsafeCell<*mut Node<T>>,
}

// === impl SpscQueue ===

impl<T> SpscQueue<T> {
    /// Returns a new queue over the global allocator.
    ///
    /// The queue starts with a single sentinel node; if the allocator cannot
    /// provide it, this call aborts via [`handle_alloc_error`], matching the
    /// standard library's convention for infallible constructors. Use
    /// [`try_new_in`](Self::try_new_in) to handle that failure instead.
    #[must_use]
    pub fn new() -> Self {
        match Self::try_new_in(Heap) {
            Ok(queue) => queue,
            Err(_) => handle_alloc_error(Node::<T>::LAYOUT),
        }
    }
}

impl<T, A: Alloc> SpscQueue<T, A> {
    /// Returns a new queue using the provided allocator, or an error if the
    /// sentinel node cannot be allocated.
    pub fn try_new_in(alloc: A) -> Result<Self, AllocError> {
        let sentinel = Self::allocate_node_in(&alloc)?.as_ptr();
        Ok(Self {
            before_head: CachePadded(AtomicPtr::new(sentinel)),
            producer: CachePadded(ProducerCells {
                tail: UnsafeCell::new(sentinel),
                cache_head: UnsafeCell::new(sentinel),
                cache_tail: UnsafeCell::new(sentinel),
            }),
            alloc,
        })
    }

    /// Splits the queue into its [`Producer`] and [`Consumer`] halves.
    ///
    /// The queue is shared between the two handles and dropped when the
    /// second of them goes away.
    #[must_use]
    pub fn split(self) -> (Producer<T, A>, Consumer<T, A>) {
        let queue = Arc::new(self);
        (
            Producer {
                queue: queue.clone(),
            },
            Consumer { queue },
        )
    }

    /// Returns `true` if the queue currently appears empty.
    ///
    /// This is an instantaneous observation: on the consumer thread it is
    /// authoritative (nothing else removes values), while on any other
    /// thread a concurrent push or pop may have already changed the answer.
    pub fn is_empty(&self) -> bool {
        self.head().is_none()
    }

    /// Returns `true` if the queue's atomic operations compile to lock-free
    /// instructions on this target.
    ///
    /// All synchronization goes through pointer-sized atomics, which are
    /// lock-free on every target that provides them at all.
    pub fn is_lock_free(&self) -> bool {
        cfg!(target_has_atomic = "ptr")
    }

    /// Borrows the queue's allocator.
    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    /// Returns the first node holding a live value, or `None` if the queue
    /// appears empty.
    ///
    /// The acquire load of the sentinel's `next` pointer synchronizes with
    /// the producer's release-store publication, making the element value
    /// inside the returned node visible.
    fn head(&self) -> Option<NonNull<Node<T>>> {
        let before_head = self.before_head.load(Relaxed);
        debug_assert!(!before_head.is_null(), "before_head is never null");
        // Safety: `before_head` always points at a node, and nodes stay
        // allocated for the queue's whole lifetime.
        NonNull::new(unsafe { (*before_head).next.load(Acquire) })
    }

    /// Acquires a node whose element slot has been initialized by `init`.
    ///
    /// The node is recycled from the free cache when possible. When the
    /// cached span `[cache_head, cache_tail)` is used up, `before_head` is
    /// re-read (acquire) to merge the reclaim region into the cache; that
    /// one fence is what licenses the relaxed `next` traversal of every
    /// node in the merged span. Only if the cache is genuinely empty does
    /// the allocator get involved.
    ///
    /// On success the returned node's `next` is null and its slot holds a
    /// live value. On allocation failure, and on unwind out of `init`, the
    /// queue is unchanged (a freshly allocated node is handed back to the
    /// allocator; a cached node is simply left in the cache, since the
    /// cache is only advanced after `init` returns).
    ///
    /// # Safety
    ///
    /// May only be called by the thread holding the producer role. `init`
    /// must write a valid `T` to the slot it is given, or diverge.
    unsafe fn make_node<F>(&self, init: F) -> Result<NonNull<Node<T>>, AllocError>
    where
        F: FnOnce(*mut T),
    {
        let x = self.producer.cache_head.with(|p| unsafe { *p });
        let mut cache_tail = self.producer.cache_tail.with(|p| unsafe { *p });
        if cache_tail == x {
            cache_tail = self.before_head.load(Acquire);
            self.producer.cache_tail.with_mut(|p| unsafe { *p = cache_tail });
            test_trace!("make_node: refilled cache snapshot");
        }

        let x = if cache_tail != x {
            // Recycle a cached node.
            let x = non_null(x);
            (*x.as_ptr()).data.with_mut(|slot| init(slot.cast()));
            // Remove the node from the cache. Its `next` was written by the
            // consumer before the release of `before_head` that put the
            // node in reach, so a relaxed load suffices here.
            let next = (*x.as_ptr()).next.load(Relaxed);
            self.producer.cache_head.with_mut(|p| unsafe { *p = next });
            x
        } else {
            // The cache is genuinely empty, so allocate a new node.
            test_trace!("make_node: cache empty, allocating");
            let x = self.allocate_node()?;
            let guard = DeallocGuard {
                queue: self,
                node: x,
            };
            (*x.as_ptr()).data.with_mut(|slot| init(slot.cast()));
            core::mem::forget(guard);
            x
        };

        (*x.as_ptr()).next.store(ptr::null_mut(), Relaxed);
        Ok(x)
    }

    /// Links the staged chain `first ..= last` after the current tail,
    /// making every value in it reachable by the consumer at once.
    ///
    /// # Safety
    ///
    /// May only be called by the thread holding the producer role. Every
    /// node in `first ..= last` must hold a live value, be linked to its
    /// successor with `last.next` null, and be unreachable from the queue
    /// until now.
    unsafe fn publish(&self, first: NonNull<Node<T>>, last: NonNull<Node<T>>) {
        let tail = self.producer.tail.with(|p| unsafe { *p });
        // The release store is the single synchronization point that makes
        // the staged values visible to the consumer.
        (*non_null(tail).as_ptr()).next.store(first.as_ptr(), Release);
        self.producer.tail.with_mut(|p| unsafe { *p = last.as_ptr() });
    }

    fn allocate_node(&self) -> Result<NonNull<Node<T>>, AllocError> {
        Self::allocate_node_in(&self.alloc)
    }

    fn allocate_node_in(alloc: &A) -> Result<NonNull<Node<T>>, AllocError> {
        let node = alloc.allocate(Node::<T>::LAYOUT)?.cast::<Node<T>>();
        // Only `next` is initialized; the element slot starts dead.
        unsafe {
            node.as_ptr().write(Node {
                next: AtomicPtr::new(ptr::null_mut()),
                data: UnsafeCell::new(MaybeUninit::uninit()),
            });
        }
        Ok(node)
    }

    /// Returns a node's storage to the allocator.
    ///
    /// # Safety
    ///
    /// The node must have been allocated by this queue's allocator, must
    /// not be reachable from any of the queue's pointers, and its element
    /// slot must not hold a live value (drop it first with
    /// [`Node::drop_data`] where needed).
    unsafe fn release_node(&self, node: NonNull<Node<T>>) {
        // Dropping the node tears down its own fields only; the element
        // slot is inert `MaybeUninit` storage.
        ptr::drop_in_place(node.as_ptr());
        self.alloc.deallocate(node.cast(), Node::<T>::LAYOUT);
    }
}

impl<T, A: Alloc> Drop for SpscQueue<T, A> {
    fn drop(&mut self) {
        // Both halves are gone by the time the queue drops, so every
        // pointer can be read plainly.
        unsafe {
            let mut curr = self.producer.cache_head.with_mut(|p| *p);
            // The first node with a live value. Everything before it (the
            // cache, the reclaim region, and the sentinel itself) holds
            // dead storage.
            let first_live = (*self.before_head.load(Relaxed)).next.load(Relaxed);

            // Free dead nodes without touching their element slots.
            while curr != first_live {
                let node = non_null(curr);
                curr = (*node.as_ptr()).next.load(Relaxed);
                self.release_node(node);
            }

            // Drop the values that were never popped, then free their nodes.
            while let Some(node) = NonNull::new(curr) {
                curr = (*node.as_ptr()).next.load(Relaxed);
                Node::drop_data(node);
                self.release_node(node);
            }
        }
    }
}

impl<T> Default for SpscQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, A: Alloc> fmt::Debug for SpscQueue<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpscQueue")
            .field(
                "before_head",
                &format_args!("{:p}", self.before_head.load(Acquire)),
            )
            // The remaining pointers are owned by the producer side; reading
            // them here could be racy.
            .field("producer", &format_args!("..."))
            .finish()
    }
}

unsafe impl<T: Send, A: Alloc + Send> Send for SpscQueue<T, A> {}

// Safety: the queue may be shared between the two role threads; all shared
// state is either atomic or reached only through the role that owns it.
unsafe impl<T: Send, A: Alloc + Sync> Sync for SpscQueue<T, A> {}

// === impl Producer ===

impl<T, A: Alloc> Producer<T, A> {
    /// Appends a value at the back of the queue.
    ///
    /// This never blocks. It allocates only when the free cache is empty,
    /// and on allocation failure it returns the value inside the error,
    /// leaving the queue unchanged.
    pub fn push(&mut self, value: T) -> Result<(), PushError<T>> {
        let mut value = Some(value);
        // Safety: `self` is the unique producer handle.
        let staged = unsafe {
            self.queue.make_node(|slot| match value.take() {
                // Safety: `make_node` hands the initializer a slot with no
                // live value in it.
                Some(value) => unsafe { slot.write(value) },
                None => unreachable!("a node initializer runs at most once"),
            })
        };
        match staged {
            Ok(node) => {
                // Safety: as above; the node holds the pushed value.
                unsafe { self.queue.publish(node, node) };
                Ok(())
            }
            // `make_node` can only fail before running the initializer, so
            // the value is still here to hand back.
            Err(AllocError) => match value.take() {
                Some(value) => Err(PushError(value)),
                None => unreachable!("an initialized push cannot have failed to allocate"),
            },
        }
    }

    /// Appends the result of `f`, constructing it directly in the node's
    /// element slot.
    ///
    /// If `f` panics, the queue is unchanged: a node taken from the cache
    /// stays in the cache, and a freshly allocated one is returned to the
    /// allocator.
    pub fn push_with<F>(&mut self, f: F) -> Result<(), AllocError>
    where
        F: FnOnce() -> T,
    {
        // Safety: `self` is the unique producer handle.
        unsafe {
            let node = self.queue.make_node(move |slot| {
                let value = f();
                // Safety: the slot holds no live value.
                unsafe { slot.write(value) }
            })?;
            self.queue.publish(node, node);
        }
        Ok(())
    }

    /// Appends every value yielded by `iter`, publishing the whole batch as
    /// one atomic step: the consumer observes either none of the values or
    /// all of them.
    ///
    /// An empty iterator is a no-op (no allocation, no publication). If an
    /// allocation fails partway, or the iterator panics, every staged value
    /// is dropped and its node's storage handed back to the allocator, and
    /// the queue is unchanged. Nodes drawn from the free cache while
    /// staging are released to the allocator rather than re-cached in that
    /// case, so a failed range push can shrink the cache; the queue's
    /// observable contents are unaffected.
    pub fn push_range<I>(&mut self, iter: I) -> Result<(), AllocError>
    where
        I: IntoIterator<Item = T>,
    {
        let mut iter = iter.into_iter();
        let Some(first) = iter.next() else {
            return Ok(());
        };

        let queue = &*self.queue;
        // Safety: `self` is the unique producer handle, and the staged
        // nodes are linked with relaxed stores only because the final
        // `publish` is the sole release point.
        unsafe {
            let head = queue.make_node(move |slot| unsafe { slot.write(first) })?;
            let mut staged = StagedChain {
                queue,
                head,
                last: head,
            };
            for value in iter {
                let node = queue.make_node(move |slot| unsafe { slot.write(value) })?;
                (*staged.last.as_ptr()).next.store(node.as_ptr(), Relaxed);
                staged.last = node;
            }
            let (head, last) = staged.into_parts();
            queue.publish(head, last);
        }
        Ok(())
    }

    /// Borrows the shared queue, e.g. for [`SpscQueue::is_empty`] or
    /// [`SpscQueue::allocator`].
    pub fn queue(&self) -> &SpscQueue<T, A> {
        &self.queue
    }
}

impl<T, A: Alloc> fmt::Debug for Producer<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { queue } = self;
        f.debug_struct("Producer").field("queue", queue).finish()
    }
}

// === impl Consumer ===

impl<T, A: Alloc> Consumer<T, A> {
    /// Removes and returns the value at the front of the queue, or `None`
    /// if the queue is empty.
    ///
    /// This never blocks and never allocates. Popping a value hands the
    /// node that used to be the sentinel back to the producer for reuse.
    pub fn pop(&mut self) -> Option<T> {
        let x = self.queue.head()?;
        // Safety: `self` is the unique consumer handle, and `head` only
        // returns nodes whose value the producer has published.
        let value = unsafe { Node::read_data(x) };
        // Make `x` the new sentinel; the release store transfers the old
        // sentinel (and our reads of `x`'s slot) to the producer.
        self.queue.before_head.store(x.as_ptr(), Release);
        Some(value)
    }

    /// Borrows the value at the front of the queue without removing it, or
    /// returns `None` if the queue is empty.
    ///
    /// The borrow ends at the next mutating call on this handle.
    pub fn front(&self) -> Option<&T> {
        let x = self.queue.head()?;
        // Safety: as in `pop`; the value stays in place until a mutating
        // call, which the returned borrow forbids for its duration.
        Some(unsafe { Node::data_ref(x) })
    }

    /// Mutably borrows the value at the front of the queue without removing
    /// it, or returns `None` if the queue is empty.
    pub fn front_mut(&mut self) -> Option<&mut T> {
        let x = self.queue.head()?;
        // Safety: as in `front`, with exclusivity from `&mut self`.
        Some(unsafe { Node::data_mut(x) })
    }

    /// Returns `true` if the queue currently appears empty.
    ///
    /// On this handle's thread the answer is authoritative until the next
    /// `pop`: values are only ever added, never taken away, by the other
    /// side.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drops every value currently visible in the queue.
    ///
    /// The drained nodes are handed to the producer in one release store at
    /// the end (also on unwind, should a destructor panic), rather than one
    /// at a time.
    pub fn clear(&mut self) {
        let queue = &*self.queue;
        let mut guard = DrainGuard {
            queue,
            last: non_null(queue.before_head.load(Relaxed)),
        };
        // Safety: `self` is the unique consumer handle; every node reached
        // through an acquire load of `next` holds a published live value.
        while let Some(x) = NonNull::new(unsafe { (*guard.last.as_ptr()).next.load(Acquire) }) {
            // Step past the node before dropping its value, so that a
            // panicking destructor still counts it as consumed.
            guard.last = x;
            unsafe { Node::drop_data(x) };
        }
    }

    /// Pops every value currently visible in the queue, passing each to `f`
    /// in FIFO order.
    ///
    /// Like [`clear`](Consumer::clear), the drained nodes are handed back
    /// with a single release store at the end, even if `f` panics partway
    /// through.
    pub fn consume_all<F>(&mut self, mut f: F)
    where
        F: FnMut(T),
    {
        let queue = &*self.queue;
        let mut guard = DrainGuard {
            queue,
            last: non_null(queue.before_head.load(Relaxed)),
        };
        // Safety: as in `clear`.
        while let Some(x) = NonNull::new(unsafe { (*guard.last.as_ptr()).next.load(Acquire) }) {
            let value = unsafe { Node::read_data(x) };
            guard.last = x;
            f(value);
        }
    }

    /// Borrows the shared queue, e.g. for [`SpscQueue::is_empty`] or
    /// [`SpscQueue::allocator`].
    pub fn queue(&self) -> &SpscQueue<T, A> {
        &self.queue
    }
}

impl<T, A: Alloc> Iterator for Consumer<T, A> {
    type Item = T;

    /// Equivalent to [`Consumer::pop`]: `None` means the queue is empty
    /// right now, not that the producer is finished.
    fn next(&mut self) -> Option<T> {
        self.pop()
    }
}

impl<T, A: Alloc> fmt::Debug for Consumer<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { queue } = self;
        f.debug_struct("Consumer").field("queue", queue).finish()
    }
}

// === impl PushError ===

impl<T> PushError<T> {
    /// Unwraps the value whose push failed.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to allocate a queue node")
    }
}

#[cfg(feature = "std")]
impl<T: fmt::Debug> std::error::Error for PushError<T> {}

// === impl Node ===

impl<T> Node<T> {
    const LAYOUT: Layout = Layout::new::<Node<T>>();

    /// Moves the value out of the node's element slot, leaving it dead.
    ///
    /// # Safety
    ///
    /// The slot must hold a live value, and the caller must have the right
    /// to consume it (it is the queue's front, observed by the consumer).
    unsafe fn read_data(this: NonNull<Self>) -> T {
        (*this.as_ptr())
            .data
            .with(|slot| unsafe { (*slot).assume_init_read() })
    }

    /// Drops the value in the node's element slot in place.
    ///
    /// # Safety
    ///
    /// The slot must hold a live value the caller is entitled to destroy.
    unsafe fn drop_data(this: NonNull<Self>) {
        (*this.as_ptr())
            .data
            .with_mut(|slot| unsafe { (*slot).assume_init_drop() })
    }

    /// # Safety
    ///
    /// The slot must hold a live value, and no exclusive access to it may
    /// exist for the returned borrow's duration.
    unsafe fn data_ref<'a>(this: NonNull<Self>) -> &'a T {
        (*this.as_ptr())
            .data
            .with(|slot| unsafe { &*(*slot).as_ptr() })
    }

    /// # Safety
    ///
    /// The slot must hold a live value, and no other access to it may exist
    /// for the returned borrow's duration.
    unsafe fn data_mut<'a>(this: NonNull<Self>) -> &'a mut T {
        (*this.as_ptr())
            .data
            .with_mut(|slot| unsafe { &mut *(*slot).as_mut_ptr() })
    }
}

// === guards ===

/// Returns a freshly allocated node to the allocator if the element write
/// into it unwinds.
struct DeallocGuard<'q, T, A: Alloc> {
    queue: &'q SpscQueue<T, A>,
    node: NonNull<Node<T>>,
}

impl<T, A: Alloc> Drop for DeallocGuard<'_, T, A> {
    fn drop(&mut self) {
        // Safety: the node was just allocated, is reachable from nowhere,
        // and its slot was never initialized.
        unsafe { self.queue.release_node(self.node) }
    }
}

/// A privately staged chain of nodes for [`Producer::push_range`]. Until
/// [`into_parts`](Self::into_parts) defuses it, dropping the guard destroys
/// every staged value and returns the nodes to the allocator.
struct StagedChain<'q, T, A: Alloc> {
    queue: &'q SpscQueue<T, A>,
    head: NonNull<Node<T>>,
    last: NonNull<Node<T>>,
}

impl<T, A: Alloc> StagedChain<'_, T, A> {
    fn into_parts(self) -> (NonNull<Node<T>>, NonNull<Node<T>>) {
        let this = ManuallyDrop::new(self);
        (this.head, this.last)
    }
}

impl<T, A: Alloc> Drop for StagedChain<'_, T, A> {
    fn drop(&mut self) {
        // Safety: every staged node holds a live value, the chain ends in
        // null, and none of it was ever published.
        let mut curr = Some(self.head);
        while let Some(node) = curr {
            unsafe {
                let next = (*node.as_ptr()).next.load(Relaxed);
                Node::drop_data(node);
                self.queue.release_node(node);
                curr = NonNull::new(next);
            }
        }
    }
}

/// Stores the final sentinel position with release ordering when a drain
/// finishes, or when it unwinds partway through.
struct DrainGuard<'q, T, A: Alloc> {
    queue: &'q SpscQueue<T, A>,
    last: NonNull<Node<T>>,
}

impl<T, A: Alloc> Drop for DrainGuard<'_, T, A> {
    fn drop(&mut self) {
        self.queue.before_head.store(self.last.as_ptr(), Release);
    }
}

/// Helper to construct a `NonNull<T>` from a raw pointer to `T`, with null
/// checks elided in release mode.
#[cfg(debug_assertions)]
#[track_caller]
#[inline(always)]
fn non_null<T>(ptr: *mut T) -> NonNull<T> {
    NonNull::new(ptr).expect(
        "/!\\ constructed a `NonNull` from a null pointer! /!\\ \n\
        in release mode, this would have called `NonNull::new_unchecked`, \
        violating the `NonNull` invariant! this is a bug in `reflux`.",
    )
}

/// Helper to construct a `NonNull<T>` from a raw pointer to `T`, with null
/// checks elided in release mode.
///
/// This is the release mode version.
#[cfg(not(debug_assertions))]
#[inline(always)]
fn non_null<T>(ptr: *mut T) -> NonNull<T> {
    // Safety: this is only called on pointers drawn from the queue's chain,
    // none of which are ever null.
    unsafe { NonNull::new_unchecked(ptr) }
}

#[cfg(all(loom, test))]
mod loom {
    use super::*;
    use crate::loom::{self, alloc::Track, thread};

    #[test]
    fn fifo_handoff() {
        const MSGS: i32 = 2;
        loom::model(|| {
            let (mut tx, mut rx) = SpscQueue::<Track<i32>>::new().split();

            let producer = thread::spawn(move || {
                for i in 0..MSGS {
                    tx.push(Track::new(i)).expect("heap allocation failed");
                    tracing::info!(i, "pushed");
                }
            });

            let mut next = 0;
            while next < MSGS {
                if let Some(val) = rx.pop() {
                    assert_eq!(val.into_inner(), next);
                    next += 1;
                } else {
                    thread::yield_now();
                }
            }

            producer.join().unwrap();
        });
    }

    #[test]
    fn recycles_nodes() {
        // Three pushes against an eager consumer drive the cache refill
        // path in the interleavings where pops land between pushes.
        const MSGS: i32 = 3;
        loom::model(|| {
            let (mut tx, mut rx) = SpscQueue::<Track<i32>>::new().split();

            let producer = thread::spawn(move || {
                for i in 0..MSGS {
                    tx.push(Track::new(i)).expect("heap allocation failed");
                }
            });

            let mut next = 0;
            while next < MSGS {
                if let Some(val) = rx.pop() {
                    assert_eq!(val.into_inner(), next);
                    next += 1;
                } else {
                    thread::yield_now();
                }
            }

            producer.join().unwrap();
        });
    }

    #[test]
    fn doesnt_leak_unconsumed() {
        // Drop the queue while some values were never popped; loom's
        // `Track` flags them if the destructor misses one.
        loom::model(|| {
            let (mut tx, mut rx) = SpscQueue::<Track<i32>>::new().split();

            let producer = thread::spawn(move || {
                tx.push(Track::new(1)).expect("heap allocation failed");
                tx.push(Track::new(2)).expect("heap allocation failed");
            });

            let popped = rx.pop();
            drop(rx);
            producer.join().unwrap();
            drop(popped);
        });
    }

    #[test]
    fn consume_all_drains() {
        const MSGS: i32 = 2;
        loom::model(|| {
            let (mut tx, mut rx) = SpscQueue::<Track<i32>>::new().split();

            let producer = thread::spawn(move || {
                for i in 0..MSGS {
                    tx.push(Track::new(i)).expect("heap allocation failed");
                }
            });

            let mut seen = Vec::new();
            while seen.len() < MSGS as usize {
                rx.consume_all(|val| seen.push(val.into_inner()));
                thread::yield_now();
            }
            assert_eq!(seen, vec![0, 1]);

            producer.join().unwrap();
        });
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::test_util::*;
    use super::*;

    use std::{
        panic::{catch_unwind, AssertUnwindSafe},
        thread,
    };

    #[test]
    fn push_and_pop() {
        let (mut tx, mut rx) = SpscQueue::<i32>::new().split();

        assert_eq!(rx.pop(), None);
        assert!(rx.is_empty());

        tx.push(123).unwrap();
        assert!(!rx.is_empty());
        assert_eq!(rx.pop(), Some(123));
        assert_eq!(rx.pop(), None);
        assert!(rx.is_empty());

        for i in 0..5 {
            tx.push(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(rx.pop(), Some(i));
        }
        assert_eq!(rx.pop(), None);
        assert!(rx.is_empty());
    }

    #[test]
    fn front_is_pure() {
        let (mut tx, mut rx) = SpscQueue::<i32>::new().split();

        assert_eq!(rx.front(), None);
        assert_eq!(rx.front(), None);

        tx.push(1).unwrap();
        tx.push(2).unwrap();

        // Peeking twice in a row observes the same value at the same place.
        let first = rx.front().map(|v| v as *const i32);
        let second = rx.front().map(|v| v as *const i32);
        assert_eq!(first, second);
        assert_eq!(rx.front(), Some(&1));

        *rx.front_mut().unwrap() = 10;
        assert_eq!(rx.pop(), Some(10));
        assert_eq!(rx.front(), Some(&2));
    }

    #[test]
    fn clear_is_idempotent() {
        let drops = DropCounter::new();
        let (mut tx, mut rx) = SpscQueue::new().split();

        for _ in 0..3 {
            tx.push(drops.value()).unwrap();
        }
        assert!(!rx.is_empty());

        rx.clear();
        assert!(rx.is_empty());
        assert_eq!(drops.count(), 3);

        // A second clear must be a no-op on queue state.
        rx.clear();
        assert!(rx.is_empty());
        assert_eq!(drops.count(), 3);
        assert_eq!(rx.pop(), None);

        // The queue is still fully usable afterwards.
        tx.push(drops.value()).unwrap();
        assert!(rx.pop().is_some());
        assert_eq!(drops.count(), 4);
    }

    #[test]
    fn consume_all_drains_in_order() {
        let (mut tx, mut rx) = SpscQueue::<i32>::new().split();

        for i in 0..5 {
            tx.push(i).unwrap();
        }

        let mut seen = Vec::new();
        rx.consume_all(|v| seen.push(v));
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert!(rx.is_empty());

        // Draining an empty queue invokes the closure zero times.
        rx.consume_all(|_| panic!("queue should be empty"));
    }

    #[test]
    fn consumer_is_an_iterator() {
        let (mut tx, mut rx) = SpscQueue::<i32>::new().split();

        for i in 0..3 {
            tx.push(i).unwrap();
        }

        assert_eq!((&mut rx).collect::<Vec<_>>(), vec![0, 1, 2]);

        // The iterator runs dry rather than waiting for the producer.
        tx.push(3).unwrap();
        assert_eq!(rx.next(), Some(3));
        assert_eq!(rx.next(), None);
    }

    #[test]
    fn push_range_basic() {
        let (mut tx, mut rx) = SpscQueue::<i32>::new().split();

        tx.push_range(0..5).unwrap();
        tx.push(5).unwrap();
        tx.push_range(6..8).unwrap();

        for i in 0..8 {
            assert_eq!(rx.pop(), Some(i));
        }
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn push_range_empty_is_noop() {
        let alloc = CountingAlloc::new();
        let (mut tx, rx) = SpscQueue::<i32, _>::try_new_in(alloc.clone())
            .unwrap()
            .split();

        let allocs_before = alloc.allocs();
        tx.push_range(std::iter::empty()).unwrap();
        assert_eq!(alloc.allocs(), allocs_before);
        assert!(rx.is_empty());
    }

    #[test]
    fn cache_recycles_nodes() {
        const N: usize = 1024;

        let alloc = CountingAlloc::new();
        let (mut tx, mut rx) = SpscQueue::<usize, _>::try_new_in(alloc.clone())
            .unwrap()
            .split();

        for i in 0..N {
            tx.push(i).unwrap();
        }
        for i in 0..N {
            assert_eq!(rx.pop(), Some(i));
        }

        // One node per element, plus the sentinel.
        let warm = alloc.allocs();
        assert_eq!(warm, N + 1);

        // With the cache warm, a second batch allocates nothing.
        for i in 0..N {
            tx.push(i).unwrap();
        }
        assert_eq!(alloc.allocs(), warm);

        for i in 0..N {
            assert_eq!(rx.pop(), Some(i));
        }
    }

    #[test]
    fn drop_destroys_live_elements_once() {
        let alloc = CountingAlloc::new();
        let drops = DropCounter::new();

        let (mut tx, rx) = SpscQueue::try_new_in(alloc.clone()).unwrap().split();
        for _ in 0..5 {
            tx.push(drops.value()).unwrap();
        }

        drop(tx);
        drop(rx);

        assert_eq!(drops.count(), 5);
        assert_eq!(alloc.allocs(), alloc.deallocs());
    }

    #[test]
    fn drop_skips_dead_cache_nodes() {
        let alloc = CountingAlloc::new();
        let drops = DropCounter::new();

        let (mut tx, mut rx) = SpscQueue::try_new_in(alloc.clone()).unwrap().split();
        for _ in 0..8 {
            tx.push(drops.value()).unwrap();
        }
        while rx.pop().is_some() {}

        // Everything was popped, so every drop already happened; tearing
        // down the queue (all nodes now cached) must not drop anything
        // again, but must still free every node.
        assert_eq!(drops.count(), 8);
        drop(tx);
        drop(rx);
        assert_eq!(drops.count(), 8);
        assert_eq!(alloc.allocs(), alloc.deallocs());
    }

    #[test]
    fn spsc_ordering_parallel() {
        const MSGS: usize = if_miri(100, 1_000_000);

        let (mut tx, mut rx) = SpscQueue::<usize>::new().split();

        let producer = thread::spawn(move || {
            for i in 0..MSGS {
                tx.push(i).unwrap();
            }
        });

        let mut next = 0;
        while next < MSGS {
            match rx.pop() {
                Some(v) => {
                    assert_eq!(v, next);
                    next += 1;
                }
                None => thread::yield_now(),
            }
        }

        producer.join().unwrap();
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn push_range_publishes_atomically() {
        const RANGE: usize = 100;

        let (mut tx, mut rx) = SpscQueue::<usize>::new().split();

        let producer = thread::spawn(move || {
            tx.push_range(0..RANGE).unwrap();
        });

        // Once any element of the range is visible, the rest must be
        // poppable immediately, without waiting for the producer again.
        let first = loop {
            match rx.pop() {
                Some(v) => break v,
                None => thread::yield_now(),
            }
        };
        assert_eq!(first, 0);
        for i in 1..RANGE {
            assert_eq!(rx.pop(), Some(i));
        }

        producer.join().unwrap();
    }

    #[test]
    fn push_range_unwinds_cleanly() {
        let alloc = CountingAlloc::new();
        let drops = DropCounter::new();

        let (mut tx, mut rx) = SpscQueue::try_new_in(alloc.clone()).unwrap().split();

        let mut produced = 0;
        let result = catch_unwind(AssertUnwindSafe(|| {
            tx.push_range(std::iter::from_fn(|| {
                if produced == 3 {
                    panic!("source iterator failed");
                }
                produced += 1;
                Some(drops.value())
            }))
        }));
        assert!(result.is_err());

        // The three staged values were destroyed, their nodes went back to
        // the allocator, and the queue is observably unchanged.
        assert!(rx.is_empty());
        assert_eq!(drops.count(), 3);
        assert_eq!(alloc.allocs(), 4); // sentinel + 3 staged
        assert_eq!(alloc.deallocs(), 3);

        // The queue keeps working.
        tx.push(drops.value()).unwrap();
        assert!(rx.pop().is_some());

        drop(tx);
        drop(rx);
        assert_eq!(alloc.allocs(), alloc.deallocs());
    }

    #[test]
    fn push_with_constructs_in_place() {
        let (mut tx, mut rx) = SpscQueue::<String>::new().split();

        tx.push_with(|| "abc".to_string()).unwrap();
        assert_eq!(rx.pop().as_deref(), Some("abc"));
    }

    #[test]
    fn push_with_unwinds_cleanly() {
        let alloc = CountingAlloc::new();
        let (mut tx, mut rx) = SpscQueue::<i32, _>::try_new_in(alloc.clone())
            .unwrap()
            .split();

        // Cold cache: the node is freshly allocated and must go back.
        let result = catch_unwind(AssertUnwindSafe(|| {
            tx.push_with(|| panic!("constructor failed")).ok();
        }));
        assert!(result.is_err());
        assert!(rx.is_empty());
        assert_eq!(alloc.allocs(), 2); // sentinel + the aborted node
        assert_eq!(alloc.deallocs(), 1);

        // Warm cache: the node never leaves the cache, so nothing is
        // allocated or freed, and the node is still reusable.
        tx.push(1).unwrap();
        assert_eq!(rx.pop(), Some(1));
        let warm = alloc.allocs();
        let result = catch_unwind(AssertUnwindSafe(|| {
            tx.push_with(|| panic!("constructor failed")).ok();
        }));
        assert!(result.is_err());
        assert!(rx.is_empty());
        assert_eq!(alloc.allocs(), warm);

        tx.push(2).unwrap();
        assert_eq!(alloc.allocs(), warm);
        assert_eq!(rx.pop(), Some(2));
    }

    #[test]
    fn push_reports_alloc_failure() {
        // Allow only the sentinel allocation.
        let (mut tx, mut rx) = SpscQueue::<i32, _>::try_new_in(FailingAlloc::new(1))
            .unwrap()
            .split();

        let err = tx.push(7).unwrap_err();
        assert_eq!(err, PushError(7));
        assert_eq!(err.into_inner(), 7);
        assert!(rx.is_empty());

        assert_eq!(tx.push_with(|| 8), Err(AllocError));
        assert_eq!(tx.push_range(0..3), Err(AllocError));
        assert!(rx.is_empty());
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn try_new_in_reports_alloc_failure() {
        assert!(SpscQueue::<i32, _>::try_new_in(FailingAlloc::new(0)).is_err());
    }

    #[test]
    fn queue_observers() {
        let queue = SpscQueue::<i32>::new();
        assert!(queue.is_empty());
        assert!(queue.is_lock_free());
        assert_eq!(queue.allocator(), &Heap);

        let (tx, rx) = queue.split();
        assert!(tx.queue().is_empty());
        assert!(rx.queue().is_lock_free());
    }

    #[test]
    fn send_sync_bounds() {
        crate::util::assert_send_sync::<SpscQueue<i32>>();
        crate::util::assert_send::<Producer<i32>>();
        crate::util::assert_send::<Consumer<i32>>();
    }

    mod fuzz {
        use super::*;
        use core::ops::Range;
        use proptest::collection::vec;
        use proptest::num::usize::ANY;
        use std::collections::VecDeque;

        #[derive(Debug, Clone, Copy)]
        enum Op {
            Push,
            PushRange(usize),
            Pop,
            Front,
            Clear,
        }

        /// Miri runs the fuzz cases much more slowly, so give it fewer,
        /// shorter ones.
        #[cfg(miri)]
        const FUZZ_RANGE: Range<usize> = 0..10;

        #[cfg(not(miri))]
        const FUZZ_RANGE: Range<usize> = 0..100;

        proptest::proptest! {
            #[test]
            fn matches_vecdeque(ops in vec(ANY, FUZZ_RANGE)) {
                let ops = ops
                    .iter()
                    .map(|i| match i % 6 {
                        0 | 1 => Op::Push,
                        2 => Op::Pop,
                        3 => Op::PushRange(i / 6 % 5),
                        4 => Op::Front,
                        5 if (i / 6) % 4 == 0 => Op::Clear,
                        5 => Op::Pop,
                        _ => unreachable!(),
                    })
                    .collect::<Vec<_>>();

                let _trace = trace_init();
                tracing::info!(?ops);
                run_fuzz(ops);
            }
        }

        fn run_fuzz(ops: Vec<Op>) {
            let (mut tx, mut rx) = SpscQueue::<usize>::new().split();
            let mut reference = VecDeque::new();
            let mut counter = 0..;

            for (i, op) in ops.iter().enumerate() {
                let _span = tracing::info_span!("op", ?i, ?op).entered();
                match *op {
                    Op::Push => {
                        let v = counter.next().unwrap();
                        tx.push(v).unwrap();
                        reference.push_back(v);
                    }
                    Op::PushRange(n) => {
                        let vals = counter.by_ref().take(n).collect::<Vec<_>>();
                        reference.extend(vals.iter().copied());
                        tx.push_range(vals).unwrap();
                    }
                    Op::Pop => assert_eq!(rx.pop(), reference.pop_front()),
                    Op::Front => assert_eq!(rx.front().copied(), reference.front().copied()),
                    Op::Clear => {
                        rx.clear();
                        reference.clear();
                        assert!(rx.is_empty());
                    }
                }
            }

            // Whatever is left must drain out in reference order.
            let mut drained = Vec::new();
            rx.consume_all(|v| drained.push(v));
            assert_eq!(drained, reference.into_iter().collect::<Vec<_>>());
        }
    }
}
