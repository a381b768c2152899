//! Lock-free multi-producer single-consumer queue.
//!
//! Stub-node linked queue: producers swap themselves onto the tail and
//! then link their predecessor, so `push` is wait-free. The single
//! consumer follows `next` pointers from the head. Between a producer's
//! tail swap and its link store the consumer can observe the queue as
//! transiently empty even though an element is on the way; callers using
//! a pending counter (the dispatch loop does) simply retry.
//!
//! The release store on the predecessor's `next` pointer paired with the
//! consumer's acquire load is what publishes the node's contents.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: Option<T>,
}

impl<T> Node<T> {
    fn boxed(value: Option<T>) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value,
        }))
    }
}

pub(crate) struct MpscQueue<T> {
    /// Consumer side; always points at the current stub node whose
    /// successor holds the next value.
    head: AtomicPtr<Node<T>>,
    /// Producer side; last enqueued node.
    tail: AtomicPtr<Node<T>>,
}

unsafe impl<T: Send> Send for MpscQueue<T> {}
unsafe impl<T: Send> Sync for MpscQueue<T> {}

impl<T> MpscQueue<T> {
    pub fn new() -> Self {
        let stub = Node::boxed(None);
        MpscQueue {
            head: AtomicPtr::new(stub),
            tail: AtomicPtr::new(stub),
        }
    }

    /// Enqueue `value`. Wait-free; callable from any number of threads.
    pub fn push(&self, value: T) {
        let node = Node::boxed(Some(value));
        let prev = self.tail.swap(node, Ordering::AcqRel);
        // Publishes the node; until this store lands the consumer sees a
        // null `next` and treats the queue as empty.
        unsafe { (*prev).next.store(node, Ordering::Release) };
    }

    /// Dequeue one value. Single consumer only. `None` means empty or a
    /// producer is mid-enqueue.
    pub fn pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let next = unsafe { (*head).next.load(Ordering::Acquire) };
        if next.is_null() {
            return None;
        }
        let value = unsafe { (*next).value.take() };
        self.head.store(next, Ordering::Relaxed);
        // The old head (previous stub) is now unreachable.
        drop(unsafe { Box::from_raw(head) });
        value
    }

    /// Dequeue one value and report whether the queue is drained.
    /// Used by the shutdown sequencer once all producers have stopped.
    pub fn pop_and_check_end(&self) -> (Option<T>, bool) {
        let value = self.pop();
        let head = self.head.load(Ordering::Relaxed);
        let empty = head == self.tail.load(Ordering::Acquire);
        (value, empty)
    }
}

impl<T> Drop for MpscQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
        let head = self.head.load(Ordering::Relaxed);
        drop(unsafe { Box::from_raw(head) });
    }
}
