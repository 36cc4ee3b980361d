use std::{
    iter,
    marker::PhantomData,
    ptr::{self, NonNull},
};

use crate::{header::Header, Pointer};

/// Linked list node. See also [`Header<T>`].
pub struct Node<T> {
    pub next: Pointer<Self>,
    pub prev: Pointer<Self>,
    pub data: T,
}

/// Intrusive doubly linked list whose nodes live inside the memory they
/// describe. The heap cannot allocate memory for its own bookkeeping (it IS
/// the heap), so every operation that creates a node receives the address
/// where the node has to be written.
///
/// Nodes are kept in address order: inserting always happens right after an
/// existing node, and the only way to create the first node is [`Self::append`]
/// on an empty list.
#[derive(Clone, Copy)]
pub(crate) struct LinkedList<T> {
    pub head: Pointer<Node<T>>,
    pub tail: Pointer<Node<T>>,
    pub len: usize,
    marker: PhantomData<T>,
}

impl<T> LinkedList<T> {
    /// Creates an empty linked list.
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            marker: PhantomData,
        }
    }

    /// Appends a new node holding `data` at the end of the list. The node is
    /// written to `address`.
    ///
    /// # Safety
    ///
    /// `address` must be valid for writes of a [`Node<T>`] and suitably
    /// aligned.
    pub unsafe fn append(&mut self, data: T, address: NonNull<u8>) -> NonNull<Header<T>> {
        let node = address.cast::<Node<T>>();

        ptr::write(
            node.as_ptr(),
            Node {
                prev: self.tail,
                next: None,
                data,
            },
        );

        if let Some(mut tail) = self.tail {
            tail.as_mut().next = Some(node);
        } else {
            self.head = Some(node);
        }

        self.tail = Some(node);
        self.len += 1;

        node
    }

    /// Inserts a new node with the given `data` right after `node`. The new
    /// node is written to `address`.
    ///
    /// # Safety
    ///
    /// `node` must belong to this list and `address` must be valid for writes
    /// of a [`Node<T>`].
    pub unsafe fn insert_after(
        &mut self,
        mut node: NonNull<Node<T>>,
        data: T,
        address: NonNull<u8>,
    ) -> NonNull<Header<T>> {
        let new = address.cast::<Node<T>>();
        let next = node.as_ref().next;

        ptr::write(
            new.as_ptr(),
            Node {
                prev: Some(node),
                next,
                data,
            },
        );

        node.as_mut().next = Some(new);

        match next {
            Some(mut next) => next.as_mut().prev = Some(new),
            None => self.tail = Some(new),
        }

        self.len += 1;

        new
    }

    /// Removes `node` from the linked list. The memory of the node is left
    /// untouched, it simply becomes unreachable.
    ///
    /// # Safety
    ///
    /// `node` must belong to this list.
    pub unsafe fn remove(&mut self, node: NonNull<Node<T>>) {
        let prev = node.as_ref().prev;
        let next = node.as_ref().next;

        match prev {
            Some(mut prev) => prev.as_mut().next = next,
            None => self.head = next,
        }

        match next {
            Some(mut next) => next.as_mut().prev = prev,
            None => self.tail = prev,
        }

        self.len -= 1;
    }

    /// First node in the list.
    #[inline]
    pub fn first(&self) -> Pointer<Node<T>> {
        self.head
    }

    /// Number of nodes in the list.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterates over the nodes front to back by following `next` links.
    ///
    /// # Safety
    ///
    /// Every node reachable from `head` must be valid for the lifetime of the
    /// iterator and the list must not be modified while iterating.
    pub unsafe fn iter(&self) -> impl Iterator<Item = NonNull<Node<T>>> {
        let mut current = self.head;

        iter::from_fn(move || {
            let node = current?;
            current = unsafe { node.as_ref().next };
            Some(node)
        })
    }
}
