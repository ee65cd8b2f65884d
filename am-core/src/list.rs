//! Singly-linked intrusive list, used by the timer wheel's per-domain
//! `armed`/`pending` lists and by the size-class allocator's free lists.
//!
//! The original core links list nodes through an embedded `struct am_slist`
//! member and walks raw pointers so an `arm()` call from an ISR never
//! allocates. A slab of slots indexed by a small integer gives the same
//! "no allocation on link/unlink" property without unsafe pointer chasing,
//! at the cost of a fixed slab capacity chosen by the caller.

/// Index into a [`SList`]'s slab. `NONE` marks "not linked" / end of list.
pub type Link = u32;
const NONE: Link = u32::MAX;

struct Node<T> {
    value: Option<T>,
    next: Link,
}

/// A singly-linked list over a fixed-capacity slab of slots.
///
/// Supports the one traversal pattern the timer wheel needs: iterate from
/// head to tail, optionally unlinking the current node, with `O(1)`
/// push_back and append-whole-list.
pub struct SList<T> {
    nodes: Vec<Node<T>>,
    head: Link,
    tail: Link,
    free: Link,
}

impl<T> SList<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        SList {
            nodes: Vec::with_capacity(capacity),
            head: NONE,
            tail: NONE,
            free: NONE,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == NONE
    }

    fn alloc_node(&mut self, value: T) -> Link {
        if self.free != NONE {
            let idx = self.free;
            let node = &mut self.nodes[idx as usize];
            self.free = node.next;
            node.value = Some(value);
            node.next = NONE;
            idx
        } else {
            let idx = self.nodes.len() as Link;
            self.nodes.push(Node { value: Some(value), next: NONE });
            idx
        }
    }

    /// Links `value` onto the tail. Returns the link so the caller can test
    /// membership (`is_linked`) later without a search.
    pub fn push_back(&mut self, value: T) -> Link {
        let idx = self.alloc_node(value);
        if self.tail == NONE {
            self.head = idx;
        } else {
            self.nodes[self.tail as usize].next = idx;
        }
        self.tail = idx;
        idx
    }

    pub fn is_linked(&self, link: Link) -> bool {
        link != NONE && (self.nodes[link as usize].value.is_some())
    }

    /// Moves every node of `other` onto the tail of `self`, leaving `other`
    /// empty. `O(1)`.
    pub fn append(&mut self, other: &mut SList<T>) {
        if other.head == NONE {
            return;
        }
        // Re-host other's nodes into self's slab so links stay valid.
        let offset = self.nodes.len() as Link;
        for node in other.nodes.drain(..) {
            self.nodes.push(node);
        }
        let remap = |l: Link| if l == NONE { NONE } else { l + offset };
        for node in &mut self.nodes[(offset as usize)..] {
            node.next = remap(node.next);
        }
        let other_head = remap(other.head);
        let other_tail = remap(other.tail);
        if self.tail == NONE {
            self.head = other_head;
        } else {
            self.nodes[self.tail as usize].next = other_head;
        }
        self.tail = other_tail;
        other.head = NONE;
        other.tail = NONE;
        other.free = NONE;
    }

    /// Iterate head to tail. The closure receives `&mut T` and decides
    /// whether to unlink the current node (returning `true` unlinks it).
    pub fn retain_and_visit<F: FnMut(&mut T) -> bool>(&mut self, mut f: F) {
        let mut prev: Link = NONE;
        let mut cur = self.head;
        while cur != NONE {
            let next = self.nodes[cur as usize].next;
            let unlink = {
                let value = self.nodes[cur as usize].value.as_mut().expect("linked node has value");
                f(value)
            };
            if unlink {
                if prev == NONE {
                    self.head = next;
                } else {
                    self.nodes[prev as usize].next = next;
                }
                if self.tail == cur {
                    self.tail = prev;
                }
                self.nodes[cur as usize].value = None;
                self.nodes[cur as usize].next = self.free;
                self.free = cur;
            } else {
                prev = cur;
            }
            cur = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_back_preserves_order() {
        let mut l = SList::with_capacity(4);
        l.push_back(1);
        l.push_back(2);
        l.push_back(3);
        let mut seen = Vec::new();
        l.retain_and_visit(|v| {
            seen.push(*v);
            false
        });
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn append_then_unlink_mid_iteration() {
        let mut armed = SList::with_capacity(4);
        let mut pending = SList::with_capacity(4);
        armed.push_back(10);
        pending.push_back(20);
        pending.push_back(30);
        armed.append(&mut pending);
        assert!(pending.is_empty());

        let mut seen = Vec::new();
        armed.retain_and_visit(|v| {
            seen.push(*v);
            *v == 20
        });
        assert_eq!(seen, vec![10, 20, 30]);

        let mut seen2 = Vec::new();
        armed.retain_and_visit(|v| {
            seen2.push(*v);
            false
        });
        assert_eq!(seen2, vec![10, 30]);
    }
}
