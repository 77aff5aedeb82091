use std::collections::BinaryHeap;

/// Trait for elements that have a priority and can be used in a [MinHeap].
pub(crate) trait HasPriority {
    type Priority: Ord + std::fmt::Debug;

    /// Return the priority of a given item.
    fn priority(&self) -> Self::Priority;
}

struct PriorityElement<T: HasPriority> {
    /// The priority associated with the item when it was added to the heap.
    priority: T::Priority,
    element: T,
}

impl<T: HasPriority> PartialEq for PriorityElement<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority
    }
}

impl<T: HasPriority> Eq for PriorityElement<T> {}

impl<T: HasPriority> PartialOrd for PriorityElement<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: HasPriority> Ord for PriorityElement<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.priority.cmp(&self.priority)
    }
}

/// A min-heap over the heads of the inputs of an ordered synchronizer.
pub(crate) struct MinHeap<T: HasPriority>(BinaryHeap<PriorityElement<T>>);

impl<T: HasPriority> Default for MinHeap<T> {
    fn default() -> Self {
        Self(BinaryHeap::new())
    }
}

impl<T: HasPriority> MinHeap<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self(BinaryHeap::with_capacity(capacity))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, element: T) {
        let priority = element.priority();
        self.0.push(PriorityElement { priority, element })
    }

    pub fn pop(&mut self) -> Option<T> {
        self.0.pop().map(|t| t.element)
    }

    pub fn clear(&mut self) {
        self.0.clear()
    }
}
