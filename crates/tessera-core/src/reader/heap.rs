//! Binary min-heap ordered by an external comparator.
//!
//! Heap entries are small indices into resident tiles; the comparator needs
//! to look at tile data, which `std::collections::BinaryHeap` cannot borrow.
//! Passing the comparator per call keeps the tiles free for mutation
//! between heap operations.

#[derive(Debug, Clone)]
pub(crate) struct MinHeap<T> {
    items: Vec<T>,
}

impl<T> Default for MinHeap<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T> MinHeap<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.first()
    }

    pub fn push(&mut self, item: T, less: impl Fn(&T, &T) -> bool) {
        self.items.push(item);
        let mut child = self.items.len() - 1;
        while child > 0 {
            let parent = (child - 1) / 2;
            if !less(&self.items[child], &self.items[parent]) {
                break;
            }
            self.items.swap(child, parent);
            child = parent;
        }
    }

    pub fn pop(&mut self, less: impl Fn(&T, &T) -> bool) -> Option<T> {
        if self.items.is_empty() {
            return None;
        }
        let last = self.items.len() - 1;
        self.items.swap(0, last);
        let top = self.items.pop();

        let len = self.items.len();
        let mut parent = 0;
        loop {
            let left = 2 * parent + 1;
            let right = left + 1;
            let mut smallest = parent;
            if left < len && less(&self.items[left], &self.items[smallest]) {
                smallest = left;
            }
            if right < len && less(&self.items[right], &self.items[smallest]) {
                smallest = right;
            }
            if smallest == parent {
                break;
            }
            self.items.swap(parent, smallest);
            parent = smallest;
        }
        top
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pops_in_order() {
        let less = |a: &i32, b: &i32| a < b;
        let mut heap = MinHeap::with_capacity(8);
        for v in [5, 1, 8, 3, 9, 2, 7] {
            heap.push(v, less);
        }
        assert_eq!(heap.len(), 7);
        assert_eq!(heap.peek(), Some(&1));
        let mut out = Vec::new();
        while let Some(v) = heap.pop(less) {
            out.push(v);
        }
        assert_eq!(out, vec![1, 2, 3, 5, 7, 8, 9]);
        assert!(heap.is_empty());
    }

    #[test]
    fn test_external_data_comparator() {
        let keys = ["d", "a", "c", "b"];
        let less = |a: &usize, b: &usize| keys[*a] < keys[*b];
        let mut heap = MinHeap::default();
        for i in 0..keys.len() {
            heap.push(i, less);
        }
        assert_eq!(heap.pop(less), Some(1));
        assert_eq!(heap.pop(less), Some(3));
    }
}
