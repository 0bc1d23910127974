use std::collections::VecDeque;

/// Holds remote candidates that arrived before the remote description was
/// accepted.
///
/// Drained exactly once, in arrival order. After the drain the queue is
/// closed: [`push`](Self::push) hands the item back so the caller applies it
/// directly, which keeps drained items from ever being replayed.
#[derive(Debug)]
pub struct CandidateQueue<T> {
    items: VecDeque<T>,
    drained: bool,
}

impl<T> Default for CandidateQueue<T> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
            drained: false,
        }
    }
}

impl<T> CandidateQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `item`, or return it when the queue was already drained.
    pub fn push(&mut self, item: T) -> Result<(), T> {
        if self.drained {
            return Err(item);
        }
        self.items.push_back(item);
        Ok(())
    }

    /// Take everything queued so far and close the queue.
    pub fn drain(&mut self) -> Vec<T> {
        self.drained = true;
        self.items.drain(..).collect()
    }

    /// Forget queued items and reopen for a new session.
    pub fn reset(&mut self) {
        self.items.clear();
        self.drained = false;
    }

    pub fn is_drained(&self) -> bool {
        self.drained
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
