use std::collections::VecDeque;

/// Cyclic position counter over one split.
///
/// Positions are logical: under `FlipPolicy::Alternate` a split of `n` samples has `2n`
/// positions and position `p` serves sample `p / 2`.
///
/// Positions that were claimed but never delivered can be handed back with
/// [`give_back`](Self::give_back); they are served again, in the order returned, before the
/// cursor advances.
#[derive(Debug, Clone)]
pub struct SplitCursor {
    len: usize,
    next: usize,
    cycles: u64,
    returned: VecDeque<usize>,
}

impl SplitCursor {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            next: 0,
            cycles: 0,
            returned: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Completed passes over the split.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Positions handed back and not yet served again.
    pub fn returned(&self) -> usize {
        self.returned.len()
    }

    /// Queues undelivered positions to be served again. Out-of-range positions are ignored.
    pub fn give_back(&mut self, positions: impl IntoIterator<Item = usize>) {
        let len = self.len;
        self.returned
            .extend(positions.into_iter().filter(|&p| p < len));
    }

    /// Reserves `n` positions: handed-back ones first, then consecutive ones from the cursor,
    /// wrapping to 0 after the last one.
    ///
    /// Callers hold the cursor's lock for the whole claim so a batch never interleaves with
    /// another.
    pub fn claim(&mut self, n: usize) -> Vec<usize> {
        if self.len == 0 {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            if let Some(p) = self.returned.pop_front() {
                out.push(p);
                continue;
            }
            out.push(self.next);
            self.next += 1;
            if self.next == self.len {
                self.next = 0;
                self.cycles += 1;
            }
        }
        out
    }
}
