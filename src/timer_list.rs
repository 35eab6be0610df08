/// Absolute deadline, whole seconds.
pub type Timestamp = i64;

/// Run once when a timer expires, with the list's context and the timer's data.
pub type ExpireFn<D, C> = fn(&mut C, D);

/// One connection's deadline, as handed to [`TimerList::insert`] and given
/// back by [`TimerList::remove`].
pub struct Timer<D, C> {
    pub expire: Timestamp,
    pub callback: ExpireFn<D, C>,
    pub data: D,
}

impl<D, C> Timer<D, C> {
    pub fn new(expire: Timestamp, callback: ExpireFn<D, C>, data: D) -> Self {
        Self {
            expire,
            callback,
            data,
        }
    }
}

/// Stable reference to a tracked timer.
///
/// The generation changes every time a slot is freed, so a handle kept past
/// removal or firing resolves to nothing instead of to whichever timer
/// reuses the slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    slot: usize,
    generation: u32,
}

struct Payload<D, C> {
    callback: ExpireFn<D, C>,
    data: D,
}

struct Slot<D, C> {
    expire: Timestamp,
    prev: Option<usize>,
    next: Option<usize>,
    generation: u32,
    payload: Option<Payload<D, C>>,
}

/// Timers sorted ascending by `expire`, linked both ways through an arena.
///
/// The list owns every timer it tracks. Timers with equal deadlines keep
/// their insertion order. Insertion and repositioning scan from the head,
/// firing only ever looks at the head.
pub struct TimerList<D, C> {
    slots: Vec<Slot<D, C>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<D, C> Default for TimerList<D, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D, C> TimerList<D, C> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: vec![],
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, handle: TimerHandle) -> bool {
        self.resolve(handle).is_some()
    }

    pub fn expire(&self, handle: TimerHandle) -> Option<Timestamp> {
        self.resolve(handle).map(|idx| self.slots[idx].expire)
    }

    /// Mutable access to a deadline. The list is not re-sorted until
    /// [`reposition`](Self::reposition) is called for the same handle.
    pub fn expire_mut(&mut self, handle: TimerHandle) -> Option<&mut Timestamp> {
        let idx = self.resolve(handle)?;
        Some(&mut self.slots[idx].expire)
    }

    pub fn data(&self, handle: TimerHandle) -> Option<&D> {
        let idx = self.resolve(handle)?;
        self.slots[idx].payload.as_ref().map(|p| &p.data)
    }

    pub fn data_mut(&mut self, handle: TimerHandle) -> Option<&mut D> {
        let idx = self.resolve(handle)?;
        self.slots[idx].payload.as_mut().map(|p| &mut p.data)
    }

    /// Earliest deadline, i.e. the head's.
    pub fn next_expire(&self) -> Option<Timestamp> {
        self.head.map(|idx| self.slots[idx].expire)
    }

    /// Tracked timers from head to tail.
    pub fn iter(&self) -> Iter<'_, D, C> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    /// Starts tracking `timer` and returns the handle used to reschedule or
    /// cancel it.
    ///
    /// The timer is placed before the first tracked timer with a strictly
    /// later deadline, so a new timer lands behind every existing one with
    /// the same deadline. Vacant slots left by removed or fired timers are
    /// reused; their old handles stay stale.
    ///
    /// ### Example
    /// ```rust
    /// use idle_clock::{Timer, TimerList};
    ///
    /// fn close(closed: &mut Vec<u32>, id: u32) {
    ///     closed.push(id);
    /// }
    ///
    /// let mut timers: TimerList<u32, Vec<u32>> = TimerList::new();
    /// timers.insert(Timer::new(5, close, 1));
    /// let early = timers.insert(Timer::new(2, close, 2));
    ///
    /// assert_eq!(timers.next_expire(), Some(2));
    /// assert_eq!(timers.data(early), Some(&2));
    /// ```
    pub fn insert(&mut self, timer: Timer<D, C>) -> TimerHandle {
        let payload = Payload {
            callback: timer.callback,
            data: timer.data,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                let slot = &mut self.slots[idx];
                slot.expire = timer.expire;
                slot.payload = Some(payload);
                idx
            }
            None => {
                self.slots.push(Slot {
                    expire: timer.expire,
                    prev: None,
                    next: None,
                    generation: 0,
                    payload: Some(payload),
                });
                self.slots.len() - 1
            }
        };
        self.len += 1;
        self.link_sorted(idx);
        self.handle_of(idx)
    }

    /// Restores ordering after the timer's deadline changed.
    ///
    /// A deadline still below its successor's (and not below its
    /// predecessor's) is already in place. Otherwise the timer is unlinked and
    /// inserted again from the head. Returns `false` for a stale handle.
    pub fn reposition(&mut self, handle: TimerHandle) -> bool {
        let Some(idx) = self.resolve(handle) else {
            return false;
        };
        let expire = self.slots[idx].expire;
        let before_next = self.slots[idx]
            .next
            .is_none_or(|next| expire < self.slots[next].expire);
        let after_prev = self.slots[idx]
            .prev
            .is_none_or(|prev| self.slots[prev].expire <= expire);
        if before_next && after_prev {
            return true;
        }

        self.unlink(idx);
        self.link_sorted(idx);
        true
    }

    /// Writes a new deadline and repositions in one step.
    pub fn set_expire(&mut self, handle: TimerHandle, expire: Timestamp) -> bool {
        match self.expire_mut(handle) {
            Some(slot_expire) => *slot_expire = expire,
            None => return false,
        }
        self.reposition(handle)
    }

    /// Stops tracking the timer and hands it back without firing it.
    pub fn remove(&mut self, handle: TimerHandle) -> Option<Timer<D, C>> {
        let idx = self.resolve(handle)?;
        self.unlink(idx);
        self.release(idx)
    }

    /// Fires, in deadline order, every timer whose deadline is at or before
    /// `now`, then drops it. Returns how many fired.
    ///
    /// Only the head is ever inspected: the first deadline past `now` stops
    /// the walk. Each callback receives `ctx` and the timer's data by value,
    /// and the timer is already untracked when it runs.
    ///
    /// ### Example
    /// ```rust
    /// use idle_clock::{Timer, TimerList};
    ///
    /// fn close(closed: &mut Vec<u32>, id: u32) {
    ///     closed.push(id);
    /// }
    ///
    /// let mut timers: TimerList<u32, Vec<u32>> = TimerList::new();
    /// for (id, expire) in [(1, 2), (2, 5), (3, 8)] {
    ///     timers.insert(Timer::new(expire, close, id));
    /// }
    ///
    /// let mut closed = vec![];
    /// assert_eq!(timers.advance(6, &mut closed), 2);
    /// assert_eq!(closed, vec![1, 2]);
    /// assert_eq!(timers.next_expire(), Some(8));
    /// ```
    pub fn advance(&mut self, now: Timestamp, ctx: &mut C) -> usize {
        let mut fired = 0;
        while let Some(head) = self.head {
            if self.slots[head].expire > now {
                break;
            }
            self.unlink(head);
            if let Some(timer) = self.release(head) {
                (timer.callback)(ctx, timer.data);
                fired += 1;
            }
        }
        fired
    }

    /// Drops every timer without firing it.
    pub fn clear(&mut self) {
        while let Some(head) = self.head {
            self.unlink(head);
            self.release(head);
        }
    }

    fn handle_of(&self, idx: usize) -> TimerHandle {
        TimerHandle {
            slot: idx,
            generation: self.slots[idx].generation,
        }
    }

    fn resolve(&self, handle: TimerHandle) -> Option<usize> {
        let idx = handle.slot;
        let slot = self.slots.get(idx)?;
        (slot.generation == handle.generation && slot.payload.is_some()).then_some(idx)
    }

    /// Splices an unlinked slot before the first node with a strictly greater
    /// deadline, or at the tail.
    fn link_sorted(&mut self, idx: usize) {
        let expire = self.slots[idx].expire;

        let Some(head) = self.head else {
            self.slots[idx].prev = None;
            self.slots[idx].next = None;
            self.head = Some(idx);
            self.tail = Some(idx);
            return;
        };

        if expire < self.slots[head].expire {
            self.slots[idx].prev = None;
            self.slots[idx].next = Some(head);
            self.slots[head].prev = Some(idx);
            self.head = Some(idx);
            return;
        }

        let mut prev = head;
        let mut cursor = self.slots[head].next;
        while let Some(cur) = cursor {
            if expire < self.slots[cur].expire {
                self.slots[prev].next = Some(idx);
                self.slots[idx].prev = Some(prev);
                self.slots[idx].next = Some(cur);
                self.slots[cur].prev = Some(idx);
                return;
            }
            prev = cur;
            cursor = self.slots[cur].next;
        }

        self.slots[prev].next = Some(idx);
        self.slots[idx].prev = Some(prev);
        self.slots[idx].next = None;
        self.tail = Some(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let prev = self.slots[idx].prev.take();
        let next = self.slots[idx].next.take();
        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }
    }

    fn release(&mut self, idx: usize) -> Option<Timer<D, C>> {
        let slot = &mut self.slots[idx];
        let payload = slot.payload.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(idx);
        self.len -= 1;
        Some(Timer {
            expire: slot.expire,
            callback: payload.callback,
            data: payload.data,
        })
    }

    /// Panics unless the chain is sorted, doubly linked and matches `len`.
    #[cfg(test)]
    pub(crate) fn assert_linked(&self) {
        let mut count = 0;
        let mut prev: Option<usize> = None;
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let slot = &self.slots[idx];
            assert!(slot.payload.is_some(), "vacant slot {} is linked", idx);
            assert_eq!(slot.prev, prev, "broken back link at slot {}", idx);
            if let Some(p) = prev {
                assert!(self.slots[p].expire <= slot.expire, "unsorted at slot {}", idx);
            }
            count += 1;
            prev = cursor;
            cursor = slot.next;
        }
        assert_eq!(self.tail, prev);
        assert_eq!(count, self.len);
    }
}

pub struct Iter<'a, D, C> {
    list: &'a TimerList<D, C>,
    cursor: Option<usize>,
}

impl<'a, D, C> Iterator for Iter<'a, D, C> {
    type Item = (TimerHandle, Timestamp, &'a D);

    fn next(&mut self) -> Option<Self::Item> {
        let list = self.list;
        let idx = self.cursor?;
        let slot = &list.slots[idx];
        self.cursor = slot.next;
        let data = &slot.payload.as_ref()?.data;
        Some((list.handle_of(idx), slot.expire, data))
    }
}
