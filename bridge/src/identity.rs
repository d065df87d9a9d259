use object::Cell;

const MIN_CAPACITY: usize = 8;

/// Open-addressed map keyed by the raw bits of a [`Cell`].
///
/// Two cells are the same key iff their words are identical: a heap
/// reference is keyed by address, an immediate by its encoding. Guest
/// level equality never enters into it.
///
/// Linear probing over a power-of-two capacity, growth by doubling once the
/// load would pass 2/3, backward-shift deletion (no tombstones).
pub struct IdentityTable<V> {
    slots: Box<[Option<Entry<V>>]>,
    len: usize,
    growths: u64,
}

struct Entry<V> {
    key: Cell,
    value: V,
}

#[inline(always)]
fn hash(key: Cell, shift: u32) -> usize {
    // fibonacci hashing; the high bits of the product are the well mixed ones
    (key.raw().wrapping_mul(0x9E37_79B9_7F4A_7C15) >> shift) as usize
}

fn empty_slots<V>(capacity: usize) -> Box<[Option<Entry<V>>]> {
    (0..capacity).map(|_| None).collect()
}

impl<V> IdentityTable<V> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_CAPACITY).next_power_of_two();
        Self {
            slots: empty_slots(capacity),
            len: 0,
            growths: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// How many times the table has doubled.
    pub fn growths(&self) -> u64 {
        self.growths
    }

    #[inline(always)]
    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    #[inline(always)]
    fn home(&self, key: Cell) -> usize {
        hash(key, 64 - self.slots.len().trailing_zeros())
    }

    /// Slot holding `key`, or the empty slot that ends its probe run.
    #[inline]
    fn probe(&self, key: Cell) -> Result<usize, usize> {
        let mask = self.mask();
        let mut index = self.home(key);
        loop {
            match &self.slots[index] {
                Some(entry) if entry.key == key => return Ok(index),
                Some(_) => index = (index + 1) & mask,
                None => return Err(index),
            }
        }
    }

    #[inline]
    pub fn get(&self, key: Cell) -> Option<&V> {
        let index = self.probe(key).ok()?;
        self.slots[index].as_ref().map(|entry| &entry.value)
    }

    #[inline]
    pub fn get_mut(&mut self, key: Cell) -> Option<&mut V> {
        let index = self.probe(key).ok()?;
        self.slots[index].as_mut().map(|entry| &mut entry.value)
    }

    #[inline]
    pub fn contains_key(&self, key: Cell) -> bool {
        self.probe(key).is_ok()
    }

    /// Insert or replace. Returns the previous value for `key`.
    pub fn insert(&mut self, key: Cell, value: V) -> Option<V> {
        if let Ok(index) = self.probe(key) {
            let entry = self.slots[index].as_mut()?;
            return Some(core::mem::replace(&mut entry.value, value));
        }
        if (self.len + 1) * 3 > self.capacity() * 2 {
            self.grow();
        }
        let Err(index) = self.probe(key) else {
            unreachable!("key appeared during growth")
        };
        self.slots[index] = Some(Entry { key, value });
        self.len += 1;
        None
    }

    pub fn remove(&mut self, key: Cell) -> Option<V> {
        let mut hole = self.probe(key).ok()?;
        let removed = self.slots[hole].take()?;
        self.len -= 1;

        // pull later members of the probe run back over the hole so lookups
        // never stop early
        let mask = self.mask();
        let mut index = (hole + 1) & mask;
        while let Some(entry) = &self.slots[index] {
            let home = self.home(entry.key);
            if hole.wrapping_sub(home) & mask < index.wrapping_sub(home) & mask {
                self.slots[hole] = self.slots[index].take();
                hole = index;
            }
            index = (index + 1) & mask;
        }
        Some(removed.value)
    }

    fn grow(&mut self) {
        let capacity = self.capacity() * 2;
        log::debug!(
            "identity table: growing {} -> {} slots ({} live)",
            self.capacity(),
            capacity,
            self.len
        );
        self.growths += 1;
        self.rebuild(capacity, |key, _| key);
    }

    fn rebuild(&mut self, capacity: usize, mut key_of: impl FnMut(Cell, &V) -> Cell) {
        let old = core::mem::replace(&mut self.slots, empty_slots(capacity));
        for Entry { key, value } in old.into_vec().into_iter().flatten() {
            let key = key_of(key, &value);
            match self.probe(key) {
                Err(index) => self.slots[index] = Some(Entry { key, value }),
                Ok(_) => panic!("identity table: two entries rekeyed to {key:?}"),
            }
        }
    }

    /// Replace every key with `key_of(old_key, value)`.
    ///
    /// Used after a moving collection, when the authoritative identity of an
    /// entry lives in its value. New keys must be pairwise distinct.
    pub fn rekey(&mut self, key_of: impl FnMut(Cell, &V) -> Cell) {
        self.rebuild(self.capacity(), key_of);
    }

    pub fn iter(&self) -> impl Iterator<Item = (Cell, &V)> {
        self.slots
            .iter()
            .flatten()
            .map(|entry| (entry.key, &entry.value))
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.slots.iter_mut().flatten().map(|entry| &mut entry.value)
    }
}
