//! Connection tags correlate the reciprocal connection request of an XRC
//! peer with the local endpoint that originated the connection.
//!
//! A tag is `(sequence << CONN_TAG_INDEX_BITS) | key`. Keys index a slot
//! table and are recycled through a free list; the sequence changes on
//! every allocation so a late request carrying an old tag no longer
//! matches a recycled slot.
use fabric_api::Handle;

use crate::{Error, Result};

pub const CONN_TAG_INDEX_BITS: u32 = 18;
pub const CONN_TAG_INDEX_MASK: u32 = (1 << CONN_TAG_INDEX_BITS) - 1;
pub const CONN_TAG_INVALID: u32 = u32::MAX;
pub const CONN_TAG_MAX_KEYS: usize = 1 << CONN_TAG_INDEX_BITS;

const SEQ_MASK: u32 = u32::MAX >> CONN_TAG_INDEX_BITS;

#[derive(Debug, Clone, Copy)]
struct Slot {
    tag: u32,
    ep: Handle,
}

/// Not synchronized. It lives inside the event queue lock.
#[derive(Debug)]
pub struct ConnTagRegistry {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    capacity: usize,
    seq: u32,
    outstanding: usize,
}

impl Default for ConnTagRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnTagRegistry {
    pub fn new() -> Self {
        Self::with_capacity(CONN_TAG_MAX_KEYS)
    }

    /// At most [`CONN_TAG_MAX_KEYS`] keys can be outstanding.
    pub fn with_capacity(capacity: usize) -> Self {
        ConnTagRegistry {
            slots: Vec::new(),
            free: Vec::new(),
            capacity: capacity.min(CONN_TAG_MAX_KEYS),
            seq: 0,
            outstanding: 0,
        }
    }

    pub fn allocate(&mut self, ep: Handle) -> Result<u32> {
        let key = match self.free.pop() {
            Some(key) => key,
            None if self.slots.len() < self.capacity => {
                self.slots.push(None);
                (self.slots.len() - 1) as u32
            }
            None => return Err(Error::ResourceExhausted("connection tags")),
        };

        let tag = loop {
            self.seq = self.seq.wrapping_add(1) & SEQ_MASK;
            let tag = (self.seq << CONN_TAG_INDEX_BITS) | key;
            if tag != CONN_TAG_INVALID {
                break tag;
            }
        };
        self.slots[key as usize] = Some(Slot { tag, ep });
        self.outstanding += 1;
        Ok(tag)
    }

    pub fn lookup(&self, tag: u32) -> Option<Handle> {
        if tag == CONN_TAG_INVALID {
            return None;
        }
        self.slots
            .get((tag & CONN_TAG_INDEX_MASK) as usize)?
            .filter(|slot| slot.tag == tag)
            .map(|slot| slot.ep)
    }

    /// Returns the endpoint the tag belonged to, `None` for a stale tag.
    pub fn release(&mut self, tag: u32) -> Option<Handle> {
        if tag == CONN_TAG_INVALID {
            return None;
        }
        let key = tag & CONN_TAG_INDEX_MASK;
        let slot = self.slots.get_mut(key as usize)?;
        match slot {
            Some(s) if s.tag == tag => {
                let ep = s.ep;
                *slot = None;
                self.free.push(key);
                self.outstanding -= 1;
                Some(ep)
            }
            _ => None,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.outstanding
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.outstanding == 0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    #[test]
    fn allocate_lookup_release() {
        let mut reg = ConnTagRegistry::new();
        let t1 = reg.allocate(Handle(1)).unwrap();
        let t2 = reg.allocate(Handle(2)).unwrap();
        assert_ne!(t1, t2);
        assert_eq!(reg.lookup(t1), Some(Handle(1)));
        assert_eq!(reg.lookup(t2), Some(Handle(2)));
        assert_eq!(reg.release(t1), Some(Handle(1)));
        assert_eq!(reg.lookup(t1), None);
        assert_eq!(reg.release(t1), None);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn stale_tag_does_not_match_recycled_key() {
        let mut reg = ConnTagRegistry::with_capacity(1);
        let old = reg.allocate(Handle(1)).unwrap();
        reg.release(old);
        let new = reg.allocate(Handle(2)).unwrap();
        assert_eq!(old & CONN_TAG_INDEX_MASK, new & CONN_TAG_INDEX_MASK);
        assert_ne!(old, new);
        assert_eq!(reg.lookup(old), None);
        assert_eq!(reg.release(old), None);
        assert_eq!(reg.lookup(new), Some(Handle(2)));
    }

    #[test]
    fn exhaustion() {
        let mut reg = ConnTagRegistry::with_capacity(4);
        let tags: Vec<_> = (0..4).map(|i| reg.allocate(Handle(i)).unwrap()).collect();
        assert!(matches!(
            reg.allocate(Handle(9)),
            Err(Error::ResourceExhausted(_))
        ));
        reg.release(tags[2]);
        assert!(reg.allocate(Handle(9)).is_ok());
    }

    #[test]
    fn invalid_tag_never_issued() {
        let mut reg = ConnTagRegistry::new();
        reg.seq = SEQ_MASK - 1;
        // force the last key so the next sequence would produce all ones
        reg.slots.resize(CONN_TAG_MAX_KEYS - 1, None);
        let tag = reg.allocate(Handle(1)).unwrap();
        assert_eq!(tag & CONN_TAG_INDEX_MASK, CONN_TAG_INDEX_MASK);
        assert_ne!(tag, CONN_TAG_INVALID);
        assert_eq!(reg.lookup(CONN_TAG_INVALID), None);
    }

    #[test]
    fn outstanding_tags_are_unique() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut reg = ConnTagRegistry::with_capacity(64);
        let mut live: Vec<u32> = Vec::new();
        for i in 0..10_000u64 {
            if live.is_empty() || (live.len() < 64 && rng.gen_bool(0.55)) {
                let tag = reg.allocate(Handle(i)).unwrap();
                assert!(!live.contains(&tag));
                live.push(tag);
            } else {
                let idx = rng.gen_range(0..live.len());
                let tag = live.swap_remove(idx);
                assert!(reg.release(tag).is_some());
            }
            let distinct: HashSet<_> = live.iter().collect();
            assert_eq!(distinct.len(), live.len());
            assert_eq!(reg.len(), live.len());
        }
    }
}
