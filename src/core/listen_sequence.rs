/// Identifies a listen target in the target cache.
pub type TargetId = i32;

/// Identifies a mutation batch in the mutation queue.
pub type BatchId = i32;

/// Monotonic sequence number stamped on every transaction; the LRU garbage
/// collector uses it as the recency signal.
pub type ListenSequenceNumber = i64;

/// Sequence number attached to entries that have never been touched.
pub const INVALID_SEQUENCE_NUMBER: ListenSequenceNumber = -1;

/// A monotonically increasing sequence number source.
#[derive(Debug)]
pub struct ListenSequence {
    previous: ListenSequenceNumber,
}

impl ListenSequence {
    pub fn new(starting_after: ListenSequenceNumber) -> Self {
        Self {
            previous: starting_after,
        }
    }

    pub fn next(&mut self) -> ListenSequenceNumber {
        self.previous += 1;
        self.previous
    }
}

/// Generates target ids. The target cache hands out even ids; odd ids are
/// reserved for the sync layer, so both sides can mint ids without
/// coordinating.
#[derive(Debug)]
pub struct TargetIdGenerator {
    last_id: TargetId,
}

const RESERVED_BITS: i32 = 1;

impl TargetIdGenerator {
    pub fn for_target_cache(last_id: TargetId) -> Self {
        Self::new(last_id, 0)
    }

    pub fn for_sync_engine() -> Self {
        Self::new(0, 1)
    }

    fn new(last_id: TargetId, generator_id: TargetId) -> Self {
        let mut generator = Self { last_id };
        generator.seek(generator_id);
        generator
    }

    fn seek(&mut self, generator_id: TargetId) {
        // Advance to the next id carrying our parity bit.
        let mask = (1 << RESERVED_BITS) - 1;
        if self.last_id & mask != generator_id {
            self.last_id = (self.last_id & !mask) | generator_id;
            if self.last_id <= 0 {
                self.last_id = generator_id;
            }
        }
    }

    pub fn next(&mut self) -> TargetId {
        self.last_id += 1 << RESERVED_BITS;
        self.last_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_increments() {
        let mut sequence = ListenSequence::new(5);
        assert_eq!(sequence.next(), 6);
        assert_eq!(sequence.next(), 7);
    }

    #[test]
    fn target_cache_ids_are_even() {
        let mut generator = TargetIdGenerator::for_target_cache(0);
        assert_eq!(generator.next(), 2);
        assert_eq!(generator.next(), 4);
    }

    #[test]
    fn sync_engine_ids_are_odd() {
        let mut generator = TargetIdGenerator::for_sync_engine();
        assert_eq!(generator.next(), 3);
        assert_eq!(generator.next(), 5);
    }

    #[test]
    fn resumes_from_persisted_id() {
        let mut generator = TargetIdGenerator::for_target_cache(6);
        assert_eq!(generator.next(), 8);
    }
}
