use std::sync::atomic::{AtomicI32, Ordering};

static GLOBAL: SequenceGenerator = SequenceGenerator::new();

/// Takes the next id from the process-wide generator shared by every client.
pub fn next_sequence_id() -> i32 {
    GLOBAL.next()
}

/// Lock-free source of request ids.
///
/// Ids start at 1 and increase by one per call. After `i32::MAX` they wrap back to 1, so
/// neither 0 nor the "no answer" id -1 is ever handed out.
#[derive(Debug)]
pub struct SequenceGenerator {
    next: AtomicI32,
}

impl SequenceGenerator {
    pub const fn new() -> Self {
        Self::starting_at(1)
    }

    const fn starting_at(first: i32) -> Self {
        SequenceGenerator {
            next: AtomicI32::new(first),
        }
    }

    pub fn next(&self) -> i32 {
        let previous = self.next.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
            Some(if id == i32::MAX { 1 } else { id + 1 })
        });

        // The closure never returns `None`
        match previous {
            Ok(id) | Err(id) => id,
        }
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}
