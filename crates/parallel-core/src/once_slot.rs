use std::sync::OnceLock;

use thiserror::Error;

/// A single-assignment cell: written at most once, read any number of
/// times afterward.
///
/// Used to hold a connection's [`ConnectionState`](crate) after
/// `init_connection_state` runs — the runtime treats a second write as a
/// programming bug, not a recoverable error, since the write-once
/// invariant is supposed to be enforced entirely by the runtime's own
/// bootstrap sequence rather than by caller discipline.
#[derive(Debug)]
pub struct OnceSlot<T> {
    inner: OnceLock<T>,
}

/// Returned when a slot that was already written is written again.
#[derive(Debug, Error)]
#[error("slot already set")]
pub struct AlreadySetError;

impl<T> OnceSlot<T> {
    pub fn new() -> Self {
        Self {
            inner: OnceLock::new(),
        }
    }

    /// Writes the slot's value. Fails if the slot was already written.
    pub fn set(&self, value: T) -> Result<(), AlreadySetError> {
        self.inner.set(value).map_err(|_| AlreadySetError)
    }

    /// Reads the slot's value, if it has been written.
    pub fn get(&self) -> Option<&T> {
        self.inner.get()
    }

    pub fn is_set(&self) -> bool {
        self.inner.get().is_some()
    }
}

impl<T> Default for OnceSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_write_succeeds_and_is_visible() {
        let slot = OnceSlot::new();
        slot.set(42).expect("first write should succeed");
        assert_eq!(slot.get(), Some(&42));
    }

    #[test]
    fn second_write_fails() {
        let slot = OnceSlot::new();
        slot.set("a").unwrap();
        let err = slot.set("b").unwrap_err();
        assert_eq!(err.to_string(), "slot already set");
        assert_eq!(slot.get(), Some(&"a"));
    }

    #[test]
    fn unset_slot_reads_as_none() {
        let slot: OnceSlot<u32> = OnceSlot::new();
        assert_eq!(slot.get(), None);
    }
}
