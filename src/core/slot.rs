use crate::core::errors::{FlowError, Result};
use std::fmt;
use std::sync::Mutex;

enum SlotState<T> {
    Empty,
    Ready(T),
    Failed(String),
    Taken,
}

impl<T> SlotState<T> {
    fn label(&self) -> &'static str {
        match self {
            SlotState::Empty => "empty",
            SlotState::Ready(_) => "ready",
            SlotState::Failed(_) => "failed",
            SlotState::Taken => "taken",
        }
    }
}

/// Single-assignment cell bridging one producer step and one consumer step.
///
/// The producer writes once with [`put`](Self::put) or [`fail`](Self::fail)
/// before arriving at the join that guards the consumer; the consumer
/// takes the value once after that join releases.
pub struct ResultSlot<T> {
    name: String,
    state: Mutex<SlotState<T>>,
}

impl<T> fmt::Debug for ResultSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self
            .state
            .lock()
            .map(|state| state.label())
            .unwrap_or("poisoned");
        f.debug_struct("ResultSlot")
            .field("name", &self.name)
            .field("state", &state)
            .finish()
    }
}

impl<T> ResultSlot<T> {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(SlotState::Empty),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a value or a failure has been written
    pub fn is_filled(&self) -> bool {
        self.with_state(|state| !matches!(state, SlotState::Empty))
    }

    /// Publish the producer's value
    pub fn put(&self, value: T) -> Result<()> {
        self.write(SlotState::Ready(value))
    }

    /// Record that the producer failed
    pub fn fail(&self, error: &FlowError) -> Result<()> {
        self.write(SlotState::Failed(error.to_string()))
    }

    /// Take the published value, leaving the slot spent
    pub fn take(&self) -> Result<T> {
        let mut state = self.lock();
        match std::mem::replace(&mut *state, SlotState::Taken) {
            SlotState::Ready(value) => Ok(value),
            SlotState::Failed(message) => {
                *state = SlotState::Failed(message.clone());
                Err(FlowError::upstream_failed(&self.name, message))
            }
            SlotState::Empty => {
                *state = SlotState::Empty;
                Err(FlowError::slot_misuse(&self.name, "read before written"))
            }
            SlotState::Taken => Err(FlowError::slot_misuse(&self.name, "already taken")),
        }
    }

    fn write(&self, next: SlotState<T>) -> Result<()> {
        let mut state = self.lock();
        if !matches!(*state, SlotState::Empty) {
            return Err(FlowError::slot_misuse(
                &self.name,
                format!("written while {}", state.label()),
            ));
        }
        *state = next;
        Ok(())
    }

    fn with_state<R>(&self, f: impl FnOnce(&SlotState<T>) -> R) -> R {
        f(&*self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SlotState<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_put_then_take() {
        let slot = ResultSlot::new("credit");
        assert!(!slot.is_filled());
        slot.put(710u32).unwrap();
        assert!(slot.is_filled());
        assert_eq!(slot.take().unwrap(), 710);
    }

    #[test]
    fn test_take_before_put() {
        let slot: ResultSlot<u32> = ResultSlot::new("credit");
        let err = slot.take().unwrap_err();
        assert!(matches!(err, FlowError::SlotMisuse { .. }));

        // The failed read does not spend the slot
        slot.put(1).unwrap();
        assert_eq!(slot.take().unwrap(), 1);
    }

    #[test]
    fn test_single_assignment() {
        let slot = ResultSlot::new("health");
        slot.put(1u32).unwrap();
        assert!(matches!(
            slot.put(2),
            Err(FlowError::SlotMisuse { .. })
        ));
        assert_eq!(slot.take().unwrap(), 1);
        assert!(matches!(slot.take(), Err(FlowError::SlotMisuse { .. })));
    }

    #[test]
    fn test_failed_slot() {
        let slot: ResultSlot<u32> = ResultSlot::new("assets");
        let cause = FlowError::fetch("fetch_assets", anyhow!("timeout upstream"));
        slot.fail(&cause).unwrap();

        match slot.take() {
            Err(FlowError::UpstreamFailed { slot, message }) => {
                assert_eq!(slot, "assets");
                assert!(message.contains("timeout upstream"));
            }
            other => panic!("Expected upstream failure, got {other:?}"),
        }
    }
}
