//! Task state capability.
//!
//! A task that wants to survive preemption implements [`StateCapability`]:
//! the scheduler never inspects the state itself, it only moves the opaque
//! bytes produced by [`StateCapability::serialize`] and feeds them back
//! through [`StateCapability::deserialize`] before the task runs again.  The
//! encoding is owned end-to-end by the implementor; the scheduler imposes no
//! schema.
//!
//! Stateless tasks use the [`NoState`] sentinel, which serialises to zero
//! bytes and accepts any input.

use std::any::Any;

/// Checkpoint/restore contract honoured by a task's state.
///
/// `serialize` must be safe to call at any time the owning task is suspended;
/// `deserialize` mutates the receiver in place.
pub trait StateCapability: Send + 'static {
    /// Produce the opaque checkpoint bytes for this state.
    fn serialize(&self) -> Vec<u8>;

    /// Restore this state from checkpoint bytes.
    fn deserialize(&mut self, bytes: &[u8]) -> anyhow::Result<()>;

    /// Upcast for [`TaskContext::state_mut`](crate::TaskContext::state_mut)
    /// downcasting.  Implementations return `self`.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl dyn StateCapability {
    /// Downcast a state object to its concrete type.
    pub fn downcast_mut<T: StateCapability>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }
}

/// Stateless sentinel substituted when a task declares no initial state.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoState;

impl StateCapability for NoState {
    fn serialize(&self) -> Vec<u8> {
        Vec::new()
    }

    fn deserialize(&mut self, _bytes: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_state_serialises_to_zero_bytes() {
        let state = NoState;
        assert!(state.serialize().is_empty());
    }

    #[test]
    fn no_state_accepts_any_input() {
        let mut state = NoState;
        state.deserialize(b"anything at all").unwrap();
        state.deserialize(&[]).unwrap();
    }

    #[test]
    fn downcast_recovers_concrete_type() {
        struct Counter(u32);
        impl StateCapability for Counter {
            fn serialize(&self) -> Vec<u8> {
                self.0.to_le_bytes().to_vec()
            }
            fn deserialize(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
                let raw: [u8; 4] = bytes.try_into()?;
                self.0 = u32::from_le_bytes(raw);
                Ok(())
            }
            fn as_any_mut(&mut self) -> &mut dyn Any {
                self
            }
        }

        let mut boxed: Box<dyn StateCapability> = Box::new(Counter(7));
        let counter = boxed.downcast_mut::<Counter>().unwrap();
        counter.0 = 9;
        assert_eq!(boxed.serialize(), 9u32.to_le_bytes().to_vec());
        assert!(boxed.downcast_mut::<NoState>().is_none());
    }
}
