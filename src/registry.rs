//! Handle-addressed ownership of interface contexts.
//!
//! A device exposing several CCID interfaces keeps their per-interface state
//! here instead of in a process-wide table; each context is reached through
//! the [`Handle`] returned at registration.

/// Opaque reference to a registered context.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Handle(u8);

pub struct Registry<T, const N: usize> {
    contexts: heapless::Vec<T, N>,
}

impl<T, const N: usize> Registry<T, N> {
    pub fn new() -> Self {
        Self {
            contexts: heapless::Vec::new(),
        }
    }

    /// Takes ownership of `context`; hands it back if all slots are taken.
    pub fn register(&mut self, context: T) -> Result<Handle, T> {
        let handle = Handle(self.contexts.len() as u8);
        self.contexts.push(context)?;
        Ok(handle)
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.contexts.get(handle.0 as usize)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.contexts.get_mut(handle.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

impl<T, const N: usize> Default for Registry<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_reference_their_own_context() {
        let mut registry: Registry<u32, 2> = Registry::new();
        let first = registry.register(17).unwrap();
        let second = registry.register(23).unwrap();

        assert_ne!(first, second);
        assert_eq!(registry.get(first), Some(&17));
        assert_eq!(registry.get(second), Some(&23));

        *registry.get_mut(first).unwrap() = 19;
        assert_eq!(registry.get(first), Some(&19));
    }

    #[test]
    fn full_registry_returns_the_context() {
        let mut registry: Registry<u32, 1> = Registry::new();
        registry.register(1).unwrap();
        assert_eq!(registry.register(2), Err(2));
        assert_eq!(registry.len(), 1);
    }
}
