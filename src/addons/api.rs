//! Addon API traits.
//!
//! Defines the interface addons implement and the marker trait for
//! capability types published in the shared contract.

use std::any::Any;
use std::sync::Arc;

use super::context::AddonContext;
use super::error::HookError;

/// Interface every addon entry point implements.
///
/// Hooks run synchronously on the orchestration thread. Returning an
/// error or panicking is treated as a fault of this addon only.
pub trait Addon: Send {
    /// Identity reported by the running instance.
    fn id(&self) -> &str;

    /// Version reported by the running instance.
    fn version(&self) -> &str;

    /// Called once after instantiation.
    fn on_load(&mut self, _ctx: &AddonContext) -> Result<(), HookError> {
        Ok(())
    }

    /// Called once all required dependencies are enabled.
    fn on_enable(&mut self, _ctx: &AddonContext) -> Result<(), HookError> {
        Ok(())
    }

    /// Called at session shutdown, in reverse enable order.
    fn on_disable(&mut self, _ctx: &AddonContext) -> Result<(), HookError> {
        Ok(())
    }
}

/// A capability type published in the shared contract.
///
/// Usually implemented on a trait object, e.g.
/// `impl Capability for dyn Storage { const SYMBOL: &'static str = "engine.api.Storage"; }`.
pub trait Capability: Send + Sync + 'static {
    /// Fully qualified symbol of the capability type.
    const SYMBOL: &'static str;
}

/// Type-erased capability instance.
pub type ErasedInstance = Arc<dyn Any + Send + Sync>;

/// Erases a capability instance for storage.
pub(crate) fn erase<T: Capability + ?Sized>(instance: Arc<T>) -> ErasedInstance {
    Arc::new(instance)
}

/// Recovers a typed instance, or `None` if the stored type differs.
pub(crate) fn restore<T: Capability + ?Sized>(erased: &ErasedInstance) -> Option<Arc<T>> {
    erased.downcast_ref::<Arc<T>>().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    impl Capability for dyn Greeter {
        const SYMBOL: &'static str = "engine.api.Greeter";
    }

    struct English;

    impl Greeter for English {
        fn greet(&self) -> String {
            "hello".to_string()
        }
    }

    trait Other: Send + Sync {}

    impl Capability for dyn Other {
        const SYMBOL: &'static str = "engine.api.Greeter";
    }

    #[test]
    fn test_erase_and_restore_trait_object() {
        let instance: Arc<dyn Greeter> = Arc::new(English);
        let erased = erase(instance);
        let back = restore::<dyn Greeter>(&erased);
        assert_eq!(back.map(|g| g.greet()), Some("hello".to_string()));
    }

    #[test]
    fn test_restore_rejects_same_symbol_different_type() {
        let instance: Arc<dyn Greeter> = Arc::new(English);
        let erased = erase(instance);
        assert!(restore::<dyn Other>(&erased).is_none());
    }
}
