//! Operator registry: resolves operator names to loadable units.
//!
//! The registry is a process-wide, read-mostly mapping populated with a
//! statically enumerated list at startup. Registration after freezing is
//! rejected so there are no ordering hazards between concurrent lookups
//! and late registrations.

use std::collections::HashMap;
use std::sync::OnceLock;

use crate::error::RegistryError;

use super::builtin;
use super::{Operator, OperatorKind, OperatorOptions};

/// Factory signature for instantiating an operator from its options bag.
///
/// The error string is a construction-failure reason; `instantiate` wraps
/// it into `OperatorLoadError`.
pub type OperatorFactory = fn(&OperatorOptions) -> Result<Box<dyn Operator>, String>;

/// Static descriptor of a registered operator: its name, kind tag, and
/// the factory standing in for the source's module-path + class-name
/// locator.
#[derive(Clone)]
pub struct OperatorDescriptor {
    /// Registered operator name.
    pub name: &'static str,
    /// Declared kind tag.
    pub kind: OperatorKind,
    /// Constructor.
    pub factory: OperatorFactory,
}

impl std::fmt::Debug for OperatorDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Process-wide mapping from operator name to loader descriptor.
pub struct OperatorRegistry {
    entries: HashMap<&'static str, OperatorDescriptor>,
    frozen: bool,
}

impl OperatorRegistry {
    /// Creates an empty, unfrozen registry (tests and embedders).
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            frozen: false,
        }
    }

    /// Creates the registry populated with the built-in operator set and
    /// frozen against further registration.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for descriptor in builtin::descriptors() {
            // The enumerated list carries no duplicates.
            registry
                .register(descriptor)
                .expect("built-in operator list must be conflict-free");
        }
        registry.freeze();
        registry
    }

    /// The process-wide registry, initialized once with the built-in set.
    pub fn global() -> &'static OperatorRegistry {
        static GLOBAL: OnceLock<OperatorRegistry> = OnceLock::new();
        GLOBAL.get_or_init(OperatorRegistry::builtin)
    }

    /// Registers an operator descriptor.
    ///
    /// Idempotent within a process: a second registration with an
    /// identical locator is a no-op; a conflicting one fails with
    /// `RegistryConflict`.
    pub fn register(&mut self, descriptor: OperatorDescriptor) -> Result<(), RegistryError> {
        if self.frozen {
            return Err(RegistryError::Frozen);
        }
        if let Some(existing) = self.entries.get(descriptor.name) {
            let identical = existing.kind == descriptor.kind
                && std::ptr::fn_addr_eq(existing.factory, descriptor.factory);
            if identical {
                return Ok(());
            }
            return Err(RegistryError::RegistryConflict(descriptor.name.to_string()));
        }
        self.entries.insert(descriptor.name, descriptor);
        Ok(())
    }

    /// Forbids further registration.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Resolves an operator name to its descriptor.
    pub fn lookup(&self, name: &str) -> Result<&OperatorDescriptor, RegistryError> {
        self.entries
            .get(name)
            .ok_or_else(|| RegistryError::OperatorUnknown(name.to_string()))
    }

    /// Resolves and constructs an operator with the given options.
    pub fn instantiate(
        &self,
        name: &str,
        options: &OperatorOptions,
    ) -> Result<Box<dyn Operator>, RegistryError> {
        let descriptor = self.lookup(name)?;
        (descriptor.factory)(options).map_err(|reason| RegistryError::OperatorLoadError {
            name: name.to_string(),
            reason,
        })
    }

    /// Names of all registered operators, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.entries.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OperatorFailure;
    use crate::operator::OperatorOutput;
    use async_trait::async_trait;

    #[derive(Debug)]
    struct NoopOperator;

    #[async_trait]
    impl Operator for NoopOperator {
        fn name(&self) -> &str {
            "noop"
        }

        fn kind(&self) -> OperatorKind {
            OperatorKind::Mapper
        }

        async fn execute(
            &self,
            sample: crate::sample::Sample,
        ) -> Result<OperatorOutput, OperatorFailure> {
            Ok(OperatorOutput::One(sample))
        }
    }

    fn noop_factory(_options: &OperatorOptions) -> Result<Box<dyn Operator>, String> {
        Ok(Box::new(NoopOperator))
    }

    fn failing_factory(_options: &OperatorOptions) -> Result<Box<dyn Operator>, String> {
        Err("constructor exploded".to_string())
    }

    fn noop_descriptor() -> OperatorDescriptor {
        OperatorDescriptor {
            name: "noop",
            kind: OperatorKind::Mapper,
            factory: noop_factory,
        }
    }

    #[test]
    fn test_register_is_idempotent_for_identical_locator() {
        let mut registry = OperatorRegistry::new();
        registry.register(noop_descriptor()).unwrap();
        // Same name, same locator: no-op.
        registry.register(noop_descriptor()).unwrap();
        assert_eq!(registry.names(), vec!["noop"]);
    }

    #[test]
    fn test_register_conflicting_locator_fails() {
        let mut registry = OperatorRegistry::new();
        registry.register(noop_descriptor()).unwrap();

        let conflicting = OperatorDescriptor {
            name: "noop",
            kind: OperatorKind::Filter,
            factory: noop_factory,
        };
        let err = registry.register(conflicting).unwrap_err();
        assert!(matches!(err, RegistryError::RegistryConflict(name) if name == "noop"));
    }

    #[test]
    fn test_frozen_registry_rejects_registration() {
        let mut registry = OperatorRegistry::new();
        registry.freeze();
        let err = registry.register(noop_descriptor()).unwrap_err();
        assert!(matches!(err, RegistryError::Frozen));
    }

    #[test]
    fn test_lookup_unknown_operator() {
        let registry = OperatorRegistry::new();
        let err = registry.lookup("ghost").unwrap_err();
        assert!(matches!(err, RegistryError::OperatorUnknown(name) if name == "ghost"));
    }

    #[test]
    fn test_instantiate_wraps_constructor_error() {
        let mut registry = OperatorRegistry::new();
        registry
            .register(OperatorDescriptor {
                name: "broken",
                kind: OperatorKind::Mapper,
                factory: failing_factory,
            })
            .unwrap();

        let err = registry
            .instantiate("broken", &OperatorOptions::new())
            .unwrap_err();
        match err {
            RegistryError::OperatorLoadError { name, reason } => {
                assert_eq!(name, "broken");
                assert!(reason.contains("exploded"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_builtin_registry_is_frozen_and_populated() {
        let registry = OperatorRegistry::builtin();
        assert!(registry.lookup("emoji-strip").is_ok());
        assert!(registry.lookup("whitespace-normalize").is_ok());
        assert!(registry.lookup("min-length-filter").is_ok());
        assert!(registry.lookup("segmenter").is_ok());
        assert!(registry.lookup("qa-scorer").is_ok());
        assert!(registry.lookup("text-export").is_ok());
    }
}
