//! Construction of cache backends by kind tag.
//!
//! Backend implementations register a factory under a tag at startup; the
//! daemon then constructs whichever kind its configuration names. Unknown
//! tags construct nothing, and the registry can be introspected for the set
//! of kinds it knows about.
use std::collections::HashMap;

use super::CacheBackend;

/// Free-form options handed to a factory, e.g. `capacity` for the in-memory
/// backend.
pub type BackendOptions = HashMap<String, String>;

/// Introspection record for one registered backend kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendKind {
    pub tag: &'static str,
    pub description: &'static str,
}

/// Builds instances of one backend kind.
pub trait BackendFactory: Send + Sync {
    fn tag(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Constructs a backend from `options`, or `None` if the options do not
    /// describe a usable instance.
    fn construct(&self, options: &BackendOptions) -> Option<Box<dyn CacheBackend>>;
}

/// Runtime map from kind tag to factory.
#[derive(Default)]
pub struct BackendRegistry {
    factories: HashMap<&'static str, Box<dyn BackendFactory>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under its own tag. A later registration with the
    /// same tag replaces the earlier one.
    pub fn register(&mut self, factory: Box<dyn BackendFactory>) {
        self.factories.insert(factory.tag(), factory);
    }

    /// Constructs a backend of the given kind; `None` for unknown tags or
    /// options the factory refuses.
    pub fn construct(&self, tag: &str, options: &BackendOptions) -> Option<Box<dyn CacheBackend>> {
        self.factories.get(tag)?.construct(options)
    }

    /// All registered kinds.
    pub fn introspect(&self) -> Vec<BackendKind> {
        self.factories
            .values()
            .map(|factory| BackendKind {
                tag: factory.tag(),
                description: factory.description(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;

    struct FirstFactory;

    impl BackendFactory for FirstFactory {
        fn tag(&self) -> &'static str {
            "first"
        }

        fn description(&self) -> &'static str {
            "Hello from First."
        }

        fn construct(&self, options: &BackendOptions) -> Option<Box<dyn CacheBackend>> {
            if options.contains_key("fail") {
                return None;
            }
            Some(Box::new(MemoryBackend::new(1024)))
        }
    }

    struct SecondFactory;

    impl BackendFactory for SecondFactory {
        fn tag(&self) -> &'static str {
            "second"
        }

        fn description(&self) -> &'static str {
            "Second calling!"
        }

        fn construct(&self, _options: &BackendOptions) -> Option<Box<dyn CacheBackend>> {
            Some(Box::new(MemoryBackend::new(2048)))
        }
    }

    fn registry() -> BackendRegistry {
        let mut registry = BackendRegistry::new();
        registry.register(Box::new(FirstFactory));
        registry.register(Box::new(SecondFactory));
        registry
    }

    #[test]
    fn introspect_lists_all_registered_kinds() {
        let kinds = registry().introspect();

        assert_eq!(kinds.len(), 2);
        assert!(kinds
            .iter()
            .any(|kind| kind.tag == "first" && kind.description == "Hello from First."));
        assert!(kinds
            .iter()
            .any(|kind| kind.tag == "second" && kind.description == "Second calling!"));
    }

    #[test]
    fn constructs_by_tag() {
        let registry = registry();

        assert!(registry.construct("first", &BackendOptions::new()).is_some());
        assert!(registry
            .construct("second", &BackendOptions::new())
            .is_some());
    }

    #[test]
    fn unknown_tag_constructs_nothing() {
        assert!(registry()
            .construct("third", &BackendOptions::new())
            .is_none());
    }

    #[test]
    fn factory_may_refuse_options() {
        let mut options = BackendOptions::new();
        options.insert("fail".to_string(), "yes".to_string());

        assert!(registry().construct("first", &options).is_none());
    }
}
