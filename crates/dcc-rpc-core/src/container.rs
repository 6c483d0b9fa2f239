//! Minimal service container for dependency injection.
//!
//! Services are keyed by type. A service is either a ready-made instance
//! or a factory; factories run at most once, on first resolve, and the
//! built instance is kept (singleton-after-first-use). The api layer uses
//! one process-global container; tests build their own.

use crate::error::{Result, RpcError};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

type AnyService = Arc<dyn Any + Send + Sync>;
type Factory = Box<dyn Fn() -> AnyService + Send + Sync>;

enum Slot {
    Instance(AnyService),
    Factory(Factory),
}

/// Type-keyed registry of shared services.
#[derive(Default)]
pub struct ServiceContainer {
    slots: RwLock<HashMap<TypeId, Slot>>,
}

impl ServiceContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance. Replaces any previous registration for `T`.
    pub fn register<T: Send + Sync + 'static>(&self, service: Arc<T>) {
        self.slots
            .write()
            .expect("service container lock poisoned")
            .insert(TypeId::of::<T>(), Slot::Instance(service));
    }

    /// Register a factory, deferring construction to the first resolve.
    pub fn register_factory<T, F>(&self, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn() -> Arc<T> + Send + Sync + 'static,
    {
        self.slots
            .write()
            .expect("service container lock poisoned")
            .insert(
                TypeId::of::<T>(),
                Slot::Factory(Box::new(move || factory())),
            );
    }

    /// Resolve a service, running its factory on first use.
    pub fn resolve<T: Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        let key = TypeId::of::<T>();

        // Fast path: already an instance.
        {
            let slots = self.slots.read().expect("service container lock poisoned");
            if let Some(Slot::Instance(service)) = slots.get(&key) {
                return downcast::<T>(service.clone());
            }
        }

        let mut slots = self.slots.write().expect("service container lock poisoned");
        match slots.get(&key) {
            Some(Slot::Instance(service)) => downcast::<T>(service.clone()),
            Some(Slot::Factory(factory)) => {
                let service = factory();
                slots.insert(key, Slot::Instance(service.clone()));
                downcast::<T>(service)
            }
            None => Err(RpcError::ServiceNotRegistered {
                type_name: std::any::type_name::<T>(),
            }),
        }
    }

    /// Resolve with an explicit override: a passed-in instance wins over
    /// the container registration.
    pub fn resolve_or<T: Send + Sync + 'static>(&self, explicit: Option<Arc<T>>) -> Result<Arc<T>> {
        match explicit {
            Some(service) => Ok(service),
            None => self.resolve::<T>(),
        }
    }

    /// Whether `T` has a registration (instance or factory).
    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.slots
            .read()
            .expect("service container lock poisoned")
            .contains_key(&TypeId::of::<T>())
    }
}

fn downcast<T: Send + Sync + 'static>(service: AnyService) -> Result<Arc<T>> {
    service
        .downcast::<T>()
        .map_err(|_| RpcError::ServiceNotRegistered {
            type_name: std::any::type_name::<T>(),
        })
}

/// The process-global container used by the api layer.
pub fn global() -> &'static ServiceContainer {
    static CONTAINER: OnceLock<ServiceContainer> = OnceLock::new();
    CONTAINER.get_or_init(ServiceContainer::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Greeter {
        greeting: String,
    }

    #[test]
    fn test_register_and_resolve_instance() {
        let container = ServiceContainer::new();
        container.register(Arc::new(Greeter {
            greeting: "hello".to_string(),
        }));

        let greeter = container.resolve::<Greeter>().unwrap();
        assert_eq!(greeter.greeting, "hello");
    }

    #[test]
    fn test_resolve_missing_is_error() {
        let container = ServiceContainer::new();
        assert!(matches!(
            container.resolve::<Greeter>(),
            Err(RpcError::ServiceNotRegistered { .. })
        ));
    }

    #[test]
    fn test_factory_runs_once() {
        static BUILDS: AtomicUsize = AtomicUsize::new(0);

        let container = ServiceContainer::new();
        container.register_factory(|| {
            BUILDS.fetch_add(1, Ordering::SeqCst);
            Arc::new(Greeter {
                greeting: "built".to_string(),
            })
        });
        assert_eq!(BUILDS.load(Ordering::SeqCst), 0);

        let first = container.resolve::<Greeter>().unwrap();
        let second = container.resolve::<Greeter>().unwrap();

        assert_eq!(BUILDS.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_reregistration_replaces() {
        let container = ServiceContainer::new();
        container.register(Arc::new(Greeter {
            greeting: "first".to_string(),
        }));
        container.register(Arc::new(Greeter {
            greeting: "second".to_string(),
        }));

        assert_eq!(container.resolve::<Greeter>().unwrap().greeting, "second");
    }

    #[test]
    fn test_resolve_or_prefers_explicit() {
        let container = ServiceContainer::new();
        container.register(Arc::new(Greeter {
            greeting: "registered".to_string(),
        }));

        let explicit = Arc::new(Greeter {
            greeting: "explicit".to_string(),
        });
        let resolved = container.resolve_or(Some(explicit)).unwrap();
        assert_eq!(resolved.greeting, "explicit");

        let fallback = container.resolve_or::<Greeter>(None).unwrap();
        assert_eq!(fallback.greeting, "registered");
    }
}
