//! Service resolution seam for dependency-injected job runners.
//!
//! The scheduler never constructs user services itself; when a provider is
//! configured it opens one scope per execution and hands that scope to the
//! job. The traits here are the minimal surface an embedding container has
//! to cover.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::JobResult;

/// A container that can open per-execution scopes.
pub trait ServiceProvider: Send + Sync {
    /// Open a new scope. Everything the scope holds is released when it is
    /// dropped, on every exit path of the execution. A failure here is
    /// recorded as the execution's terminal error.
    fn create_scope(&self) -> JobResult<Box<dyn ServiceScope>>;
}

/// One resolution scope, alive for a single execution.
pub trait ServiceScope: Send + Sync {
    /// Resolve a service by its type id.
    fn resolve_any(&self, type_id: TypeId) -> Option<Arc<dyn Any + Send + Sync>>;
}

impl dyn ServiceScope + '_ {
    /// Typed resolution helper.
    pub fn resolve<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.resolve_any(TypeId::of::<T>())
            .and_then(|service| service.downcast::<T>().ok())
    }
}

/// Minimal map-backed provider for tests and simple embedders.
#[derive(Default)]
pub struct ServiceMap {
    services: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ServiceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service instance, replacing any previous one of the same
    /// type.
    pub fn with<T: Send + Sync + 'static>(mut self, service: T) -> Self {
        self.services.insert(TypeId::of::<T>(), Arc::new(service));
        self
    }
}

impl ServiceProvider for ServiceMap {
    fn create_scope(&self) -> JobResult<Box<dyn ServiceScope>> {
        Ok(Box::new(MapScope {
            services: self.services.clone(),
        }))
    }
}

struct MapScope {
    services: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ServiceScope for MapScope {
    fn resolve_any(&self, type_id: TypeId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.services.get(&type_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Mailer {
        host: String,
    }

    #[test]
    fn scopes_resolve_registered_services() {
        let provider = ServiceMap::new().with(Mailer {
            host: "smtp.local".into(),
        });

        let scope = provider.create_scope().unwrap();
        let mailer = scope.resolve::<Mailer>().unwrap();
        assert_eq!(mailer.host, "smtp.local");

        assert!(scope.resolve::<String>().is_none());
    }

    #[test]
    fn each_scope_resolves_independently() {
        let provider = ServiceMap::new().with(42_u32);
        let a = provider.create_scope().unwrap();
        let b = provider.create_scope().unwrap();
        assert_eq!(*a.resolve::<u32>().unwrap(), 42);
        assert_eq!(*b.resolve::<u32>().unwrap(), 42);
    }

    #[test]
    fn dropping_a_scope_releases_its_handles() {
        let provider = ServiceMap::new().with(Mailer {
            host: "smtp.local".into(),
        });

        let scope = provider.create_scope().unwrap();
        let mailer = scope.resolve::<Mailer>().unwrap();
        let before = Arc::strong_count(&mailer);
        drop(scope);
        assert_eq!(Arc::strong_count(&mailer), before - 1);
    }
}
