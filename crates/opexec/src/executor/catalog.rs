use std::sync::Arc;

use super::config::OperationAttrs;
use super::implementation::ExecutorImplementation;

pub type ImplementationPtr<A> = Arc<dyn ExecutorImplementation<A>>;

/// Static registration entry collected from backend crates.
///
/// Lower `priority` values are tried first.
pub struct ImplementationRegistrar<A: 'static> {
    pub priority: u32,
    pub build: fn() -> ImplementationPtr<A>,
}

/// Fixed, priority-ordered candidates for one operation kind.
pub struct ImplementationCatalog<A: 'static> {
    entries: Vec<ImplementationPtr<A>>,
}

impl<A: OperationAttrs> ImplementationCatalog<A> {
    /// Uses `entries` in the given order.
    pub fn new(entries: Vec<ImplementationPtr<A>>) -> Self {
        Self { entries }
    }

    /// Orders registrars by priority; equal priorities keep their link order.
    pub fn from_registrars(registrars: &[ImplementationRegistrar<A>]) -> Self {
        let mut ordered: Vec<&ImplementationRegistrar<A>> = registrars.iter().collect();
        ordered.sort_by_key(|registrar| registrar.priority);
        Self::new(ordered.into_iter().map(|registrar| (registrar.build)()).collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ImplementationPtr<A>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|entry| entry.name()).collect()
    }

    pub fn find(&self, name: &str) -> Option<&ImplementationPtr<A>> {
        self.entries.iter().find(|entry| entry.name() == name)
    }
}
