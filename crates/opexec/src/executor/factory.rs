use std::collections::HashMap;
use std::sync::Mutex;

use log::debug;

use super::catalog::{ImplementationCatalog, ImplementationPtr};
use super::config::{Config, OperationAttrs};
use super::context::ExecutorContextPtr;
use super::error::{ExecResult, ExecutorError};
use super::fallback;
use super::cache::hash_value;
use super::implementation::{Compliance, ExecutorKind, OperationKind};
use super::ExecutorPtr;
use crate::memory::{MemoryArgs, MemoryDescArgs};

/// Narrows `catalog` to the candidates able to run `config`, in catalog order.
///
/// Entries whose name differs from `name_filter` are skipped. Scanning stops after the first
/// retained shape-agnostic entry since nothing after it could ever be selected.
pub fn filter<A: OperationAttrs>(
    catalog: &ImplementationCatalog<A>,
    config: &Config<A>,
    name_filter: Option<&str>,
) -> ExecResult<Vec<ImplementationPtr<A>>> {
    let mut retained = Vec::new();
    for implementation in catalog.iter() {
        if let Some(name) = name_filter {
            if implementation.name() != name {
                debug!("{} skipped: does not match filter {name}", implementation.name());
                continue;
            }
        }
        if !implementation.is_supported(config) {
            debug!("{} is not supported", implementation.name());
            continue;
        }
        retained.push(implementation.clone());
        if implementation.is_shape_agnostic() {
            debug!(
                "{} is shape agnostic; stop processing implementations",
                implementation.name()
            );
            break;
        }
    }

    if retained.is_empty() {
        return Err(ExecutorError::NoSuitableImplementation {
            operation: A::OPERATION.to_string(),
            config: config.to_string(),
        });
    }
    Ok(retained)
}

/// Picks and builds executors for one operation instance.
///
/// The candidate list is fixed when the factory is built; every later call only selects
/// among those candidates for the concrete shapes it is given.
pub struct ExecutorFactory<A: OperationAttrs> {
    context: ExecutorContextPtr,
    candidates: Vec<ImplementationPtr<A>>,
    executors: Mutex<HashMap<(ExecutorKind, OperationKind), ExecutorPtr>>,
}

impl<A: OperationAttrs> ExecutorFactory<A> {
    /// Filters `catalog` for `config`, honoring the context's implementation filter.
    pub fn new(
        config: &Config<A>,
        catalog: &ImplementationCatalog<A>,
        context: ExecutorContextPtr,
    ) -> ExecResult<Self> {
        let candidates = {
            let _scope = context.diagnostics().scope("filter");
            let name_filter = context.config().implementation_filter.as_deref();
            filter(catalog, config, name_filter)?
        };
        Ok(Self {
            context,
            candidates,
            executors: Mutex::new(HashMap::new()),
        })
    }

    pub fn context(&self) -> &ExecutorContextPtr {
        &self.context
    }

    pub fn candidate_names(&self) -> Vec<&'static str> {
        self.candidates.iter().map(|c| c.name()).collect()
    }

    /// First candidate that is shape agnostic or accepts the concrete shapes of `config`.
    pub fn select(&self, config: &Config<A>) -> ExecResult<&ImplementationPtr<A>> {
        let _scope = self.context.diagnostics().scope("select");
        self.candidates
            .iter()
            .find(|candidate| candidate.is_shape_agnostic() || candidate.is_shape_suitable(config))
            .ok_or_else(|| ExecutorError::NoShapeSuitableImplementation {
                operation: A::OPERATION.to_string(),
                config: config.to_string(),
            })
    }

    /// Descriptors the selected implementation will require, without building anything.
    pub fn preconfigure_memory_descriptors(&self, config: &Config<A>) -> ExecResult<MemoryDescArgs> {
        let implementation = self.select(config)?;
        let compliance = implementation.is_fully_compliant(config);
        if compliance.compliant {
            return Ok(config.descs.clone());
        }
        Ok(compliance.config.descs)
    }

    /// Builds the executor the next [`make`](Self::make) will use, so that kernel search
    /// happens ahead of the first call.
    pub fn preconfigure(&self, config: &Config<A>, memory: &MemoryArgs) -> ExecResult<()> {
        let implementation = self.select(config)?;
        let compliance = self.compliance(implementation, config);
        if compliance.compliant {
            debug!("preconfiguring {}", implementation.name());
            self.instantiate(implementation, config, memory)?;
            return Ok(());
        }
        let adjusted = compliance.config;
        let inner = self.select(&adjusted)?;
        if !self.compliance(inner, &adjusted).compliant {
            return Err(not_compliant(inner.name(), &adjusted));
        }
        debug!("preconfiguring {} for adjusted config {adjusted}", inner.name());
        self.instantiate(inner, &adjusted, memory)?;
        Ok(())
    }

    /// Selects, builds (or reuses) and binds an executor for `config`.
    ///
    /// When the selected implementation needs different descriptors, the returned executor
    /// converts operands around the implementation's own executor.
    pub fn make(&self, config: &Config<A>, memory: &MemoryArgs) -> ExecResult<ExecutorPtr> {
        debug!(
            "make {} #{:016x}: {config}",
            A::OPERATION,
            hash_value(config)
        );
        let implementation = self.select(config)?;
        let compliance = self.compliance(implementation, config);
        if compliance.compliant {
            debug!("{} is fully compliant", implementation.name());
            return self.bind(implementation, config, memory);
        }

        debug!(
            "falling back for {}: {config} -> {}",
            implementation.name(),
            compliance.config
        );
        let _scope = self.context.diagnostics().scope("fallback");
        fallback::emit(self, config, &compliance.config, memory, implementation.name())
    }

    /// Like [`make`](Self::make) but refuses to adapt: the selected implementation must accept
    /// `config` as is.
    pub(crate) fn make_compliant(
        &self,
        config: &Config<A>,
        memory: &MemoryArgs,
    ) -> ExecResult<ExecutorPtr> {
        let implementation = self.select(config)?;
        if !self.compliance(implementation, config).compliant {
            return Err(not_compliant(implementation.name(), config));
        }
        self.bind(implementation, config, memory)
    }

    fn compliance(
        &self,
        implementation: &ImplementationPtr<A>,
        config: &Config<A>,
    ) -> Compliance<A> {
        let _scope = self.context.diagnostics().scope("compliance");
        implementation.is_fully_compliant(config)
    }

    fn bind(
        &self,
        implementation: &ImplementationPtr<A>,
        config: &Config<A>,
        memory: &MemoryArgs,
    ) -> ExecResult<ExecutorPtr> {
        let executor = self.instantiate(implementation, config, memory)?;
        let _scope = self.context.diagnostics().scope("update");
        executor.update(&config.descs, memory)?;
        Ok(executor)
    }

    fn instantiate(
        &self,
        implementation: &ImplementationPtr<A>,
        config: &Config<A>,
        memory: &MemoryArgs,
    ) -> ExecResult<ExecutorPtr> {
        let id = (implementation.executor_kind(), implementation.operation_kind());
        let mut executors = self
            .executors
            .lock()
            .map_err(|_| ExecutorError::execution("executor map poisoned"))?;
        if let Some(existing) = executors.get(&id) {
            return Ok(existing.clone());
        }
        debug!("instantiating {}", implementation.name());
        let _scope = self.context.diagnostics().scope("instantiate");
        let executor = implementation.instantiate(config, memory, &self.context)?;
        executors.insert(id, executor.clone());
        Ok(executor)
    }

    /// Number of executors built so far.
    pub fn instantiated(&self) -> usize {
        self.executors.lock().map(|map| map.len()).unwrap_or(0)
    }
}

fn not_compliant<A: OperationAttrs>(implementation: &str, config: &Config<A>) -> ExecutorError {
    ExecutorError::compliance(
        implementation,
        format!("adjusted config is still not accepted: {config}"),
    )
}
