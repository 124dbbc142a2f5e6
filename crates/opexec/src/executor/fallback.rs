//! Composite executor that converts operands around an implementation that needs different
//! descriptors than the caller provides.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;

use super::config::{Config, OperationAttrs};
use super::context::{ExecutorContextPtr, Reorder};
use super::error::{ExecResult, ExecutorError};
use super::factory::ExecutorFactory;
use super::{Executor, ExecutorPtr, ImplType};
use crate::memory::{arg, ArgId, Memory, MemoryArgs, MemoryDescArgs, MemoryDescPtr, MemoryPtr};

/// How one operand reaches the inner executor.
#[derive(Debug, Clone)]
enum PortBinding {
    /// The caller's buffer is used directly.
    Passthrough,
    /// Converted through the context weight cache whenever the caller binds a new buffer.
    Constant(MemoryDescPtr),
    /// Converted into `buffer` on every call (inputs) or back out of it (outputs).
    Converted(MemoryPtr),
}

/// Buffers currently handed to the inner executor.
struct Bindings {
    args: MemoryArgs,
    /// Caller buffer each constant port was last converted from.
    constant_sources: HashMap<ArgId, u64>,
}

fn same_shapes(lhs: &[MemoryDescPtr], rhs: &[MemoryDescPtr]) -> bool {
    lhs.len() == rhs.len()
        && lhs
            .iter()
            .zip(rhs)
            .all(|(a, b)| a.shape() == b.shape())
}

/// Rejects adjusted configs that change anything but precisions and layouts.
fn ensure_adaptable<A: OperationAttrs>(
    implementation: &str,
    original: &Config<A>,
    adjusted: &Config<A>,
) -> ExecResult<()> {
    if original.attrs != adjusted.attrs {
        return Err(ExecutorError::compliance(
            implementation,
            format!("attrs changed: {} -> {}", original.attrs, adjusted.attrs),
        ));
    }
    if original.post_ops != adjusted.post_ops {
        return Err(ExecutorError::compliance(implementation, "post-ops changed"));
    }
    if !same_shapes(&original.descs.src, &adjusted.descs.src) {
        return Err(ExecutorError::compliance(
            implementation,
            "input ports or shapes changed",
        ));
    }
    if !same_shapes(&original.descs.dst, &adjusted.descs.dst) {
        return Err(ExecutorError::compliance(
            implementation,
            "output ports or shapes changed",
        ));
    }
    Ok(())
}

/// Builds the convert → compute → convert-back executor for `adjusted`.
pub(crate) fn emit<A: OperationAttrs>(
    factory: &ExecutorFactory<A>,
    original: &Config<A>,
    adjusted: &Config<A>,
    memory: &MemoryArgs,
    implementation: &str,
) -> ExecResult<ExecutorPtr> {
    ensure_adaptable(implementation, original, adjusted)?;
    let context = factory.context();
    let constant_mask = original.attrs.constant_input_mask();

    let mut bindings = Bindings {
        args: MemoryArgs::new(),
        constant_sources: HashMap::new(),
    };
    let mut inputs = Vec::with_capacity(original.descs.src.len());
    for (port, (from, to)) in original.descs.src.iter().zip(&adjusted.descs.src).enumerate() {
        let Some(id) = ArgId::src_port(port) else {
            continue;
        };
        let binding = if from == to {
            if let Some(bound) = memory.get(&id) {
                bindings.args.insert(id, bound.clone());
            }
            PortBinding::Passthrough
        } else if constant_mask & (1 << port) != 0 {
            let source = arg(memory, id)?;
            bindings.args.insert(id, context.constant(source, to)?);
            bindings.constant_sources.insert(id, source.id());
            PortBinding::Constant(to.clone())
        } else {
            let buffer = Memory::new(to.clone())?;
            if let Some(source) = memory.get(&id) {
                convert_into(&**context.reorder(), source, &buffer)?;
            }
            bindings.args.insert(id, buffer.clone());
            PortBinding::Converted(buffer)
        };
        debug!("fallback {id}: {from} -> {to} ({binding:?})");
        inputs.push((id, binding));
    }

    let mut outputs = Vec::with_capacity(original.descs.dst.len());
    for (port, (from, to)) in original.descs.dst.iter().zip(&adjusted.descs.dst).enumerate() {
        let Some(id) = ArgId::dst_port(port) else {
            continue;
        };
        let binding = if from == to {
            if let Some(bound) = memory.get(&id) {
                bindings.args.insert(id, bound.clone());
            }
            PortBinding::Passthrough
        } else {
            let buffer = Memory::new(to.clone())?;
            bindings.args.insert(id, buffer.clone());
            PortBinding::Converted(buffer)
        };
        outputs.push((id, binding));
    }

    let inner = factory.make_compliant(adjusted, &bindings.args)?;
    Ok(Arc::new(FallbackExecutor {
        inner,
        descs: original.descs.clone(),
        inner_descs: adjusted.descs.clone(),
        inputs,
        outputs,
        context: context.clone(),
        bound: Mutex::new(bindings),
    }))
}

fn convert_into(reorder: &dyn Reorder, source: &Memory, target: &Memory) -> ExecResult<()> {
    let converted = {
        let data = source.read()?;
        reorder.reorder(source.desc(), &data, target.desc())?
    };
    *target.write()? = converted;
    Ok(())
}

struct FallbackExecutor {
    inner: ExecutorPtr,
    descs: MemoryDescArgs,
    inner_descs: MemoryDescArgs,
    inputs: Vec<(ArgId, PortBinding)>,
    outputs: Vec<(ArgId, PortBinding)>,
    context: ExecutorContextPtr,
    bound: Mutex<Bindings>,
}

impl FallbackExecutor {
    fn convert_into(&self, source: &Memory, target: &Memory) -> ExecResult<()> {
        convert_into(&**self.context.reorder(), source, target)
    }
}

impl Executor for FallbackExecutor {
    /// Rebinds caller buffers and forwards the adjusted bindings to the inner executor, which
    /// may repack weights.
    fn update(&self, descs: &MemoryDescArgs, memory: &MemoryArgs) -> ExecResult<()> {
        if *descs != self.descs {
            return Err(ExecutorError::execution(
                "fallback executor cannot change descriptors; rebuild it through the factory",
            ));
        }
        let mut bound = self
            .bound
            .lock()
            .map_err(|_| ExecutorError::execution("fallback bindings poisoned"))?;
        for (id, binding) in &self.inputs {
            let Some(source) = memory.get(id) else {
                continue;
            };
            match binding {
                PortBinding::Passthrough => {
                    bound.args.insert(*id, source.clone());
                }
                PortBinding::Constant(desc) => {
                    if bound.constant_sources.get(id) != Some(&source.id()) {
                        debug!("fallback {id}: constant rebound to memory #{}", source.id());
                        let converted = self.context.constant(source, desc)?;
                        bound.args.insert(*id, converted);
                        bound.constant_sources.insert(*id, source.id());
                    }
                }
                PortBinding::Converted(buffer) => self.convert_into(source, buffer)?,
            }
        }
        for (id, binding) in &self.outputs {
            if matches!(binding, PortBinding::Passthrough) {
                if let Some(buffer) = memory.get(id) {
                    bound.args.insert(*id, buffer.clone());
                }
            }
        }
        self.inner.update(&self.inner_descs, &bound.args)
    }

    fn execute(&self, memory: &MemoryArgs) -> ExecResult<()> {
        let mut args = self
            .bound
            .lock()
            .map_err(|_| ExecutorError::execution("fallback bindings poisoned"))?
            .args
            .clone();

        for (id, binding) in &self.inputs {
            match binding {
                PortBinding::Passthrough => {
                    if let Some(buffer) = memory.get(id) {
                        args.insert(*id, buffer.clone());
                    }
                }
                PortBinding::Constant(_) => {}
                PortBinding::Converted(buffer) => {
                    self.convert_into(arg(memory, *id)?, buffer)?;
                }
            }
        }
        for (id, binding) in &self.outputs {
            if matches!(binding, PortBinding::Passthrough) {
                args.insert(*id, arg(memory, *id)?.clone());
            }
        }

        self.inner.execute(&args)?;

        for (id, binding) in &self.outputs {
            if let PortBinding::Converted(buffer) = binding {
                self.convert_into(buffer, arg(memory, *id)?)?;
            }
        }
        Ok(())
    }

    fn impl_type(&self) -> ImplType {
        self.inner.impl_type()
    }
}
