use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use opexec::executor::negotiation::{everyone, NegotiationRule, PortPolicy};
use opexec::executor::{
    Compliance, ExecResult, Executor, ExecutorContextPtr, ExecutorError, ExecutorFactory,
    ExecutorImplementation, ExecutorKind, ExecutorPtr, ImplType, ImplementationCatalog,
    ImplementationPtr, OperationKind, ShapeTolerance,
};
use opexec::fullyconnected::planar_layout_config;
use opexec::memory::{arg, convert, Memory, MemoryArgs, MemoryDesc, MemoryDescArgs, TensorData};
use opexec::post_ops::{Activation, PostOp};
use opexec::precision::masks;
use opexec::{ArgId, ContextConfig, ExecutorContext, FcAttrs, FcConfig, Precision};

#[derive(Default)]
struct Calls {
    supported: AtomicUsize,
    shape: AtomicUsize,
    instantiate: AtomicUsize,
    update: AtomicUsize,
    execute: AtomicUsize,
}

impl Calls {
    fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// How a mock answers compliance questions.
#[derive(Clone, Copy)]
enum Answer {
    Accept,
    /// Negotiates every port to `f32`.
    RequireF32,
    ChangeAttrs,
    ChangeShapes,
    ChangeDstShape,
    ChangePostOps,
    NeverSatisfied,
}

struct Mock {
    name: &'static str,
    kind: ExecutorKind,
    operation: OperationKind,
    tolerance: ShapeTolerance,
    supported: bool,
    shape_suitable: bool,
    answer: Answer,
    calls: Arc<Calls>,
}

impl Mock {
    fn new(name: &'static str, tolerance: ShapeTolerance) -> Self {
        Self {
            name,
            kind: ExecutorKind::Reference,
            operation: OperationKind::FullyConnected,
            tolerance,
            supported: true,
            shape_suitable: true,
            answer: Answer::Accept,
            calls: Arc::new(Calls::default()),
        }
    }

    fn unsupported(mut self) -> Self {
        self.supported = false;
        self
    }

    fn shape_suitable(mut self, suitable: bool) -> Self {
        self.shape_suitable = suitable;
        self
    }

    fn answering(mut self, answer: Answer) -> Self {
        self.answer = answer;
        self
    }

    fn kind(mut self, kind: ExecutorKind, operation: OperationKind) -> Self {
        self.kind = kind;
        self.operation = operation;
        self
    }

    fn calls(&self) -> Arc<Calls> {
        self.calls.clone()
    }
}

impl ExecutorImplementation<FcAttrs> for Mock {
    fn name(&self) -> &'static str {
        self.name
    }

    fn executor_kind(&self) -> ExecutorKind {
        self.kind
    }

    fn operation_kind(&self) -> OperationKind {
        self.operation
    }

    fn shape_tolerance(&self) -> ShapeTolerance {
        self.tolerance
    }

    fn is_supported(&self, _config: &FcConfig) -> bool {
        self.calls.supported.fetch_add(1, Ordering::SeqCst);
        self.supported
    }

    fn is_shape_suitable(&self, _config: &FcConfig) -> bool {
        self.calls.shape.fetch_add(1, Ordering::SeqCst);
        self.shape_suitable
    }

    fn is_fully_compliant(&self, config: &FcConfig) -> Compliance<FcAttrs> {
        match self.answer {
            Answer::Accept => Compliance::accepted(config),
            Answer::RequireF32 => {
                let rules = [NegotiationRule::new(
                    [masks::ANY; 4],
                    everyone(PortPolicy::Just(Precision::F32)),
                )];
                Compliance::negotiate(config, &rules, planar_layout_config())
            }
            Answer::ChangeAttrs => {
                let mut adjusted = config.clone();
                adjusted.attrs.with_bias = !adjusted.attrs.with_bias;
                Compliance::adjusted(adjusted)
            }
            Answer::ChangeShapes => {
                let mut adjusted = config.clone();
                adjusted.descs.src[0] = Arc::new(config.descs.src[0].clone_with_dims(&[1, 1]));
                Compliance::adjusted(adjusted)
            }
            Answer::ChangeDstShape => {
                let mut adjusted = config.clone();
                adjusted.descs.dst[0] = Arc::new(config.descs.dst[0].clone_with_dims(&[1, 1]));
                Compliance::adjusted(adjusted)
            }
            Answer::ChangePostOps => {
                let mut adjusted = config.clone();
                adjusted.post_ops.push(PostOp::Activation(Activation::Relu));
                Compliance::adjusted(adjusted)
            }
            Answer::NeverSatisfied => {
                let mut adjusted = config.clone();
                adjusted.descs.dst[0] =
                    MemoryDesc::planar(Precision::I32, &config_dims(&config.descs.dst[0]));
                Compliance::adjusted(adjusted)
            }
        }
    }

    fn instantiate(
        &self,
        _config: &FcConfig,
        _memory: &MemoryArgs,
        _context: &ExecutorContextPtr,
    ) -> ExecResult<ExecutorPtr> {
        self.calls.instantiate.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(CopyExecutor {
            calls: self.calls.clone(),
        }))
    }
}

fn config_dims(desc: &MemoryDesc) -> Vec<usize> {
    desc.shape().static_dims().unwrap_or_default()
}

/// Copies `f32` input to `f32` output; refuses anything else.
struct CopyExecutor {
    calls: Arc<Calls>,
}

impl Executor for CopyExecutor {
    fn update(&self, _descs: &MemoryDescArgs, _memory: &MemoryArgs) -> ExecResult<()> {
        self.calls.update.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn execute(&self, memory: &MemoryArgs) -> ExecResult<()> {
        self.calls.execute.fetch_add(1, Ordering::SeqCst);
        let values = arg(memory, ArgId::Src)?
            .read()?
            .as_f32()
            .map(<[f32]>::to_vec)
            .ok_or_else(|| ExecutorError::execution("copy executor needs f32 input"))?;
        let dst = arg(memory, ArgId::Dst)?;
        let mut out = dst.write()?;
        let out = out
            .as_f32_mut()
            .ok_or_else(|| ExecutorError::execution("copy executor needs f32 output"))?;
        out.copy_from_slice(&values);
        Ok(())
    }

    fn impl_type(&self) -> ImplType {
        ImplType::Reference
    }
}

fn catalog(entries: Vec<Mock>) -> ImplementationCatalog<FcAttrs> {
    ImplementationCatalog::new(
        entries
            .into_iter()
            .map(|mock| Arc::new(mock) as ImplementationPtr<FcAttrs>)
            .collect(),
    )
}

fn context() -> ExecutorContextPtr {
    ExecutorContext::new(ContextConfig::default().with_counters(true)).into_shared()
}

fn config(precision: Precision) -> FcConfig {
    FcConfig::new(
        MemoryDescArgs::new(
            [
                MemoryDesc::planar(precision, &[1, 4]),
                MemoryDesc::planar(precision, &[4, 4]),
                MemoryDesc::empty(),
            ],
            [MemoryDesc::planar(precision, &[1, 4])],
        ),
        FcAttrs::default(),
        Vec::new(),
    )
}

fn memory_for(config: &FcConfig, src: &[f32]) -> Result<MemoryArgs> {
    let src_desc = config.descs.src[0].clone();
    let src_data = convert::from_f32(src, src_desc.precision())?;
    let wei_desc = config.descs.src[1].clone();
    let wei_data = convert::from_f32(&[0.0; 16], wei_desc.precision())?;
    Ok(MemoryArgs::from([
        (ArgId::Src, Memory::from_data(src_desc, src_data)?),
        (ArgId::Wei, Memory::from_data(wei_desc, wei_data)?),
        (ArgId::Dst, Memory::new(config.descs.dst[0].clone())?),
    ]))
}

#[test]
fn filter_keeps_catalog_order_and_stops_at_first_agnostic() -> Result<()> {
    let dependent = Mock::new("dependent", ShapeTolerance::Dependent);
    let skipped = Mock::new("skipped", ShapeTolerance::Dependent).unsupported();
    let agnostic = Mock::new("agnostic", ShapeTolerance::Agnostic);
    let unreachable = Mock::new("unreachable", ShapeTolerance::Agnostic);
    let unreachable_calls = unreachable.calls();
    let catalog = catalog(vec![dependent, skipped, agnostic, unreachable]);

    let factory = ExecutorFactory::new(&config(Precision::F32), &catalog, context())?;
    assert_eq!(factory.candidate_names(), vec!["dependent", "agnostic"]);
    assert_eq!(Calls::get(&unreachable_calls.supported), 0);
    Ok(())
}

#[test]
fn filter_reports_when_nothing_is_supported() {
    let catalog = catalog(vec![
        Mock::new("a", ShapeTolerance::Agnostic).unsupported(),
        Mock::new("b", ShapeTolerance::Dependent).unsupported(),
    ]);
    let err = ExecutorFactory::new(&config(Precision::F32), &catalog, context())
        .err()
        .expect("nothing supported");
    match err {
        ExecutorError::NoSuitableImplementation { operation, config } => {
            assert_eq!(operation, "FullyConnected");
            assert!(config.contains("f32"));
        }
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn filter_by_name_skips_other_entries() -> Result<()> {
    let catalog = catalog(vec![
        Mock::new("first", ShapeTolerance::Agnostic),
        Mock::new("second", ShapeTolerance::Agnostic),
    ]);
    let context = ExecutorContext::new(ContextConfig::default().with_implementation_filter("second"))
        .into_shared();
    let factory = ExecutorFactory::new(&config(Precision::F32), &catalog, context)?;
    assert_eq!(factory.candidate_names(), vec!["second"]);
    Ok(())
}

#[test]
fn select_prefers_shape_suitable_dependent_candidates() -> Result<()> {
    let config = config(Precision::F32);
    let suitable = catalog(vec![
        Mock::new("dependent", ShapeTolerance::Dependent),
        Mock::new("agnostic", ShapeTolerance::Agnostic),
    ]);
    let factory = ExecutorFactory::new(&config, &suitable, context())?;
    assert_eq!(factory.select(&config)?.name(), "dependent");

    let unsuitable = Mock::new("dependent", ShapeTolerance::Dependent).shape_suitable(false);
    let unsuitable_calls = unsuitable.calls();
    let fallback = catalog(vec![unsuitable, Mock::new("agnostic", ShapeTolerance::Agnostic)]);
    let factory = ExecutorFactory::new(&config, &fallback, context())?;
    assert_eq!(factory.select(&config)?.name(), "agnostic");
    assert_eq!(factory.select(&config)?.name(), "agnostic");
    assert_eq!(Calls::get(&unsuitable_calls.shape), 2);
    Ok(())
}

#[test]
fn select_fails_when_no_candidate_fits_the_shape() -> Result<()> {
    let config = config(Precision::F32);
    let catalog = catalog(vec![
        Mock::new("a", ShapeTolerance::Dependent).shape_suitable(false),
        Mock::new("b", ShapeTolerance::Dependent).shape_suitable(false),
    ]);
    let factory = ExecutorFactory::new(&config, &catalog, context())?;
    assert!(matches!(
        factory.select(&config),
        Err(ExecutorError::NoShapeSuitableImplementation { .. })
    ));
    let memory = memory_for(&config, &[1.0; 4])?;
    assert!(matches!(
        factory.make(&config, &memory),
        Err(ExecutorError::NoShapeSuitableImplementation { .. })
    ));
    Ok(())
}

#[test]
fn compliant_make_binds_and_reuses_the_executor() -> Result<()> {
    let mock = Mock::new("copy", ShapeTolerance::Agnostic);
    let calls = mock.calls();
    let catalog = catalog(vec![mock]);
    let config = config(Precision::F32);
    let memory = memory_for(&config, &[1.0, 2.0, 3.0, 4.0])?;
    let factory = ExecutorFactory::new(&config, &catalog, context())?;

    let first = factory.make(&config, &memory)?;
    let second = factory.make(&config, &memory)?;
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(Calls::get(&calls.instantiate), 1);
    assert_eq!(Calls::get(&calls.update), 2);

    first.execute(&memory)?;
    assert_eq!(
        *memory[&ArgId::Dst].read()?,
        TensorData::F32(vec![1.0, 2.0, 3.0, 4.0])
    );
    Ok(())
}

#[test]
fn make_instantiates_only_the_selected_candidate() -> Result<()> {
    let dependent = Mock::new("dependent", ShapeTolerance::Dependent)
        .kind(ExecutorKind::Faer, OperationKind::Convolution);
    let agnostic = Mock::new("agnostic", ShapeTolerance::Agnostic);
    let catalog = catalog(vec![dependent, agnostic]);
    let config = config(Precision::F32);
    let memory = memory_for(&config, &[0.0; 4])?;
    let factory = ExecutorFactory::new(&config, &catalog, context())?;
    factory.make(&config, &memory)?;
    assert_eq!(factory.instantiated(), 1);
    Ok(())
}

#[test]
fn adaptation_converts_around_an_f32_only_executor() -> Result<()> {
    let mock = Mock::new("f32_only", ShapeTolerance::Agnostic).answering(Answer::RequireF32);
    let calls = mock.calls();
    let catalog = catalog(vec![mock]);
    let config = config(Precision::Bf16);
    let memory = memory_for(&config, &[0.5, -1.0, 2.0, 8.0])?;
    let context = context();
    let factory = ExecutorFactory::new(&config, &catalog, context.clone())?;

    let required = factory.preconfigure_memory_descriptors(&config)?;
    assert!(required
        .src
        .iter()
        .take(2)
        .chain(&required.dst)
        .all(|desc| desc.precision() == Precision::F32));
    // the absent bias stays absent
    assert_eq!(required.src[2].precision(), Precision::Undefined);
    assert_eq!(Calls::get(&calls.instantiate), 0);

    let executor = factory.make(&config, &memory)?;
    executor.execute(&memory)?;
    let TensorData::Bf16(out) = memory[&ArgId::Dst].read()?.clone() else {
        panic!("caller's destination keeps its precision");
    };
    let out: Vec<f32> = out.iter().map(|value| value.to_f32()).collect();
    assert_eq!(out, vec![0.5, -1.0, 2.0, 8.0]);

    // new input values flow through the per-call conversion
    *memory[&ArgId::Src].write()? = convert::from_f32(&[1.0, 1.0, 1.0, 1.0], Precision::Bf16)?;
    executor.execute(&memory)?;
    assert_eq!(
        convert::to_f32(&*memory[&ArgId::Dst].read()?)?,
        vec![1.0, 1.0, 1.0, 1.0]
    );

    let report = context.diagnostics().report();
    assert_eq!(report.phases["fallback"].calls, 1);
    assert_eq!(report.caches["weights"].misses, 1);
    assert_eq!(Calls::get(&calls.execute), 2);

    // descriptors of a fallback executor are fixed
    let mut other = config.descs.clone();
    other.src[0] = MemoryDesc::planar(Precision::F16, &[1, 4]);
    assert!(executor.update(&other, &memory).is_err());
    executor.update(&config.descs, &memory)?;
    Ok(())
}

#[test]
fn adjusted_configs_may_only_change_precisions_and_layouts() -> Result<()> {
    for answer in [
        Answer::ChangeAttrs,
        Answer::ChangeShapes,
        Answer::ChangeDstShape,
        Answer::ChangePostOps,
        Answer::NeverSatisfied,
    ] {
        let catalog = catalog(vec![
            Mock::new("liar", ShapeTolerance::Agnostic).answering(answer)
        ]);
        let config = config(Precision::F32);
        let memory = memory_for(&config, &[1.0; 4])?;
        let factory = ExecutorFactory::new(&config, &catalog, context())?;
        match factory.make(&config, &memory) {
            Err(ExecutorError::InternalComplianceViolation { implementation, .. }) => {
                assert_eq!(implementation, "liar");
            }
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("violation must be detected"),
        }
    }
    Ok(())
}

#[test]
fn preconfigure_builds_the_inner_executor_of_a_fallback() -> Result<()> {
    let mock = Mock::new("f32_only", ShapeTolerance::Agnostic).answering(Answer::RequireF32);
    let calls = mock.calls();
    let catalog = catalog(vec![mock]);
    let config = config(Precision::Bf16);
    let memory = memory_for(&config, &[1.0; 4])?;
    let factory = ExecutorFactory::new(&config, &catalog, context())?;

    factory.preconfigure(&config, &memory)?;
    assert_eq!(Calls::get(&calls.instantiate), 1);
    factory.make(&config, &memory)?;
    assert_eq!(Calls::get(&calls.instantiate), 1);

    let never = catalog_with(Answer::NeverSatisfied);
    let factory = ExecutorFactory::new(&config, &never, context())?;
    assert!(matches!(
        factory.preconfigure(&config, &memory),
        Err(ExecutorError::InternalComplianceViolation { .. })
    ));
    Ok(())
}

fn catalog_with(answer: Answer) -> ImplementationCatalog<FcAttrs> {
    catalog(vec![Mock::new("mock", ShapeTolerance::Agnostic).answering(answer)])
}
