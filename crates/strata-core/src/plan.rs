//! Execution-plan construction
//!
//! A plan is built once per operator instance and direction:
//!
//! ```text
//! ShapeDescriptor ─► OpDesc (layout `any`) ─► primitive_desc() ─► compile()
//!                                                   │
//!                          internal layout == caller layout?
//!                        yes │                          │ no
//!                            ▼                          ▼
//!                 [softmax(user → user)]   [reorder(user → persistent),
//!                                           softmax(persistent → persistent),
//!                                           reorder(persistent → user)]
//! ```
//!
//! Steps refer to buffers through [`Slot`]s that are resolved against the
//! instance's [`MemoryBinding`] at submission time, so rebinding user memory
//! never requires rebuilding the plan.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strata_backends::{
    ArgRole, BackendError, DataType, ExecArgs, MemoryDesc, MemoryFormat, OpDesc, Primitive, PrimitiveDesc, PropKind,
    Step, StreamHandle,
};

use crate::engine::Engine;
use crate::error::{BackendPhase, Error, Result};
use crate::memory::{MemoryBinding, MemoryKind, Slot};
use crate::shape::ShapeDescriptor;

/// Pass a plan computes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub const fn operation(self) -> &'static str {
        match self {
            Direction::Forward => "softmax_forward",
            Direction::Backward => "softmax_backward",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.operation())
    }
}

/// Outcome of layout negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayoutDecision {
    /// The backend computes directly on the caller's buffers
    ZeroCopy,
    /// The backend computes on persistent buffers in `internal` layout
    Reordered {
        user: MemoryFormat,
        internal: MemoryFormat,
    },
}

/// One step of a plan with its buffers still symbolic
#[derive(Debug, Clone)]
pub struct PlannedStep {
    primitive: Arc<Primitive>,
    args: Vec<(ArgRole, Slot)>,
}

impl PlannedStep {
    fn new(primitive: Arc<Primitive>, args: Vec<(ArgRole, Slot)>) -> Self {
        Self { primitive, args }
    }

    pub fn primitive(&self) -> &Arc<Primitive> {
        &self.primitive
    }

    pub fn args(&self) -> &[(ArgRole, Slot)] {
        &self.args
    }

    pub fn is_reorder(&self) -> bool {
        matches!(self.primitive.desc().op(), OpDesc::Reorder { .. })
    }

    /// Whether the step writes the buffer it binds to `role`
    pub fn writes(&self, role: ArgRole) -> bool {
        match self.primitive.desc().op() {
            OpDesc::SoftmaxBackward { .. } => role == ArgRole::DiffSrc,
            OpDesc::SoftmaxForward { .. } | OpDesc::Reorder { .. } => role == ArgRole::Dst,
        }
    }

    fn resolve(&self, binding: &MemoryBinding) -> Result<Step> {
        let mut args = ExecArgs::new();
        for &(role, slot) in &self.args {
            args.insert(role, binding.resolve(slot)?);
        }
        Ok(Step::new(Arc::clone(&self.primitive), args))
    }
}

/// A compiled, immutable softmax plan for one direction
#[derive(Debug)]
pub struct ExecutionPlan {
    direction: Direction,
    shape: ShapeDescriptor,
    data_type: DataType,
    op_desc: OpDesc,
    primitive_desc: PrimitiveDesc,
    primitive: Arc<Primitive>,
    steps: Vec<PlannedStep>,
    layout: LayoutDecision,
    persistent: Vec<(MemoryKind, usize)>,
}

fn compile_error(source: BackendError) -> Error {
    Error::backend(BackendPhase::Compile)(source)
}

fn compile_reorder(engine: &Engine, src: &MemoryDesc, dst: &MemoryDesc) -> Result<Arc<Primitive>> {
    let op = OpDesc::reorder(src.clone(), dst.clone()).map_err(compile_error)?;
    let pd = engine.primitive_desc(&op, None)?;
    engine.compile(&pd)
}

fn with_scratch(mut args: Vec<(ArgRole, Slot)>, scratch_bytes: usize) -> Vec<(ArgRole, Slot)> {
    if scratch_bytes > 0 {
        args.push((ArgRole::Scratchpad, Slot::Scratch));
    }
    args
}

impl ExecutionPlan {
    /// Build the forward plan for `shape` with caller buffers in `user_format`
    pub(crate) fn forward(
        engine: &Engine,
        shape: &ShapeDescriptor,
        user_format: MemoryFormat,
        data_type: DataType,
    ) -> Result<Self> {
        shape.validate_axis()?;

        let user = MemoryDesc::new(shape.dims().to_vec(), data_type, user_format).map_err(compile_error)?;
        let logical = user.with_format(MemoryFormat::Any).map_err(compile_error)?;
        let op_desc =
            OpDesc::softmax_forward(PropKind::ForwardTraining, logical, shape.axis()).map_err(compile_error)?;

        let primitive_desc = engine.primitive_desc(&op_desc, None)?;
        let primitive = engine.compile(&primitive_desc)?;
        let internal = primitive_desc.dst_desc().clone();
        let scratch_bytes = primitive_desc.scratchpad_bytes();

        let (steps, layout, persistent) = if internal.format() == user_format {
            let core = with_scratch(
                vec![
                    (ArgRole::Src, Slot::User(MemoryKind::Src)),
                    (ArgRole::Dst, Slot::User(MemoryKind::Dst)),
                ],
                scratch_bytes,
            );
            (vec![PlannedStep::new(Arc::clone(&primitive), core)], LayoutDecision::ZeroCopy, Vec::new())
        } else {
            let to_internal = compile_reorder(engine, &user, &internal)?;
            let to_user = compile_reorder(engine, &internal, &user)?;
            let core = with_scratch(
                vec![
                    (ArgRole::Src, Slot::Persistent(MemoryKind::Src)),
                    (ArgRole::Dst, Slot::Persistent(MemoryKind::Dst)),
                ],
                scratch_bytes,
            );
            let steps = vec![
                PlannedStep::new(
                    to_internal,
                    vec![
                        (ArgRole::Src, Slot::User(MemoryKind::Src)),
                        (ArgRole::Dst, Slot::Persistent(MemoryKind::Src)),
                    ],
                ),
                PlannedStep::new(Arc::clone(&primitive), core),
                PlannedStep::new(
                    to_user,
                    vec![
                        (ArgRole::Src, Slot::Persistent(MemoryKind::Dst)),
                        (ArgRole::Dst, Slot::User(MemoryKind::Dst)),
                    ],
                ),
            ];
            let layout = LayoutDecision::Reordered {
                user: user_format,
                internal: internal.format(),
            };
            let bytes = internal.size_bytes();
            (steps, layout, vec![(MemoryKind::Src, bytes), (MemoryKind::Dst, bytes)])
        };

        Ok(Self {
            direction: Direction::Forward,
            shape: shape.clone(),
            data_type,
            op_desc,
            primitive_desc,
            primitive,
            steps,
            layout,
            persistent,
        })
    }

    /// Build the backward plan, agreeing with `forward` on the data layout
    pub(crate) fn backward(
        engine: &Engine,
        shape: &ShapeDescriptor,
        user_format: MemoryFormat,
        data_type: DataType,
        forward: &ExecutionPlan,
    ) -> Result<Self> {
        shape.validate_axis()?;

        let user = MemoryDesc::new(shape.dims().to_vec(), data_type, user_format).map_err(compile_error)?;
        let logical = user.with_format(MemoryFormat::Any).map_err(compile_error)?;
        let op_desc = OpDesc::softmax_backward(logical.clone(), logical, shape.axis()).map_err(compile_error)?;

        let primitive_desc = engine.primitive_desc(&op_desc, Some(&forward.primitive_desc))?;
        let primitive = engine.compile(&primitive_desc)?;
        let scratch_bytes = primitive_desc.scratchpad_bytes();
        let data_format = primitive_desc.dst_desc().format();
        let diff_internal = primitive_desc.diff_desc().cloned().ok_or_else(|| {
            compile_error(BackendError::invalid_descriptor(
                "backward primitive descriptor carries no gradient layout",
            ))
        })?;

        // The forward output is read where the forward plan left it
        let forward_output = if data_format == user_format {
            Slot::User(MemoryKind::Dst)
        } else if forward.internal_format() == Some(data_format) {
            Slot::Persistent(MemoryKind::Dst)
        } else {
            return Err(compile_error(BackendError::invalid_descriptor(format!(
                "backward wants the forward output in {data_format}, forward produced {}",
                forward.primitive_desc.dst_desc().format()
            ))));
        };

        let mut steps = Vec::with_capacity(3);
        let mut persistent = Vec::new();

        let core_args = if diff_internal.format() == user_format {
            vec![
                (ArgRole::Dst, forward_output),
                (ArgRole::DiffDst, Slot::User(MemoryKind::DiffDst)),
                (ArgRole::DiffSrc, Slot::User(MemoryKind::DiffSrc)),
            ]
        } else {
            let to_internal = compile_reorder(engine, &user, &diff_internal)?;
            steps.push(PlannedStep::new(
                to_internal,
                vec![
                    (ArgRole::Src, Slot::User(MemoryKind::DiffDst)),
                    (ArgRole::Dst, Slot::Persistent(MemoryKind::DiffDst)),
                ],
            ));
            let bytes = diff_internal.size_bytes();
            persistent.push((MemoryKind::DiffDst, bytes));
            persistent.push((MemoryKind::DiffSrc, bytes));
            vec![
                (ArgRole::Dst, forward_output),
                (ArgRole::DiffDst, Slot::Persistent(MemoryKind::DiffDst)),
                (ArgRole::DiffSrc, Slot::Persistent(MemoryKind::DiffSrc)),
            ]
        };
        steps.push(PlannedStep::new(Arc::clone(&primitive), with_scratch(core_args, scratch_bytes)));

        if diff_internal.format() != user_format {
            let to_user = compile_reorder(engine, &diff_internal, &user)?;
            steps.push(PlannedStep::new(
                to_user,
                vec![
                    (ArgRole::Src, Slot::Persistent(MemoryKind::DiffSrc)),
                    (ArgRole::Dst, Slot::User(MemoryKind::DiffSrc)),
                ],
            ));
        }

        let layout = if data_format == user_format && diff_internal.format() == user_format {
            LayoutDecision::ZeroCopy
        } else {
            LayoutDecision::Reordered {
                user: user_format,
                internal: diff_internal.format(),
            }
        };

        Ok(Self {
            direction: Direction::Backward,
            shape: shape.clone(),
            data_type,
            op_desc,
            primitive_desc,
            primitive,
            steps,
            layout,
            persistent,
        })
    }

    /// Resolve every slot against `binding` and run the sequence on `stream`
    pub(crate) fn submit(&self, engine: &Engine, stream: StreamHandle, binding: &MemoryBinding) -> Result<()> {
        let steps = self
            .steps
            .iter()
            .map(|step| step.resolve(binding))
            .collect::<Result<Vec<_>>>()?;
        engine.execute(stream, &steps)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn shape(&self) -> &ShapeDescriptor {
        &self.shape
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Logical operation, layouts left as `any`
    pub fn op_desc(&self) -> &OpDesc {
        &self.op_desc
    }

    /// Negotiated descriptor of the softmax primitive
    pub fn primitive_desc(&self) -> &PrimitiveDesc {
        &self.primitive_desc
    }

    /// The compiled softmax primitive (reorders excluded)
    pub fn primitive(&self) -> &Arc<Primitive> {
        &self.primitive
    }

    pub fn steps(&self) -> &[PlannedStep] {
        &self.steps
    }

    pub fn reorder_count(&self) -> usize {
        self.steps.iter().filter(|s| s.is_reorder()).count()
    }

    pub fn scratch_bytes(&self) -> usize {
        self.primitive_desc.scratchpad_bytes()
    }

    pub fn layout(&self) -> LayoutDecision {
        self.layout
    }

    pub fn is_zero_copy(&self) -> bool {
        self.layout == LayoutDecision::ZeroCopy
    }

    /// Layout the backend computes in when it differs from the caller's
    pub fn internal_format(&self) -> Option<MemoryFormat> {
        match self.layout {
            LayoutDecision::ZeroCopy => None,
            LayoutDecision::Reordered { internal, .. } => Some(internal),
        }
    }

    /// Persistent buffers the plan needs, by role and size in bytes
    pub fn persistent_requirements(&self) -> &[(MemoryKind, usize)] {
        &self.persistent
    }

    /// Roles whose result the softmax step writes into persistent memory
    pub fn persistent_outputs(&self) -> impl Iterator<Item = MemoryKind> + '_ {
        self.steps
            .iter()
            .filter(|s| Arc::ptr_eq(&s.primitive, &self.primitive))
            .flat_map(|s| s.args.iter().filter(|&&(role, _)| s.writes(role)))
            .filter_map(|&(_, slot)| match slot {
                Slot::Persistent(kind) => Some(kind),
                _ => None,
            })
    }

    /// True when some step reads `kind` from persistent memory without an
    /// earlier step of the same plan producing it
    pub fn reads_stale_persistent(&self, kind: MemoryKind) -> bool {
        let target = Slot::Persistent(kind);
        for step in &self.steps {
            if let Some(&(role, _)) = step.args.iter().find(|&&(_, slot)| slot == target) {
                return !step.writes(role);
            }
        }
        false
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            direction: self.direction,
            dims: self.shape.dims().to_vec(),
            axis: self.shape.axis(),
            data_type: self.data_type,
            layout: self.layout,
            primitive: self.primitive.to_string(),
            steps: self
                .steps
                .iter()
                .map(|s| StepSummary {
                    primitive: s.primitive.to_string(),
                    args: s.args.clone(),
                })
                .collect(),
            scratch_bytes: self.scratch_bytes(),
            persistent_bytes: self.persistent.iter().map(|(_, bytes)| bytes).sum(),
        }
    }

    /// Pretty JSON rendering of [`summary`](ExecutionPlan::summary)
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.summary())
    }
}

/// Serializable description of a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub direction: Direction,
    pub dims: Vec<usize>,
    pub axis: usize,
    pub data_type: DataType,
    pub layout: LayoutDecision,
    pub primitive: String,
    pub steps: Vec<StepSummary>,
    pub scratch_bytes: usize,
    pub persistent_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSummary {
    pub primitive: String,
    pub args: Vec<(ArgRole, Slot)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineConfig;

    fn engine() -> Engine {
        Engine::with_config(EngineConfig::default()).unwrap()
    }

    #[test]
    fn rank2_forward_is_zero_copy() {
        let engine = engine();
        let shape = ShapeDescriptor::new([4, 10], 1).unwrap();
        let plan = ExecutionPlan::forward(&engine, &shape, MemoryFormat::Nc, DataType::F32).unwrap();

        assert!(plan.is_zero_copy());
        assert_eq!(plan.steps().len(), 1);
        assert_eq!(plan.reorder_count(), 0);
        assert_eq!(plan.scratch_bytes(), 0);
        assert!(plan.persistent_requirements().is_empty());
        assert_eq!(plan.persistent_outputs().count(), 0);
    }

    #[test]
    fn blocked_rank4_forward_reorders_through_persistent_memory() {
        let engine = engine();
        let shape = ShapeDescriptor::new([2, 8, 3, 3], 1).unwrap();
        let plan = ExecutionPlan::forward(&engine, &shape, MemoryFormat::Nchw, DataType::F32).unwrap();

        assert_eq!(
            plan.layout(),
            LayoutDecision::Reordered {
                user: MemoryFormat::Nchw,
                internal: MemoryFormat::NChwXc(8)
            }
        );
        assert_eq!(plan.steps().len(), 3);
        assert_eq!(plan.reorder_count(), 2);
        // inner = 3 * 3 positions, running max and sum each
        assert_eq!(plan.scratch_bytes(), 2 * 9 * 4);
        assert_eq!(plan.persistent_outputs().collect::<Vec<_>>(), vec![MemoryKind::Dst]);
        assert!(!plan.reads_stale_persistent(MemoryKind::Dst));
    }

    #[test]
    fn backward_reads_forward_output_in_place() {
        let engine = engine();
        let shape = ShapeDescriptor::new([1, 8, 2, 2], 2).unwrap();
        let forward = ExecutionPlan::forward(&engine, &shape, MemoryFormat::Nchw, DataType::F64).unwrap();
        let backward =
            ExecutionPlan::backward(&engine, &shape, MemoryFormat::Nchw, DataType::F64, &forward).unwrap();

        assert_eq!(backward.direction(), Direction::Backward);
        assert_eq!(backward.reorder_count(), 2);
        assert!(backward.reads_stale_persistent(MemoryKind::Dst));
        assert_eq!(backward.persistent_outputs().collect::<Vec<_>>(), vec![MemoryKind::DiffSrc]);
    }

    #[test]
    fn invalid_axis_fails_before_touching_backend() {
        let engine = engine();
        let shape = ShapeDescriptor::new([2, 3, 4, 5], 4).unwrap();
        let err = ExecutionPlan::forward(&engine, &shape, MemoryFormat::Nchw, DataType::F32).unwrap_err();
        assert!(matches!(err, Error::InvalidAxis { axis: 4, rank: 4 }));
        assert_eq!(engine.with_cpu_backend(|cpu| cpu.stats().compiled), Some(0));
    }

    #[test]
    fn summary_serializes() {
        let engine = engine();
        let shape = ShapeDescriptor::new([2, 8, 1, 1], 1).unwrap();
        let plan = ExecutionPlan::forward(&engine, &shape, MemoryFormat::Nchw, DataType::F32).unwrap();

        let summary = plan.summary();
        assert_eq!(summary.steps.len(), 3);
        assert_eq!(summary.persistent_bytes, 2 * 2 * 8 * 4);

        let json = plan.to_json().unwrap();
        let parsed: PlanSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, summary);
        assert!(json.contains("NChwXc"));
    }
}
