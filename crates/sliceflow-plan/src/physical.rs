//! Physical lowering.
//!
//! Turns a logical plan into handler descriptions plus the
//! physical operators (build, trigger, probe, combine) that share them:
//!
//! ```text
//! Source (n partitions)
//!   └─ WindowAggregation ─► n < thresholds : 1 handler, n builds, 1 trigger
//!                         ─► otherwise     : n partial handlers ─► combiner
//!
//! Source L, Source R
//!   └─ Join ─► 1 handler, left builds + right builds, 1 probe
//! ```
//!
//! Every input stream (a source partition or the output of an upstream
//! windowed operator) gets its own [`OriginId`], so a handler's watermark
//! is the minimum over exactly the streams that feed it.

use std::fmt;
use std::sync::Arc;

use arrow_schema::SchemaRef;
use serde::{Deserialize, Serialize};
use sliceflow_core::operator::aggregation::{
    AggregationOperatorHandler, EmitMode, WindowAggregationConfig, WindowCombiner,
};
use sliceflow_core::operator::handler::{OperatorHandlerId, PipelineExecutionContext};
use sliceflow_core::operator::hash_join::{
    HashJoinConfig, JoinOperatorHandler, JoinSide, JoinStrategy,
};
use sliceflow_core::time::OriginId;

use crate::error::PlanError;
use crate::logical::{LogicalOperator, LogicalPlan, OperatorId};
use crate::translator::{translate_aggregation, translate_join};

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Knobs of the physical lowering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoweringOptions {
    /// Minimum number of input streams before an aggregation is split
    /// into per-stream partial aggregations
    pub distributed_window_child_threshold: usize,
    /// Minimum number of input streams before a combiner stage is inserted
    pub distributed_window_combiner_threshold: usize,
    /// Probe strategy of every join
    pub join_strategy: JoinStrategy,
    /// Id of the first handler; later handlers count up from it
    pub first_handler_id: u64,
}

impl Default for LoweringOptions {
    fn default() -> Self {
        Self {
            distributed_window_child_threshold: 2,
            distributed_window_combiner_threshold: 4,
            join_strategy: JoinStrategy::HashJoin,
            first_handler_id: 1,
        }
    }
}

impl LoweringOptions {
    /// Parses options from JSON; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Json`] for malformed JSON and
    /// [`PlanError::InvalidOptions`] for invalid values.
    pub fn from_json(json: &str) -> Result<Self, PlanError> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Checks the thresholds.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::InvalidOptions`] if a threshold is zero.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.distributed_window_child_threshold == 0
            || self.distributed_window_combiner_threshold == 0
        {
            return Err(PlanError::InvalidOptions(
                "distributed window thresholds must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Returns true if an aggregation over `streams` input streams is
    /// split into partial children and a combiner.
    #[must_use]
    pub fn distributes(&self, streams: usize) -> bool {
        streams >= self.distributed_window_child_threshold
            && streams >= self.distributed_window_combiner_threshold
    }
}

// ---------------------------------------------------------------------------
// Physical plan
// ---------------------------------------------------------------------------

/// Where a build operator reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamInput {
    /// One partition of a source
    Source {
        /// Source operator
        source: OperatorId,
        /// Partition index
        partition: usize,
    },
    /// Output of an upstream windowed operator
    Operator(OperatorId),
}

impl fmt::Display for StreamInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source { source, partition } => write!(f, "{source}[{partition}]"),
            Self::Operator(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Stream {
    input: StreamInput,
    origin: OriginId,
}

/// A handler to instantiate.
#[derive(Debug, Clone)]
pub enum HandlerSpec {
    /// Windowed aggregation handler
    Aggregation {
        /// Handler id
        id: OperatorHandlerId,
        /// Logical operator it implements
        operator: OperatorId,
        /// Engine configuration
        config: WindowAggregationConfig,
        /// Schema of build input
        input_schema: SchemaRef,
        /// Streams feeding it
        origins: Vec<OriginId>,
    },
    /// Windowed join handler
    Join {
        /// Handler id
        id: OperatorHandlerId,
        /// Logical operator it implements
        operator: OperatorId,
        /// Engine configuration
        config: HashJoinConfig,
        /// Streams feeding either side
        origins: Vec<OriginId>,
    },
}

impl HandlerSpec {
    /// Handler id.
    #[must_use]
    pub fn id(&self) -> OperatorHandlerId {
        match self {
            Self::Aggregation { id, .. } | Self::Join { id, .. } => *id,
        }
    }

    /// Logical operator the handler implements.
    #[must_use]
    pub fn operator(&self) -> OperatorId {
        match self {
            Self::Aggregation { operator, .. } | Self::Join { operator, .. } => *operator,
        }
    }
}

/// Combiner stage of a distributed aggregation.
#[derive(Debug, Clone)]
pub struct CombinerSpec {
    /// Logical aggregation it completes
    pub operator: OperatorId,
    /// Final-mode configuration of the aggregation
    pub config: WindowAggregationConfig,
    /// Schema of the children's build input
    pub input_schema: SchemaRef,
    /// Partial-mode children
    pub children: Vec<OperatorHandlerId>,
}

/// A physical operator instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhysicalOperator {
    /// Folds one input stream into an aggregation handler
    AggregationBuild {
        /// Target handler
        handler: OperatorHandlerId,
        /// Stream read
        input: StreamInput,
        /// Origin under which the stream reports watermarks
        origin: OriginId,
    },
    /// Emits closed windows of an aggregation handler
    AggregationTrigger {
        /// Source handler
        handler: OperatorHandlerId,
    },
    /// Merges the partial windows of distributed children
    Combine {
        /// Logical aggregation
        operator: OperatorId,
        /// Children merged
        children: Vec<OperatorHandlerId>,
    },
    /// Stores one input stream in a join handler
    JoinBuild {
        /// Target handler
        handler: OperatorHandlerId,
        /// Join input fed
        side: JoinSide,
        /// Stream read
        input: StreamInput,
        /// Origin under which the stream reports watermarks
        origin: OriginId,
    },
    /// Emits joined windows of a join handler
    JoinProbe {
        /// Source handler
        handler: OperatorHandlerId,
    },
}

impl fmt::Display for PhysicalOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AggregationBuild { handler, input, origin } => {
                write!(f, "AggregationBuild(handler={handler}, input={input}, origin={})", origin.0)
            }
            Self::AggregationTrigger { handler } => write!(f, "AggregationTrigger(handler={handler})"),
            Self::Combine { operator, children } => {
                let children: Vec<String> = children.iter().map(ToString::to_string).collect();
                write!(f, "Combine({operator}, children=[{}])", children.join(", "))
            }
            Self::JoinBuild {
                handler,
                side,
                input,
                origin,
            } => write!(
                f,
                "JoinBuild(handler={handler}, side={side}, input={input}, origin={})",
                origin.0
            ),
            Self::JoinProbe { handler } => write!(f, "JoinProbe(handler={handler})"),
        }
    }
}

/// Result of lowering one root operator.
#[derive(Debug, Clone)]
pub struct PhysicalPlan {
    root: OperatorId,
    output_schema: SchemaRef,
    handlers: Vec<HandlerSpec>,
    combiners: Vec<CombinerSpec>,
    operators: Vec<PhysicalOperator>,
}

impl PhysicalPlan {
    /// Root logical operator.
    #[must_use]
    pub fn root(&self) -> OperatorId {
        self.root
    }

    /// Schema of the root's output.
    #[must_use]
    pub fn output_schema(&self) -> &SchemaRef {
        &self.output_schema
    }

    /// Handlers, upstream first.
    #[must_use]
    pub fn handlers(&self) -> &[HandlerSpec] {
        &self.handlers
    }

    /// Combiner stages.
    #[must_use]
    pub fn combiners(&self) -> &[CombinerSpec] {
        &self.combiners
    }

    /// Physical operators, upstream first.
    #[must_use]
    pub fn operators(&self) -> &[PhysicalOperator] {
        &self.operators
    }

    /// Creates every handler and combiner and installs the handlers into
    /// `ctx`, which starts them.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Operator`] if a handler cannot be created or an
    /// id is already registered in `ctx`.
    pub fn install(&self, ctx: &PipelineExecutionContext) -> Result<InstalledPlan, PlanError> {
        let mut installed = InstalledPlan::default();
        for spec in &self.handlers {
            match spec {
                HandlerSpec::Aggregation {
                    id,
                    config,
                    input_schema,
                    origins,
                    ..
                } => {
                    let handler = Arc::new(AggregationOperatorHandler::new(
                        *id,
                        config.clone(),
                        Arc::clone(input_schema),
                        origins,
                        ctx.config(),
                    )?);
                    ctx.install(Arc::clone(&handler))?;
                    installed.aggregations.push(handler);
                }
                HandlerSpec::Join {
                    id, config, origins, ..
                } => {
                    let handler = Arc::new(JoinOperatorHandler::new(
                        *id,
                        config.clone(),
                        origins,
                        ctx.config(),
                    )?);
                    ctx.install(Arc::clone(&handler))?;
                    installed.joins.push(handler);
                }
            }
        }
        for spec in &self.combiners {
            let children: Vec<u64> = spec.children.iter().map(|id| id.0).collect();
            let combiner = WindowCombiner::new(&spec.config, &spec.input_schema, &children, ctx.config())?;
            installed.combiners.push((spec.operator, Arc::new(combiner)));
        }
        tracing::info!(
            query = ctx.query_id(),
            handlers = self.handlers.len(),
            combiners = self.combiners.len(),
            "installed physical plan"
        );
        Ok(installed)
    }
}

impl fmt::Display for PhysicalPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Physical plan for {} ({} handlers, {} operators)",
            self.root,
            self.handlers.len(),
            self.operators.len()
        )?;
        for operator in &self.operators {
            writeln!(f, "  {operator}")?;
        }
        Ok(())
    }
}

/// Handlers and combiners created from a [`PhysicalPlan`].
#[derive(Debug, Default)]
pub struct InstalledPlan {
    /// Aggregation handlers, in plan order
    pub aggregations: Vec<Arc<AggregationOperatorHandler>>,
    /// Join handlers, in plan order
    pub joins: Vec<Arc<JoinOperatorHandler>>,
    /// Combiners with the aggregation they complete
    pub combiners: Vec<(OperatorId, Arc<WindowCombiner>)>,
}

// ---------------------------------------------------------------------------
// Lowering
// ---------------------------------------------------------------------------

struct Lowering<'a> {
    plan: &'a LogicalPlan,
    options: &'a LoweringOptions,
    next_handler: u64,
    next_origin: u64,
    handlers: Vec<HandlerSpec>,
    combiners: Vec<CombinerSpec>,
    operators: Vec<PhysicalOperator>,
}

impl Lowering<'_> {
    fn handler_id(&mut self) -> OperatorHandlerId {
        let id = OperatorHandlerId(self.next_handler);
        self.next_handler += 1;
        id
    }

    fn stream(&mut self, input: StreamInput) -> Stream {
        let origin = OriginId(self.next_origin);
        self.next_origin += 1;
        Stream { input, origin }
    }

    fn lower(&mut self, id: OperatorId) -> Result<Vec<Stream>, PlanError> {
        let plan = self.plan;
        match plan.operator(id)? {
            LogicalOperator::Source { partitions, .. } => Ok((0..*partitions)
                .map(|partition| {
                    self.stream(StreamInput::Source {
                        source: id,
                        partition,
                    })
                })
                .collect()),
            LogicalOperator::WindowAggregation { input, .. } => {
                let streams = self.lower(*input)?;
                if self.options.distributes(streams.len()) {
                    self.lower_distributed_aggregation(id, &streams)?;
                } else {
                    self.lower_aggregation(id, &streams)?;
                }
                Ok(vec![self.stream(StreamInput::Operator(id))])
            }
            LogicalOperator::Join { left, right, .. } => {
                let (left, right) = (*left, *right);
                let left = self.lower(left)?;
                let right = self.lower(right)?;
                self.lower_join(id, &left, &right)?;
                Ok(vec![self.stream(StreamInput::Operator(id))])
            }
        }
    }

    fn lower_aggregation(&mut self, operator: OperatorId, streams: &[Stream]) -> Result<(), PlanError> {
        let (config, input_schema) = translate_aggregation(self.plan, operator, EmitMode::Final)?;
        let handler = self.handler_id();
        self.operators
            .extend(streams.iter().map(|stream| PhysicalOperator::AggregationBuild {
                handler,
                input: stream.input,
                origin: stream.origin,
            }));
        self.operators
            .push(PhysicalOperator::AggregationTrigger { handler });
        self.handlers.push(HandlerSpec::Aggregation {
            id: handler,
            operator,
            config,
            input_schema,
            origins: streams.iter().map(|s| s.origin).collect(),
        });
        tracing::debug!(%operator, %handler, streams = streams.len(), "lowered window aggregation");
        Ok(())
    }

    fn lower_distributed_aggregation(
        &mut self,
        operator: OperatorId,
        streams: &[Stream],
    ) -> Result<(), PlanError> {
        let (config, input_schema) = translate_aggregation(self.plan, operator, EmitMode::Partial)?;
        let mut children = Vec::with_capacity(streams.len());
        for stream in streams {
            let handler = self.handler_id();
            self.operators.push(PhysicalOperator::AggregationBuild {
                handler,
                input: stream.input,
                origin: stream.origin,
            });
            self.operators
                .push(PhysicalOperator::AggregationTrigger { handler });
            self.handlers.push(HandlerSpec::Aggregation {
                id: handler,
                operator,
                config: config.clone(),
                input_schema: Arc::clone(&input_schema),
                origins: vec![stream.origin],
            });
            children.push(handler);
        }
        self.operators.push(PhysicalOperator::Combine {
            operator,
            children: children.clone(),
        });
        self.combiners.push(CombinerSpec {
            operator,
            config: config.with_emit_mode(EmitMode::Final),
            input_schema,
            children,
        });
        tracing::debug!(%operator, children = streams.len(), "lowered distributed window aggregation");
        Ok(())
    }

    fn lower_join(&mut self, operator: OperatorId, left: &[Stream], right: &[Stream]) -> Result<(), PlanError> {
        let config = translate_join(self.plan, operator, self.options.join_strategy)?;
        let handler = self.handler_id();
        for (side, streams) in [(JoinSide::Left, left), (JoinSide::Right, right)] {
            self.operators
                .extend(streams.iter().map(|stream| PhysicalOperator::JoinBuild {
                    handler,
                    side,
                    input: stream.input,
                    origin: stream.origin,
                }));
        }
        self.operators.push(PhysicalOperator::JoinProbe { handler });
        self.handlers.push(HandlerSpec::Join {
            id: handler,
            operator,
            config,
            origins: left.iter().chain(right).map(|s| s.origin).collect(),
        });
        tracing::debug!(%operator, %handler, "lowered window join");
        Ok(())
    }
}

/// Lowers the sub-plan rooted at `root`.
///
/// # Errors
///
/// Returns [`PlanError::InvalidOptions`] for invalid options,
/// [`PlanError::UnknownOperator`] for ids outside `plan`, and translation
/// errors of the windowed operators.
pub fn lower(
    plan: &LogicalPlan,
    root: OperatorId,
    options: &LoweringOptions,
) -> Result<PhysicalPlan, PlanError> {
    options.validate()?;
    let mut lowering = Lowering {
        plan,
        options,
        next_handler: options.first_handler_id,
        next_origin: 0,
        handlers: Vec::new(),
        combiners: Vec::new(),
        operators: Vec::new(),
    };
    lowering.lower(root)?;
    let physical = PhysicalPlan {
        root,
        output_schema: plan.schema(root)?,
        handlers: lowering.handlers,
        combiners: lowering.combiners,
        operators: lowering.operators,
    };
    tracing::info!(
        root = %root,
        handlers = physical.handlers.len(),
        operators = physical.operators.len(),
        "lowered plan"
    );
    Ok(physical)
}
