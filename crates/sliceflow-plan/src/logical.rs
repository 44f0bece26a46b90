//! Arena-based logical plan.
//!
//! Operators live in a [`LogicalPlan`] arena and refer to their inputs by
//! [`OperatorId`]. Every output [`Field`] records the id of the operator
//! that produced it, so a field can be traced back to its producer without
//! holding a reference into the plan.

use std::fmt;
use std::sync::Arc;

use arrow_schema::{DataType, Field as ArrowField, Schema, SchemaRef};
use serde::{Deserialize, Serialize};
use sliceflow_core::operator::aggregation::{AggregationKind, AggregationSpec};
use sliceflow_core::operator::WindowMetaData;
use sliceflow_core::time::TimeFunction;

use crate::error::PlanError;
use crate::translator::window::WindowDefinition;

/// Index of an operator in its [`LogicalPlan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperatorId(pub usize);

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Output field of a logical operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// Field name
    pub name: String,
    /// Arrow type
    pub data_type: DataType,
    /// Whether the field may be null
    pub nullable: bool,
    /// Operator that produced the field
    pub producer: OperatorId,
}

impl Field {
    fn from_arrow(field: &ArrowField, producer: OperatorId) -> Self {
        Self {
            name: field.name().clone(),
            data_type: field.data_type().clone(),
            nullable: field.is_nullable(),
            producer,
        }
    }

    /// Arrow field with the same name, type and nullability.
    #[must_use]
    pub fn to_arrow(&self) -> ArrowField {
        ArrowField::new(&self.name, self.data_type.clone(), self.nullable)
    }
}

/// Scalar expression over the columns of a join's inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// Column reference
    Column(String),
    /// Integer literal
    Literal(i64),
    /// `left = right`
    Eq(Box<Expr>, Box<Expr>),
    /// `left < right`
    Lt(Box<Expr>, Box<Expr>),
    /// `left > right`
    Gt(Box<Expr>, Box<Expr>),
    /// Conjunction
    And(Box<Expr>, Box<Expr>),
    /// Disjunction
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Column reference.
    #[must_use]
    pub fn col(name: impl Into<String>) -> Self {
        Self::Column(name.into())
    }

    /// Integer literal.
    #[must_use]
    pub fn lit(value: i64) -> Self {
        Self::Literal(value)
    }

    /// `self = other`
    #[must_use]
    pub fn eq(self, other: Expr) -> Self {
        Self::Eq(Box::new(self), Box::new(other))
    }

    /// `self < other`
    #[must_use]
    pub fn lt(self, other: Expr) -> Self {
        Self::Lt(Box::new(self), Box::new(other))
    }

    /// `self > other`
    #[must_use]
    pub fn gt(self, other: Expr) -> Self {
        Self::Gt(Box::new(self), Box::new(other))
    }

    /// `self AND other`
    #[must_use]
    pub fn and(self, other: Expr) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    /// `self OR other`
    #[must_use]
    pub fn or(self, other: Expr) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Column(name) => write!(f, "{name}"),
            Self::Literal(value) => write!(f, "{value}"),
            Self::Eq(l, r) => write!(f, "{l} = {r}"),
            Self::Lt(l, r) => write!(f, "{l} < {r}"),
            Self::Gt(l, r) => write!(f, "{l} > {r}"),
            Self::And(l, r) => write!(f, "({l} AND {r})"),
            Self::Or(l, r) => write!(f, "({l} OR {r})"),
        }
    }
}

/// Aggregate function call, optionally renamed with `as`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateCall {
    /// Function
    pub kind: AggregationKind,
    /// Input column, `None` for `count()`
    pub input: Option<String>,
    /// Output name given with `as`
    pub alias: Option<String>,
}

impl AggregateCall {
    /// Call of `kind` over `input`.
    #[must_use]
    pub fn new(kind: AggregationKind, input: Option<&str>) -> Self {
        Self {
            kind,
            input: input.map(str::to_string),
            alias: None,
        }
    }

    /// `sum(input)`
    #[must_use]
    pub fn sum(input: &str) -> Self {
        Self::new(AggregationKind::Sum, Some(input))
    }

    /// `min(input)`
    #[must_use]
    pub fn min(input: &str) -> Self {
        Self::new(AggregationKind::Min, Some(input))
    }

    /// `max(input)`
    #[must_use]
    pub fn max(input: &str) -> Self {
        Self::new(AggregationKind::Max, Some(input))
    }

    /// `count()`
    #[must_use]
    pub fn count() -> Self {
        Self::new(AggregationKind::Count, None)
    }

    /// `avg(input)`
    #[must_use]
    pub fn avg(input: &str) -> Self {
        Self::new(AggregationKind::Avg, Some(input))
    }

    /// `median(input)`
    #[must_use]
    pub fn median(input: &str) -> Self {
        Self::new(AggregationKind::Median, Some(input))
    }

    /// Renames the output.
    #[must_use]
    pub fn alias(mut self, name: impl Into<String>) -> Self {
        self.alias = Some(name.into());
        self
    }

    /// Output field name: the alias, or `{function}_{input}` (`count` for
    /// `count()`).
    #[must_use]
    pub fn output_name(&self) -> String {
        match (&self.alias, &self.input) {
            (Some(alias), _) => alias.clone(),
            (None, Some(input)) => format!("{}_{input}", self.kind),
            (None, None) => self.kind.name().to_string(),
        }
    }

    /// Engine-level aggregation with the resolved output name.
    #[must_use]
    pub fn to_spec(&self) -> AggregationSpec {
        AggregationSpec::new(self.kind, self.input.as_deref(), self.output_name())
    }
}

/// A logical operator.
#[derive(Debug, Clone)]
pub enum LogicalOperator {
    /// Named stream read by `partitions` parallel producers.
    Source {
        /// Stream name
        name: String,
        /// Record schema
        schema: SchemaRef,
        /// Record timestamps
        time: TimeFunction,
        /// Number of parallel producers, each reporting its own watermark
        partitions: usize,
    },
    /// Windowed aggregation.
    WindowAggregation {
        /// Input operator
        input: OperatorId,
        /// Window size and slide
        window: WindowDefinition,
        /// Grouping columns
        keys: Vec<String>,
        /// Aggregate calls, in output order
        aggregates: Vec<AggregateCall>,
        /// Window metadata field names
        meta: WindowMetaData,
        /// Timestamps of the input records
        time: TimeFunction,
    },
    /// Windowed equi-join.
    Join {
        /// Left input
        left: OperatorId,
        /// Right input
        right: OperatorId,
        /// Window size and slide
        window: WindowDefinition,
        /// Join predicate
        predicate: Expr,
        /// Window metadata field names
        meta: WindowMetaData,
        /// Timestamps of left records
        left_time: TimeFunction,
        /// Timestamps of right records
        right_time: TimeFunction,
    },
}

impl LogicalOperator {
    /// Input operators.
    #[must_use]
    pub fn inputs(&self) -> Vec<OperatorId> {
        match self {
            Self::Source { .. } => Vec::new(),
            Self::WindowAggregation { input, .. } => vec![*input],
            Self::Join { left, right, .. } => vec![*left, *right],
        }
    }

    /// Short operator name.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Source { .. } => "source",
            Self::WindowAggregation { .. } => "window_aggregation",
            Self::Join { .. } => "join",
        }
    }
}

/// Operator arena plus the output fields of every operator.
#[derive(Debug, Default)]
pub struct LogicalPlan {
    operators: Vec<LogicalOperator>,
    fields: Vec<Vec<Field>>,
}

impl LogicalPlan {
    /// Creates an empty plan.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of operators.
    #[must_use]
    pub fn len(&self) -> usize {
        self.operators.len()
    }

    /// Returns true if the plan has no operators.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// Operator `id`.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::UnknownOperator`] for ids of other plans.
    pub fn operator(&self, id: OperatorId) -> Result<&LogicalOperator, PlanError> {
        self.operators
            .get(id.0)
            .ok_or(PlanError::UnknownOperator(id))
    }

    /// Output fields of operator `id`.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::UnknownOperator`] for ids of other plans.
    pub fn fields(&self, id: OperatorId) -> Result<&[Field], PlanError> {
        self.fields
            .get(id.0)
            .map(Vec::as_slice)
            .ok_or(PlanError::UnknownOperator(id))
    }

    /// Output schema of operator `id`.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::UnknownOperator`] for ids of other plans.
    pub fn schema(&self, id: OperatorId) -> Result<SchemaRef, PlanError> {
        let fields: Vec<ArrowField> = self.fields(id)?.iter().map(Field::to_arrow).collect();
        Ok(Arc::new(Schema::new(fields)))
    }

    /// Output field `column` of operator `id`.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::ColumnNotFound`] if the operator has no such
    /// field.
    pub fn field(&self, id: OperatorId, column: &str) -> Result<&Field, PlanError> {
        self.fields(id)?
            .iter()
            .find(|field| field.name == column)
            .ok_or_else(|| PlanError::ColumnNotFound {
                operator: id,
                column: column.to_string(),
            })
    }

    /// Ids of every operator, in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = OperatorId> {
        (0..self.operators.len()).map(OperatorId)
    }

    /// Adds a source read by `partitions` producers.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::InvalidOptions`] for zero partitions and
    /// [`PlanError::Operator`] if the time function does not fit `schema`.
    pub fn add_source(
        &mut self,
        name: impl Into<String>,
        schema: SchemaRef,
        time: TimeFunction,
        partitions: usize,
    ) -> Result<OperatorId, PlanError> {
        let name = name.into();
        if partitions == 0 {
            return Err(PlanError::InvalidOptions(format!(
                "source '{name}' needs at least one partition"
            )));
        }
        time.validate_schema(&schema)
            .map_err(sliceflow_core::operator::OperatorError::from)?;
        let id = OperatorId(self.operators.len());
        let fields = schema
            .fields()
            .iter()
            .map(|field| Field::from_arrow(field, id))
            .collect();
        Ok(self.push(
            LogicalOperator::Source {
                name,
                schema,
                time,
                partitions,
            },
            fields,
        ))
    }

    /// Adds a windowed aggregation over `input`.
    ///
    /// The output fields are `[start, end, keys..., aggregates...]`.
    ///
    /// # Errors
    ///
    /// Returns the translation errors of
    /// [`crate::translator::aggregation::aggregation_fields`].
    pub fn add_window_aggregation(
        &mut self,
        input: OperatorId,
        window: WindowDefinition,
        keys: Vec<String>,
        aggregates: Vec<AggregateCall>,
        time: TimeFunction,
    ) -> Result<OperatorId, PlanError> {
        self.add_window_aggregation_with(input, window, keys, aggregates, time, WindowMetaData::default())
    }

    /// Like [`Self::add_window_aggregation`] with custom window metadata
    /// field names.
    ///
    /// # Errors
    ///
    /// See [`Self::add_window_aggregation`].
    pub fn add_window_aggregation_with(
        &mut self,
        input: OperatorId,
        window: WindowDefinition,
        keys: Vec<String>,
        aggregates: Vec<AggregateCall>,
        time: TimeFunction,
        meta: WindowMetaData,
    ) -> Result<OperatorId, PlanError> {
        window.assigner()?;
        let id = OperatorId(self.operators.len());
        let fields = crate::translator::aggregation::aggregation_fields(
            self, input, &keys, &aggregates, &meta, id,
        )?;
        Ok(self.push(
            LogicalOperator::WindowAggregation {
                input,
                window,
                keys,
                aggregates,
                meta,
                time,
            },
            fields,
        ))
    }

    /// Adds a windowed join of `left` and `right` on `predicate`.
    ///
    /// # Errors
    ///
    /// Returns the translation errors of [`crate::translator::join`].
    pub fn add_join(
        &mut self,
        left: OperatorId,
        right: OperatorId,
        window: WindowDefinition,
        predicate: Expr,
        time: TimeFunction,
    ) -> Result<OperatorId, PlanError> {
        self.add_join_with(left, right, window, predicate, time.clone(), time, WindowMetaData::default())
    }

    /// Like [`Self::add_join`] with one time function per side and custom
    /// window metadata field names.
    ///
    /// # Errors
    ///
    /// See [`Self::add_join`].
    #[allow(clippy::too_many_arguments)]
    pub fn add_join_with(
        &mut self,
        left: OperatorId,
        right: OperatorId,
        window: WindowDefinition,
        predicate: Expr,
        left_time: TimeFunction,
        right_time: TimeFunction,
        meta: WindowMetaData,
    ) -> Result<OperatorId, PlanError> {
        window.assigner()?;
        let id = OperatorId(self.operators.len());
        let schema = crate::translator::join::joined_output(self, left, right, &predicate, &meta)?;
        let fields = schema
            .fields()
            .iter()
            .map(|field| Field::from_arrow(field, id))
            .collect();
        Ok(self.push(
            LogicalOperator::Join {
                left,
                right,
                window,
                predicate,
                meta,
                left_time,
                right_time,
            },
            fields,
        ))
    }

    fn push(&mut self, operator: LogicalOperator, fields: Vec<Field>) -> OperatorId {
        let id = OperatorId(self.operators.len());
        tracing::debug!(operator = %id, kind = operator.kind(), fields = fields.len(), "added logical operator");
        self.operators.push(operator);
        self.fields.push(fields);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events() -> SchemaRef {
        Arc::new(Schema::new(vec![
            ArrowField::new("id", DataType::Int64, false),
            ArrowField::new("value", DataType::Int64, true),
            ArrowField::new("ts", DataType::UInt64, false),
        ]))
    }

    #[test]
    fn test_source_fields_carry_producer() {
        let mut plan = LogicalPlan::new();
        let source = plan
            .add_source("events", events(), TimeFunction::event_time("ts"), 2)
            .unwrap();
        let fields = plan.fields(source).unwrap();
        assert_eq!(fields.len(), 3);
        assert!(fields.iter().all(|f| f.producer == source));
        assert_eq!(plan.field(source, "value").unwrap().data_type, DataType::Int64);
        assert!(matches!(
            plan.field(source, "missing"),
            Err(PlanError::ColumnNotFound { column, .. }) if column == "missing"
        ));
    }

    #[test]
    fn test_source_validation() {
        let mut plan = LogicalPlan::new();
        assert!(matches!(
            plan.add_source("events", events(), TimeFunction::event_time("ts"), 0),
            Err(PlanError::InvalidOptions(_))
        ));
        assert!(matches!(
            plan.add_source("events", events(), TimeFunction::event_time("nope"), 1),
            Err(PlanError::Operator(_))
        ));
        assert!(plan.is_empty());
        assert!(matches!(
            plan.operator(OperatorId(3)),
            Err(PlanError::UnknownOperator(OperatorId(3)))
        ));
    }

    #[test]
    fn test_aggregate_output_names() {
        assert_eq!(AggregateCall::sum("value").output_name(), "sum_value");
        assert_eq!(AggregateCall::count().output_name(), "count");
        assert_eq!(AggregateCall::max("v").alias("top").output_name(), "top");
        let spec = AggregateCall::avg("v").to_spec();
        assert_eq!(spec.output, "avg_v");
        assert_eq!(spec.input.as_deref(), Some("v"));
    }

    #[test]
    fn test_expr_display() {
        let expr = Expr::col("a").eq(Expr::col("b")).and(Expr::col("c").lt(Expr::lit(3)));
        assert_eq!(expr.to_string(), "(a = b AND c < 3)");
    }
}
