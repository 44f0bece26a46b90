//! Window aggregation translation.
//!
//! Resolves aggregate calls against the input's fields, rejects numeric
//! functions over non-numeric columns, and builds the engine's
//! [`WindowAggregationConfig`].

use arrow_schema::{DataType, SchemaRef};
use sliceflow_core::operator::aggregation::{
    AggregationFunction, EmitMode, NumericType, WindowAggregationConfig,
};
use sliceflow_core::operator::{OperatorError, WindowMetaData};

use crate::error::PlanError;
use crate::logical::{AggregateCall, Field, LogicalOperator, LogicalPlan, OperatorId};

/// Output fields `[start, end, keys..., aggregates...]` of an aggregation
/// over `input`, produced by `producer`.
///
/// # Errors
///
/// Returns [`PlanError::ColumnNotFound`] for unknown key or input columns,
/// [`PlanError::NonNumericAggregation`] for numeric functions over other
/// types, [`PlanError::DuplicateField`] for colliding output names and
/// [`PlanError::Operator`] if there is no aggregate call.
pub fn aggregation_fields(
    plan: &LogicalPlan,
    input: OperatorId,
    keys: &[String],
    aggregates: &[AggregateCall],
    meta: &WindowMetaData,
    producer: OperatorId,
) -> Result<Vec<Field>, PlanError> {
    if aggregates.is_empty() {
        return Err(OperatorError::InvalidConfig(
            "window aggregation without aggregation functions".into(),
        )
        .into());
    }
    let input_schema = plan.schema(input)?;

    let mut fields: Vec<Field> = meta
        .fields()
        .iter()
        .map(|field| Field {
            name: field.name().clone(),
            data_type: field.data_type().clone(),
            nullable: field.is_nullable(),
            producer,
        })
        .collect();
    for key in keys {
        let field = plan.field(input, key)?;
        fields.push(Field {
            producer,
            ..field.clone()
        });
    }
    for call in aggregates {
        if let Some(column) = &call.input {
            let field = plan.field(input, column)?;
            check_numeric(call, &field.data_type)?;
        }
        let function = AggregationFunction::try_new(&call.to_spec(), &input_schema)?;
        let output = function.output_field();
        fields.push(Field {
            name: output.name().clone(),
            data_type: output.data_type().clone(),
            nullable: output.is_nullable(),
            producer,
        });
    }

    for (i, field) in fields.iter().enumerate() {
        if fields[..i].iter().any(|f| f.name == field.name) {
            return Err(PlanError::DuplicateField(field.name.clone()));
        }
    }
    Ok(fields)
}

fn check_numeric(call: &AggregateCall, data_type: &DataType) -> Result<(), PlanError> {
    if call.kind.requires_numeric() && NumericType::from_data_type(data_type).is_none() {
        return Err(PlanError::NonNumericAggregation {
            function: call.kind.to_string(),
            column: call.input.clone().unwrap_or_default(),
            data_type: data_type.to_string(),
        });
    }
    Ok(())
}

/// Engine configuration and input schema of aggregation `id`.
///
/// # Errors
///
/// Returns [`PlanError::UnknownOperator`] if `id` is not a window
/// aggregation, and engine validation errors.
pub fn translate_aggregation(
    plan: &LogicalPlan,
    id: OperatorId,
    emit_mode: EmitMode,
) -> Result<(WindowAggregationConfig, SchemaRef), PlanError> {
    let LogicalOperator::WindowAggregation {
        input,
        window,
        keys,
        aggregates,
        meta,
        time,
    } = plan.operator(id)?
    else {
        return Err(PlanError::UnknownOperator(id));
    };

    let config = aggregates
        .iter()
        .fold(
            WindowAggregationConfig::builder()
                .sliding(window.size, window.slide)
                .time(time.clone())
                .group_by(keys.iter().cloned())
                .window_metadata(meta.clone())
                .emit_mode(emit_mode),
            |builder, call| builder.aggregate(call.to_spec()),
        )
        .build()?;
    Ok((config, plan.schema(*input)?))
}
