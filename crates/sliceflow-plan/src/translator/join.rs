//! Join translation.
//!
//! Only windowed equi-joins between two different inputs have a physical
//! strategy. The predicate must be a conjunction of `column = column`
//! terms; the first column of each term is looked up in the left input and
//! the second in the right input, or the other way around if that is the
//! only way both resolve.

use arrow_schema::{DataType, SchemaRef};
use sliceflow_core::operator::hash_join::{
    common_key_type, joined_schema, HashJoinConfig, JoinStrategy,
};
use sliceflow_core::operator::WindowMetaData;

use crate::error::PlanError;
use crate::logical::{Expr, LogicalOperator, LogicalPlan, OperatorId};

/// One `left = right` term with its common key type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinKey {
    /// Left column
    pub left: String,
    /// Right column
    pub right: String,
    /// Type both columns are cast to
    pub key_type: DataType,
}

fn conjuncts<'a>(predicate: &'a Expr, out: &mut Vec<&'a Expr>) {
    match predicate {
        Expr::And(l, r) => {
            conjuncts(l, out);
            conjuncts(r, out);
        }
        other => out.push(other),
    }
}

/// Resolves the equality terms of `predicate` between `left` and `right`.
///
/// # Errors
///
/// Returns [`PlanError::UnknownJoinStrategy`] for a self-join,
/// [`PlanError::UnsupportedJoinPredicate`] for anything but column
/// equalities, [`PlanError::ColumnNotFound`] for unresolvable columns and
/// [`PlanError::IncompatibleJoinKeys`] for key pairs without a common type.
pub fn join_keys(
    plan: &LogicalPlan,
    left: OperatorId,
    right: OperatorId,
    predicate: &Expr,
) -> Result<Vec<JoinKey>, PlanError> {
    if left == right {
        return Err(PlanError::UnknownJoinStrategy(format!(
            "self-join of {left} on {predicate}"
        )));
    }
    let mut terms = Vec::new();
    conjuncts(predicate, &mut terms);

    terms
        .into_iter()
        .map(|term| {
            let Expr::Eq(a, b) = term else {
                return Err(PlanError::UnsupportedJoinPredicate(term.to_string()));
            };
            let (Expr::Column(a), Expr::Column(b)) = (a.as_ref(), b.as_ref()) else {
                return Err(PlanError::UnsupportedJoinPredicate(term.to_string()));
            };
            let resolve = |l: &str, r: &str| {
                plan.field(left, l)
                    .and_then(|l| plan.field(right, r).map(|r| (l, r)))
            };
            let (l, r) = match resolve(a, b) {
                Ok(pair) => pair,
                Err(e) => resolve(b, a).map_err(|_| e)?,
            };
            let key_type = common_key_type(&l.data_type, &r.data_type).ok_or_else(|| {
                PlanError::IncompatibleJoinKeys {
                    left: l.name.clone(),
                    left_type: l.data_type.to_string(),
                    right: r.name.clone(),
                    right_type: r.data_type.to_string(),
                }
            })?;
            Ok(JoinKey {
                left: l.name.clone(),
                right: r.name.clone(),
                key_type,
            })
        })
        .collect()
}

/// Output schema of a join of `left` and `right` on `predicate`.
///
/// # Errors
///
/// See [`join_keys`].
pub fn joined_output(
    plan: &LogicalPlan,
    left: OperatorId,
    right: OperatorId,
    predicate: &Expr,
    meta: &WindowMetaData,
) -> Result<SchemaRef, PlanError> {
    join_keys(plan, left, right, predicate)?;
    Ok(joined_schema(&*plan.schema(left)?, &*plan.schema(right)?, meta))
}

/// Engine configuration of join `id`.
///
/// # Errors
///
/// Returns [`PlanError::UnknownOperator`] if `id` is not a join, the errors
/// of [`join_keys`], and engine validation errors.
pub fn translate_join(
    plan: &LogicalPlan,
    id: OperatorId,
    strategy: JoinStrategy,
) -> Result<HashJoinConfig, PlanError> {
    let LogicalOperator::Join {
        left,
        right,
        window,
        predicate,
        meta,
        left_time,
        right_time,
    } = plan.operator(id)?
    else {
        return Err(PlanError::UnknownOperator(id));
    };

    let keys = join_keys(plan, *left, *right, predicate)?;
    let builder = keys.iter().fold(
        HashJoinConfig::builder()
            .sliding(window.size, window.slide)
            .left_schema(plan.schema(*left)?)
            .right_schema(plan.schema(*right)?)
            .left_time(left_time.clone())
            .right_time(right_time.clone())
            .window_metadata(meta.clone())
            .strategy(strategy),
        |builder, key| builder.on(key.left.clone(), key.right.clone()),
    );
    Ok(builder
        .key_types(keys.into_iter().map(|key| key.key_type).collect())
        .build()?)
}
