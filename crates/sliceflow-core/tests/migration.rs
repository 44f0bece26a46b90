//! Handler state moved between pipelines through snapshot files.

use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::types::{Float64Type, Int64Type, UInt64Type};
use arrow_array::{ArrayRef, Int64Array, RecordBatch, UInt64Array};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use sliceflow_core::operator::aggregation::{
    AggregationBuild, AggregationOperatorHandler, AggregationSpec, AggregationTrigger,
    WindowAggregationConfig,
};
use sliceflow_core::operator::handler::{OperatorHandlerId, PipelineExecutionContext};
use sliceflow_core::operator::hash_join::{HashJoinConfig, JoinBuild, JoinOperatorHandler, JoinProbe};
use sliceflow_core::operator::WindowOutput;
use sliceflow_core::state::{read_snapshot, write_snapshot};
use sliceflow_core::time::{OriginId, SequenceData, TimeFunction, WatermarkUpdate};
use sliceflow_core::{EngineConfig, Timestamp};

const ORIGIN: OriginId = OriginId(0);

fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("value", DataType::Int64, false),
        Field::new("ts", DataType::UInt64, false),
    ]))
}

fn batch(rows: &[(i64, i64, u64)]) -> RecordBatch {
    RecordBatch::try_new(
        schema(),
        vec![
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.0))) as ArrayRef,
            Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.1))) as ArrayRef,
            Arc::new(UInt64Array::from_iter_values(rows.iter().map(|r| r.2))) as ArrayRef,
        ],
    )
    .unwrap()
}

fn update(watermark: Timestamp, sequence: u64) -> WatermarkUpdate {
    WatermarkUpdate::new(watermark, SequenceData::single(sequence), ORIGIN)
}

fn aggregation_config() -> WindowAggregationConfig {
    WindowAggregationConfig::builder()
        .tumbling(1_000)
        .time(TimeFunction::event_time("ts"))
        .group_by(["id"])
        .aggregate(AggregationSpec::sum("value", "total"))
        .aggregate(AggregationSpec::avg("value", "mean"))
        .build()
        .unwrap()
}

/// `(start, id, total, mean)` rows of every output.
fn aggregated(outputs: &[WindowOutput]) -> Vec<(u64, i64, i64, f64)> {
    let mut rows = Vec::new();
    for batch in outputs.iter().flat_map(|o| &o.batches) {
        let start = batch.column(0).as_primitive::<UInt64Type>();
        let id = batch.column(2).as_primitive::<Int64Type>();
        let total = batch.column(3).as_primitive::<Int64Type>();
        let mean = batch.column(4).as_primitive::<Float64Type>();
        for row in 0..batch.num_rows() {
            rows.push((start.value(row), id.value(row), total.value(row), mean.value(row)));
        }
    }
    rows.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
    rows
}

const FIRST: &[(i64, i64, u64)] = &[(1, 10, 100), (2, 4, 900), (1, 20, 1_200), (2, 6, 2_500)];
const SECOND: &[(i64, i64, u64)] = &[(1, 30, 1_800), (2, 8, 2_100), (1, 1, 3_100)];

#[test]
fn aggregation_resumes_from_snapshot_file() {
    let engine = EngineConfig::default();

    // Uninterrupted reference run.
    let ctx = PipelineExecutionContext::new(1, engine.clone());
    let reference = Arc::new(
        AggregationOperatorHandler::new(OperatorHandlerId(1), aggregation_config(), schema(), &[ORIGIN], &engine)
            .unwrap(),
    );
    ctx.install(Arc::clone(&reference)).unwrap();
    let build = AggregationBuild::new(Arc::clone(&reference));
    let trigger = AggregationTrigger::new(Arc::clone(&reference));
    build.execute(&batch(FIRST)).unwrap();
    let mut expected = trigger.on_watermark(update(1_000, 1)).unwrap();
    build.execute(&batch(SECOND)).unwrap();
    expected.extend(trigger.on_watermark(update(5_000, 2)).unwrap());

    // Same input, migrated after the first watermark.
    let source_ctx = PipelineExecutionContext::new(2, engine.clone());
    let source = Arc::new(
        AggregationOperatorHandler::new(OperatorHandlerId(1), aggregation_config(), schema(), &[ORIGIN], &engine)
            .unwrap(),
    );
    source_ctx.install(Arc::clone(&source)).unwrap();
    AggregationBuild::new(Arc::clone(&source)).execute(&batch(FIRST)).unwrap();
    let mut actual = AggregationTrigger::new(Arc::clone(&source))
        .on_watermark(update(1_000, 1))
        .unwrap();
    assert_eq!(actual.len(), 1);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("handler-1.snapshot");
    write_snapshot(&path, &source.snapshot(1_000).unwrap()).unwrap();

    let target_ctx = PipelineExecutionContext::new(3, engine.clone());
    let target = Arc::new(
        AggregationOperatorHandler::restore(
            OperatorHandlerId(1),
            aggregation_config(),
            schema(),
            &engine,
            &read_snapshot(&path).unwrap(),
        )
        .unwrap(),
    );
    target_ctx.install(Arc::clone(&target)).unwrap();
    AggregationBuild::new(Arc::clone(&target)).execute(&batch(SECOND)).unwrap();
    let resumed = AggregationTrigger::new(Arc::clone(&target))
        .on_watermark(update(5_000, 2))
        .unwrap();
    assert!(resumed
        .iter()
        .all(|o| o.sequence_number > actual[0].sequence_number));
    actual.extend(resumed);

    assert_eq!(aggregated(&actual), aggregated(&expected));
    assert_eq!(
        aggregated(&expected),
        vec![
            (0, 1, 10, 10.0),
            (0, 2, 4, 4.0),
            (1_000, 1, 50, 25.0),
            (2_000, 2, 14, 7.0),
            (3_000, 1, 1, 1.0),
        ]
    );
}

#[test]
fn join_uses_engine_config_file_and_migrates() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("engine.json");
    std::fs::write(&config_path, r#"{"emit_batch_rows": 1, "worker_threads": 2}"#).unwrap();
    let engine = EngineConfig::from_file(&config_path).unwrap();
    assert_eq!(engine.emit_batch_rows, 1);

    let config = HashJoinConfig::builder()
        .tumbling(1_000)
        .left_schema(schema())
        .right_schema(schema())
        .on("id", "id")
        .time(TimeFunction::event_time("ts"))
        .build()
        .unwrap();
    let left_origin = OriginId(0);
    let right_origin = OriginId(1);

    let ctx = PipelineExecutionContext::new(1, engine.clone());
    let source = Arc::new(
        JoinOperatorHandler::new(OperatorHandlerId(5), config.clone(), &[left_origin, right_origin], &engine)
            .unwrap(),
    );
    ctx.install(Arc::clone(&source)).unwrap();
    JoinBuild::left(Arc::clone(&source))
        .execute(&batch(&[(1, 10, 100), (1, 11, 200), (2, 12, 1_100)]))
        .unwrap();
    JoinBuild::right(Arc::clone(&source))
        .execute(&batch(&[(1, 90, 300)]))
        .unwrap();

    let snapshot_path = dir.path().join("join.snapshot");
    write_snapshot(&snapshot_path, &source.snapshot(0).unwrap()).unwrap();

    let target_ctx = PipelineExecutionContext::new(2, engine.clone());
    let target = Arc::new(
        JoinOperatorHandler::restore(OperatorHandlerId(5), config, &engine, &read_snapshot(&snapshot_path).unwrap())
            .unwrap(),
    );
    target_ctx.install(Arc::clone(&target)).unwrap();
    JoinBuild::right(Arc::clone(&target))
        .execute(&batch(&[(2, 80, 1_900)]))
        .unwrap();

    let probe = JoinProbe::new(target);
    assert!(probe
        .on_watermark(WatermarkUpdate::new(3_000, SequenceData::single(1), left_origin))
        .unwrap()
        .is_empty());
    let outputs = probe
        .on_watermark(WatermarkUpdate::new(3_000, SequenceData::single(1), right_origin))
        .unwrap();

    // Two matches in [0, 1000) split into single-row batches, one in [1000, 2000).
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0].window.start, 0);
    assert_eq!(outputs[0].batches.len(), 2);
    assert!(outputs[0].batches.iter().all(|b| b.num_rows() == 1));
    assert_eq!(outputs[1].window.start, 1_000);
    let right_value = outputs[1].batches[0].column(6).as_primitive::<Int64Type>();
    assert_eq!(right_value.value(0), 80);
}
