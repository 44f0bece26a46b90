use std::collections::BTreeMap;
use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::types::{Float64Type, Int64Type, UInt64Type};
use arrow_array::{Array, ArrayRef, Float64Array, Int64Array, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field, Schema};

use super::*;
use crate::time::SequenceData;

const ORIGIN: OriginId = OriginId(0);

fn input(ids: &[i64], values: &[i64], ts: &[u64]) -> RecordBatch {
    RecordBatch::try_from_iter(vec![
        ("id", Arc::new(Int64Array::from(ids.to_vec())) as ArrayRef),
        ("value", Arc::new(Int64Array::from(values.to_vec())) as ArrayRef),
        ("ts", Arc::new(UInt64Array::from(ts.to_vec())) as ArrayRef),
    ])
    .unwrap()
}

fn schema() -> SchemaRef {
    input(&[], &[], &[]).schema()
}

fn sum_config(size: Timestamp, slide: Timestamp) -> WindowAggregationConfig {
    WindowAggregationConfig::builder()
        .sliding(size, slide)
        .time(TimeFunction::event_time("ts"))
        .group_by(["id"])
        .aggregate(AggregationSpec::sum("value", "total"))
        .aggregate(AggregationSpec::count("n"))
        .aggregate(AggregationSpec::min("value", "lo"))
        .aggregate(AggregationSpec::max("value", "hi"))
        .build()
        .unwrap()
}

fn handler_with(
    config: WindowAggregationConfig,
    origins: &[OriginId],
    engine: &EngineConfig,
) -> Arc<AggregationOperatorHandler> {
    let ctx = PipelineExecutionContext::new(1, engine.clone());
    let handler = Arc::new(
        AggregationOperatorHandler::new(OperatorHandlerId(1), config, schema(), origins, engine).unwrap(),
    );
    handler.start(&ctx).unwrap();
    handler
}

fn handler(config: WindowAggregationConfig) -> Arc<AggregationOperatorHandler> {
    handler_with(config, &[ORIGIN], &EngineConfig::default())
}

struct Driver {
    build: AggregationBuild,
    trigger: AggregationTrigger,
    sequence: u64,
}

impl Driver {
    fn new(handler: &Arc<AggregationOperatorHandler>) -> Self {
        Self {
            build: AggregationBuild::new(Arc::clone(handler)),
            trigger: AggregationTrigger::new(Arc::clone(handler)),
            sequence: 0,
        }
    }

    fn watermark(&mut self, watermark: Timestamp) -> Vec<WindowOutput> {
        self.sequence += 1;
        self.trigger
            .on_watermark(WatermarkUpdate::new(watermark, SequenceData::single(self.sequence), ORIGIN))
            .unwrap()
    }
}

/// `(start, end, id) -> (sum, count, min, max)`
type Rows = BTreeMap<(u64, u64, i64), (i64, u64, i64, i64)>;

fn collect(outputs: &[WindowOutput]) -> Rows {
    let mut rows = Rows::new();
    for output in outputs {
        for batch in &output.batches {
            let start = batch.column(0).as_primitive::<UInt64Type>();
            let end = batch.column(1).as_primitive::<UInt64Type>();
            let id = batch.column(2).as_primitive::<Int64Type>();
            let sum = batch.column(3).as_primitive::<Int64Type>();
            let count = batch.column(4).as_primitive::<UInt64Type>();
            let lo = batch.column(5).as_primitive::<Int64Type>();
            let hi = batch.column(6).as_primitive::<Int64Type>();
            for row in 0..batch.num_rows() {
                assert_eq!(start.value(row), output.start());
                assert_eq!(end.value(row), output.end());
                let previous = rows.insert(
                    (start.value(row), end.value(row), id.value(row)),
                    (sum.value(row), count.value(row), lo.value(row), hi.value(row)),
                );
                assert!(previous.is_none(), "duplicate output row");
            }
        }
    }
    rows
}

/// Deterministic pseudo-random records: `(id, value, ts)`.
fn records(n: usize, max_ts: u64) -> Vec<(i64, i64, u64)> {
    let mut state = 0x2545_f491_u64;
    (0..n)
        .map(|_| {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            let id = ((state >> 33) % 4) as i64;
            let value = ((state >> 17) % 201) as i64 - 100;
            let ts = (state >> 40) % max_ts;
            (id, value, ts)
        })
        .collect()
}

fn batch_of(records: &[(i64, i64, u64)]) -> RecordBatch {
    let ids: Vec<_> = records.iter().map(|r| r.0).collect();
    let values: Vec<_> = records.iter().map(|r| r.1).collect();
    let ts: Vec<_> = records.iter().map(|r| r.2).collect();
    input(&ids, &values, &ts)
}

fn brute_force(records: &[(i64, i64, u64)], size: u64, slide: u64, watermark: u64) -> Rows {
    let mut rows = Rows::new();
    let mut start = 0;
    while start + size <= watermark {
        for &(id, value, ts) in records {
            if start <= ts && ts < start + size {
                let entry = rows
                    .entry((start, start + size, id))
                    .or_insert((0, 0, i64::MAX, i64::MIN));
                entry.0 += value;
                entry.1 += 1;
                entry.2 = entry.2.min(value);
                entry.3 = entry.3.max(value);
            }
        }
        start += slide;
    }
    rows
}

#[test]
fn test_tumbling_sum_per_window() {
    let handler = handler(sum_config(1000, 1000));
    let mut driver = Driver::new(&handler);
    driver
        .build
        .execute(&input(&[1, 1, 1], &[1, 2, 3], &[1000, 1500, 2000]))
        .unwrap();

    let first = collect(&driver.watermark(2000));
    assert_eq!(first.len(), 1);
    assert_eq!(first[&(1000, 2000, 1)], (3, 2, 1, 2));

    let second = collect(&driver.watermark(3000));
    assert_eq!(second[&(2000, 3000, 1)], (3, 1, 3, 3));
    assert!(driver.watermark(5000).is_empty());
}

#[test]
fn test_sliding_matches_brute_force() {
    for (size, slide) in [(10, 3), (10, 2), (7, 7), (12, 5)] {
        let data = records(400, 100);
        let handler = handler(sum_config(size, slide));
        let mut driver = Driver::new(&handler);
        for chunk in data.chunks(37) {
            driver.build.execute(&batch_of(chunk)).unwrap();
        }

        let mut outputs = Vec::new();
        for wm in (0..=100).step_by(9).chain(std::iter::once(100)) {
            outputs.extend(driver.watermark(wm));
        }
        assert_eq!(collect(&outputs), brute_force(&data, size, slide, 100), "{size}/{slide}");
        assert!(outputs
            .windows(2)
            .all(|pair| pair[0].sequence_number < pair[1].sequence_number));
    }
}

#[test]
fn test_count_independent_of_order() {
    let mut results = Vec::new();
    for order in [[0, 1, 2], [2, 0, 1], [1, 2, 0]] {
        let handler = handler(sum_config(100, 100));
        let mut driver = Driver::new(&handler);
        let values = [-15, -99, -20];
        let ts = [10, 50, 90];
        for &i in &order {
            driver.build.execute(&input(&[7], &[values[i]], &[ts[i]])).unwrap();
        }
        results.push(collect(&driver.watermark(100)));
    }
    assert!(results.iter().all(|r| r == &results[0]));
    assert_eq!(results[0][&(0, 100, 7)], (-134, 3, -99, -15));
}

#[test]
fn test_global_aggregation_without_keys() {
    let config = WindowAggregationConfig::builder()
        .tumbling(10)
        .time(TimeFunction::event_time("ts"))
        .aggregate(AggregationSpec::avg("value", "mean"))
        .aggregate(AggregationSpec::median("value", "med"))
        .build()
        .unwrap();
    let handler = handler(config);
    let mut driver = Driver::new(&handler);
    driver
        .build
        .execute(&input(&[1, 2, 3, 4], &[1, 3, 10, 2], &[0, 1, 2, 3]))
        .unwrap();

    let outputs = driver.watermark(10);
    assert_eq!(outputs.len(), 1);
    let batch = &outputs[0].batches[0];
    assert_eq!(batch.num_columns(), 4);
    assert_eq!(batch.column(2).as_primitive::<Float64Type>().value(0), 4.0);
    assert_eq!(batch.column(3).as_primitive::<Float64Type>().value(0), 2.5);
}

#[test]
fn test_output_schema() {
    let handler = handler(sum_config(10, 5));
    let schema = handler.output_schema();
    let names: Vec<_> = schema.fields().iter().map(|f| f.name().as_str()).collect();
    assert_eq!(names, vec!["start", "end", "id", "total", "n", "lo", "hi"]);
    assert_eq!(schema.field(3).data_type(), &DataType::Int64);
    assert_eq!(schema.field(4).data_type(), &DataType::UInt64);
    assert!(!schema.field(0).is_nullable());
}

#[test]
fn test_configuration_errors() {
    assert!(matches!(
        WindowAggregationConfig::builder()
            .sliding(5, 10)
            .time(TimeFunction::IngestionTime)
            .aggregate(AggregationSpec::count("n"))
            .build(),
        Err(OperatorError::InvalidWindow { size: 5, slide: 10 })
    ));
    assert!(matches!(
        WindowAggregationConfig::builder()
            .tumbling(5)
            .time(TimeFunction::IngestionTime)
            .build(),
        Err(OperatorError::InvalidConfig(_))
    ));

    let strings = Arc::new(Schema::new(vec![
        Field::new("name", DataType::Utf8, false),
        Field::new("ts", DataType::UInt64, false),
    ]));
    let config = WindowAggregationConfig::builder()
        .tumbling(5)
        .time(TimeFunction::event_time("ts"))
        .aggregate(AggregationSpec::avg("name", "x"))
        .build()
        .unwrap();
    assert!(matches!(
        AggregationOperatorHandler::new(OperatorHandlerId(1), config, strings, &[ORIGIN], &EngineConfig::default()),
        Err(OperatorError::UnsupportedType { .. })
    ));

    let clash = WindowAggregationConfig::builder()
        .tumbling(5)
        .time(TimeFunction::event_time("ts"))
        .group_by(["id"])
        .aggregate(AggregationSpec::sum("value", "id"))
        .build()
        .unwrap();
    assert!(matches!(
        AggregationOperatorHandler::new(OperatorHandlerId(1), clash, schema(), &[ORIGIN], &EngineConfig::default()),
        Err(OperatorError::InvalidConfig(_))
    ));
}

#[test]
fn test_late_records_dropped() {
    let handler = handler(sum_config(1000, 1000));
    let mut driver = Driver::new(&handler);
    driver.build.execute(&input(&[1], &[1], &[1500])).unwrap();
    driver.watermark(2000);

    let accepted = driver
        .build
        .execute(&input(&[1, 1, 1], &[5, 6, 7], &[1999, 2000, 100]))
        .unwrap();
    assert_eq!(accepted, 1);
    assert_eq!(handler.metrics().late_records, 2);

    let rows = collect(&driver.watermark(3000));
    assert_eq!(rows[&(2000, 3000, 1)].0, 6);
}

#[test]
fn test_waits_for_slowest_origin() {
    let origins = [OriginId(1), OriginId(2)];
    let handler = handler_with(sum_config(10, 10), &origins, &EngineConfig::default());
    let build = AggregationBuild::new(Arc::clone(&handler));
    let trigger = AggregationTrigger::new(Arc::clone(&handler));
    build.execute(&input(&[1, 1], &[4, 5], &[3, 13])).unwrap();

    let fast = trigger
        .on_watermark(WatermarkUpdate::new(30, SequenceData::single(1), OriginId(1)))
        .unwrap();
    assert!(fast.is_empty());

    let slow = trigger
        .on_watermark(WatermarkUpdate::new(12, SequenceData::single(1), OriginId(2)))
        .unwrap();
    assert_eq!(collect(&slow).keys().copied().collect::<Vec<_>>(), vec![(0, 10, 1)]);
    assert_eq!(handler.watermark(), Watermark::new(12));

    assert!(matches!(
        trigger.on_watermark(WatermarkUpdate::new(50, SequenceData::single(1), OriginId(9))),
        Err(OperatorError::Time(_))
    ));
}

#[test]
fn test_out_of_order_sequences_hold_back_trigger() {
    let handler = handler(sum_config(10, 10));
    let build = AggregationBuild::new(Arc::clone(&handler));
    let trigger = AggregationTrigger::new(Arc::clone(&handler));
    build.execute(&input(&[1], &[1], &[5])).unwrap();

    let early = trigger
        .on_watermark(WatermarkUpdate::new(20, SequenceData::single(2), ORIGIN))
        .unwrap();
    assert!(early.is_empty());
    let closed = trigger
        .on_watermark(WatermarkUpdate::new(8, SequenceData::single(1), ORIGIN))
        .unwrap();
    assert_eq!(closed.len(), 1);
}

#[test]
fn test_emit_batches_are_bounded() {
    let engine = EngineConfig::builder().emit_batch_rows(3).build().unwrap();
    let handler = handler_with(sum_config(100, 100), &[ORIGIN], &engine);
    let mut driver = Driver::new(&handler);
    let ids: Vec<i64> = (0..10).collect();
    driver
        .build
        .execute(&input(&ids, &[1; 10], &[5; 10]))
        .unwrap();

    let outputs = driver.watermark(100);
    assert_eq!(outputs.len(), 1);
    let sizes: Vec<_> = outputs[0].batches.iter().map(RecordBatch::num_rows).collect();
    assert_eq!(sizes, vec![3, 3, 3, 1]);
    assert_eq!(collect(&outputs).len(), 10);
}

#[test]
fn test_slices_evicted_after_trigger() {
    let handler = handler(sum_config(10, 5));
    let mut driver = Driver::new(&handler);
    driver
        .build
        .execute(&input(&[1, 1, 1, 1], &[1, 1, 1, 1], &[1, 6, 11, 16]))
        .unwrap();
    assert_eq!(handler.store().slice_count(), 4);

    driver.watermark(15);
    // [0,5) and [5,10) only belong to triggered windows.
    assert_eq!(handler.store().slice_count(), 2);
    driver.watermark(25);
    assert_eq!(handler.store().slice_count(), 0);
}

#[test]
fn test_graceful_stop_flushes_pending_windows() {
    let handler = handler(sum_config(10, 10));
    let build = AggregationBuild::new(Arc::clone(&handler));
    build.execute(&input(&[1, 2], &[3, 4], &[5, 15])).unwrap();

    let flushed = handler.stop(QueryTerminationType::Graceful).unwrap();
    let rows = collect(&flushed);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[&(10, 20, 2)].0, 4);

    assert!(matches!(
        build.execute(&input(&[1], &[1], &[30])),
        Err(OperatorError::HandlerStopped(1))
    ));
    assert!(handler.stop(QueryTerminationType::Graceful).unwrap().is_empty());
}

#[test]
fn test_hard_stop_discards_state() {
    let handler = handler(sum_config(10, 10));
    let mut driver = Driver::new(&handler);
    driver.build.execute(&input(&[1], &[3], &[5])).unwrap();

    assert!(handler.stop(QueryTerminationType::HardStop).unwrap().is_empty());
    assert_eq!(handler.store().slice_count(), 0);
    assert!(matches!(
        driver.trigger.on_watermark(WatermarkUpdate::new(10, SequenceData::single(1), ORIGIN)),
        Err(OperatorError::HandlerStopped(1))
    ));
}

#[test]
fn test_snapshot_restore_continues() {
    let data = records(300, 90);
    let (before, after) = data.split_at(150);

    let original = handler(sum_config(10, 4));
    let mut driver = Driver::new(&original);
    driver.build.execute(&batch_of(before)).unwrap();
    let mut outputs = driver.watermark(30);
    let bytes = original.snapshot(0).unwrap();

    let restored = Arc::new(
        AggregationOperatorHandler::restore(
            OperatorHandlerId(2),
            sum_config(10, 4),
            schema(),
            &EngineConfig::default(),
            &bytes,
        )
        .unwrap(),
    );
    restored
        .start(&PipelineExecutionContext::new(2, EngineConfig::default()))
        .unwrap();
    assert_eq!(restored.watermark(), Watermark::new(30));
    assert_eq!(restored.store().slice_count(), original.store().slice_count());

    let mut driver = Driver::new(&restored);
    driver.sequence = 1;
    let accepted = driver.build.execute(&batch_of(after)).unwrap();
    let on_time: Vec<_> = after.iter().copied().filter(|r| r.2 >= 30).collect();
    assert_eq!(accepted, on_time.len());
    outputs.extend(driver.watermark(60));
    outputs.extend(driver.watermark(90));

    let expected: Vec<_> = before.iter().chain(&on_time).copied().collect();
    assert_eq!(collect(&outputs), brute_force(&expected, 10, 4, 90));
    assert!(outputs
        .windows(2)
        .all(|pair| pair[0].sequence_number < pair[1].sequence_number));
}

#[test]
fn test_snapshot_rejects_join_bytes() {
    let handler = handler(sum_config(10, 10));
    let bytes = crate::state::encode(SnapshotKind::Join, &0_u64).unwrap();
    assert!(matches!(
        AggregationOperatorHandler::restore(
            OperatorHandlerId(1),
            sum_config(10, 10),
            schema(),
            &EngineConfig::default(),
            &bytes
        ),
        Err(OperatorError::State(_))
    ));
    assert!(handler.snapshot(0).is_ok());
}

#[test]
fn test_concurrent_build_threads() {
    let engine = EngineConfig::builder().worker_threads(8).build().unwrap();
    let handler = handler_with(sum_config(100, 50), &[ORIGIN], &engine);
    let threads: Vec<_> = (0..8)
        .map(|t| {
            let build = AggregationBuild::new(Arc::clone(&handler));
            std::thread::spawn(move || {
                for i in 0..50_u64 {
                    let ts = (t * 50 + i) % 200;
                    build.execute(&input(&[(i % 5) as i64], &[1], &[ts])).unwrap();
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    let mut driver = Driver::new(&handler);
    let rows = collect(&driver.watermark(200));
    let total: u64 = rows
        .iter()
        .filter(|((start, _, _), _)| start % 100 == 0)
        .map(|(_, (_, count, _, _))| count)
        .sum();
    // Tumbling cover [0,100) + [100,200) sees every record once.
    assert_eq!(total, 400);
}

fn children_outputs(
    config: WindowAggregationConfig,
    data: &[(i64, i64, u64)],
    child: usize,
    children: usize,
    watermark: Timestamp,
) -> (Vec<WindowOutput>, Timestamp) {
    let handler = handler(config.with_emit_mode(EmitMode::Partial));
    let mut driver = Driver::new(&handler);
    let mine: Vec<_> = data
        .iter()
        .enumerate()
        .filter(|(i, _)| i % children == child)
        .map(|(_, r)| *r)
        .collect();
    driver.build.execute(&batch_of(&mine)).unwrap();
    let outputs = driver.watermark(watermark);
    (outputs, handler.watermark().timestamp())
}

#[test]
fn test_combiner_matches_single_node() {
    let data = records(200, 60);
    let combiner =
        WindowCombiner::new(&sum_config(10, 5), &schema(), &[0, 1, 2], &EngineConfig::default()).unwrap();

    let mut combined = Vec::new();
    let mut watermarks = Vec::new();
    for child in 0..3 {
        let (outputs, watermark) = children_outputs(sum_config(10, 5), &data, child, 3, 60);
        for output in &outputs {
            assert_eq!(output.batches[0].schema(), partial_schema(&WindowMetaData::default()));
            combined.extend(combiner.combine(child as u64, output).unwrap());
        }
        watermarks.push(watermark);
    }
    for (child, watermark) in watermarks.into_iter().enumerate() {
        combined.extend(combiner.advance(child as u64, watermark).unwrap());
    }

    assert_eq!(combiner.pending_windows(), 0);
    assert_eq!(collect(&combined), brute_force(&data, 10, 5, 60));
}

#[test]
fn test_combiner_rejects_bad_partials() {
    let data = [(1, 1, 2), (2, 3, 7), (1, 4, 12)];
    let combiner =
        WindowCombiner::new(&sum_config(10, 5), &schema(), &[0, 1], &EngineConfig::default()).unwrap();
    let (outputs, _) = children_outputs(sum_config(10, 5), &data, 0, 1, 20);
    let first = &outputs[0];

    assert!(combiner.combine(0, first).unwrap().is_none());
    assert!(matches!(combiner.combine(0, first), Err(OperatorError::RejectedPartial(_))));
    assert!(matches!(combiner.combine(5, first), Err(OperatorError::RejectedPartial(_))));
    assert!(combiner.combine(1, first).unwrap().is_some());
    assert!(matches!(combiner.combine(1, first), Err(OperatorError::RejectedPartial(_))));

    let final_rows = WindowOutput {
        sequence_number: 1,
        window: WindowInfo::new(100, 110),
        batches: vec![input(&[1], &[1], &[1])],
    };
    assert!(matches!(
        combiner.combine(0, &final_rows),
        Err(OperatorError::RejectedPartial(_))
    ));
    assert!(WindowCombiner::new(&sum_config(10, 5), &schema(), &[1, 1], &EngineConfig::default()).is_err());
}

#[test]
fn test_combiner_rejects_mismatched_aggregate_kinds() {
    let data = [(1, 1, 2), (2, 3, 7)];
    let reordered = WindowAggregationConfig::builder()
        .sliding(10, 5)
        .time(TimeFunction::event_time("ts"))
        .group_by(["id"])
        .aggregate(AggregationSpec::count("n"))
        .aggregate(AggregationSpec::sum("value", "total"))
        .aggregate(AggregationSpec::max("value", "hi"))
        .aggregate(AggregationSpec::min("value", "lo"))
        .build()
        .unwrap();
    let combiner =
        WindowCombiner::new(&sum_config(10, 5), &schema(), &[0, 1], &EngineConfig::default()).unwrap();

    let (wrong, _) = children_outputs(reordered, &data, 0, 1, 20);
    assert!(matches!(
        combiner.combine(0, &wrong[0]),
        Err(OperatorError::RejectedPartial(_))
    ));
    assert_eq!(combiner.pending_windows(), 0);

    // The rejected report left no trace; both children can still report.
    let (right, _) = children_outputs(sum_config(10, 5), &data, 0, 1, 20);
    assert!(combiner.combine(0, &right[0]).unwrap().is_none());
    let merged = combiner.combine(1, &right[0]).unwrap().unwrap();
    assert_eq!(merged.window, right[0].window);
}

#[test]
fn test_combiner_closes_window_on_watermarks() {
    let combiner =
        WindowCombiner::new(&sum_config(10, 10), &schema(), &[0, 1], &EngineConfig::default()).unwrap();
    let (outputs, _) = children_outputs(sum_config(10, 10), &[(1, 5, 3), (1, 6, 13)], 0, 1, 20);
    for output in &outputs {
        assert!(combiner.combine(0, output).unwrap().is_none());
    }
    assert_eq!(combiner.pending_windows(), 2);

    assert!(combiner.advance(0, 20).unwrap().is_empty());
    let closed = combiner.advance(1, 10).unwrap();
    assert_eq!(collect(&closed).keys().copied().collect::<Vec<_>>(), vec![(0, 10, 1)]);
    let closed = combiner.advance(1, 20).unwrap();
    assert_eq!(collect(&closed)[&(10, 20, 1)], (6, 1, 6, 6));
    assert_eq!(combiner.pending_windows(), 0);
}

#[test]
fn test_partial_mode_stop_flushes_partials() {
    let handler = handler(sum_config(10, 10).with_emit_mode(EmitMode::Partial));
    AggregationBuild::new(Arc::clone(&handler))
        .execute(&input(&[1], &[2], &[3]))
        .unwrap();
    let flushed = handler.stop(QueryTerminationType::Graceful).unwrap();
    let partial = PartialWindowAggregate::from_output(&flushed[0]).unwrap();
    assert_eq!(partial.window, WindowInfo::new(0, 10));
    assert_eq!(partial.num_keys(), 1);
    assert_eq!(partial.entries[0].1.len(), 4);
}

#[test]
fn test_string_keys_decoded() {
    let batch = RecordBatch::try_from_iter(vec![
        ("name", Arc::new(StringArray::from(vec!["b", "a", "b"])) as ArrayRef),
        ("v", Arc::new(Float64Array::from(vec![1.5, 2.0, 0.5])) as ArrayRef),
        ("ts", Arc::new(UInt64Array::from(vec![1_u64, 2, 3])) as ArrayRef),
    ])
    .unwrap();
    let config = WindowAggregationConfig::builder()
        .tumbling(10)
        .time(TimeFunction::event_time("ts"))
        .group_by(["name"])
        .aggregate(AggregationSpec::sum("v", "total"))
        .build()
        .unwrap();
    let handler = Arc::new(
        AggregationOperatorHandler::new(
            OperatorHandlerId(4),
            config,
            batch.schema(),
            &[ORIGIN],
            &EngineConfig::default(),
        )
        .unwrap(),
    );
    AggregationBuild::new(Arc::clone(&handler)).execute(&batch).unwrap();
    let outputs = AggregationTrigger::new(handler)
        .on_watermark(WatermarkUpdate::new(10, SequenceData::single(1), ORIGIN))
        .unwrap();

    let out = &outputs[0].batches[0];
    let names = out.column(2).as_string::<i32>();
    let totals = out.column(3).as_primitive::<Float64Type>();
    assert_eq!(names.value(0), "a");
    assert_eq!(totals.value(0), 2.0);
    assert_eq!(names.value(1), "b");
    assert_eq!(totals.value(1), 2.0);
    assert!(!out.column(3).is_null(0));
}
