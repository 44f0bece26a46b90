use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::types::{Int64Type, UInt64Type};
use arrow_array::{
    ArrayRef, Int32Array, Int64Array, Int8Array, RecordBatch, StringArray, UInt64Array,
};
use arrow_schema::{DataType, Field, Schema};

use super::*;
use crate::time::SequenceData;

const ORIGIN: OriginId = OriginId(0);

/// `[id, ts, value]` input of one side.
fn side(ids: &[i64], ts: &[u64], values: &[i64]) -> RecordBatch {
    RecordBatch::try_from_iter(vec![
        ("id", Arc::new(Int64Array::from(ids.to_vec())) as ArrayRef),
        ("ts", Arc::new(UInt64Array::from(ts.to_vec())) as ArrayRef),
        ("value", Arc::new(Int64Array::from(values.to_vec())) as ArrayRef),
    ])
    .unwrap()
}

fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, true),
        Field::new("ts", DataType::UInt64, false),
        Field::new("value", DataType::Int64, true),
    ]))
}

fn config(size: Timestamp, slide: Timestamp) -> HashJoinConfig {
    HashJoinConfig::builder()
        .sliding(size, slide)
        .left_schema(schema())
        .right_schema(schema())
        .on("id", "id")
        .time(TimeFunction::event_time("ts"))
        .build()
        .unwrap()
}

fn handler_with(
    config: HashJoinConfig,
    origins: &[OriginId],
    engine: &EngineConfig,
) -> Arc<JoinOperatorHandler> {
    let ctx = PipelineExecutionContext::new(1, engine.clone());
    let handler = Arc::new(
        JoinOperatorHandler::new(OperatorHandlerId(2), config, origins, engine).unwrap(),
    );
    handler.start(&ctx).unwrap();
    handler
}

fn handler(config: HashJoinConfig) -> Arc<JoinOperatorHandler> {
    handler_with(config, &[ORIGIN], &EngineConfig::default())
}

struct Driver {
    left: JoinBuild,
    right: JoinBuild,
    probe: JoinProbe,
    sequence: u64,
}

impl Driver {
    fn new(handler: &Arc<JoinOperatorHandler>) -> Self {
        Self {
            left: JoinBuild::left(Arc::clone(handler)),
            right: JoinBuild::right(Arc::clone(handler)),
            probe: JoinProbe::new(Arc::clone(handler)),
            sequence: 0,
        }
    }

    fn watermark(&mut self, watermark: Timestamp) -> Vec<WindowOutput> {
        self.sequence += 1;
        self.probe
            .on_watermark(WatermarkUpdate::new(watermark, SequenceData::single(self.sequence), ORIGIN))
            .unwrap()
    }
}

/// `(start, end, left (id, ts, value), right (id, ts, value))`
type Joined = (u64, u64, (i64, u64, i64), (i64, u64, i64));

fn rows(outputs: &[WindowOutput]) -> Vec<Joined> {
    let mut rows = Vec::new();
    for output in outputs {
        for batch in &output.batches {
            let u = |i: usize| batch.column(i).as_primitive::<UInt64Type>();
            let s = |i: usize| batch.column(i).as_primitive::<Int64Type>();
            for row in 0..batch.num_rows() {
                rows.push((
                    u(0).value(row),
                    u(1).value(row),
                    (s(2).value(row), u(3).value(row), s(4).value(row)),
                    (s(5).value(row), u(6).value(row), s(7).value(row)),
                ));
            }
        }
    }
    rows.sort_unstable();
    rows
}

/// `(id, ts, value)` records with timestamps in `[1000, 1000 + span)`.
fn records(n: usize, span: u64, seed: u64) -> Vec<(i64, u64, i64)> {
    let mut state = seed;
    (0..n)
        .map(|i| {
            state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
            let id = ((state >> 33) % 5) as i64;
            let ts = 1000 + (state >> 17) % span;
            (id, ts, i as i64)
        })
        .collect()
}

fn batch_of(records: &[(i64, u64, i64)]) -> RecordBatch {
    let ids: Vec<_> = records.iter().map(|r| r.0).collect();
    let ts: Vec<_> = records.iter().map(|r| r.1).collect();
    let values: Vec<_> = records.iter().map(|r| r.2).collect();
    side(&ids, &ts, &values)
}

/// Every matching pair of every window ending at or before `watermark`.
fn brute_force(
    left: &[(i64, u64, i64)],
    right: &[(i64, u64, i64)],
    size: u64,
    slide: u64,
    watermark: u64,
) -> Vec<Joined> {
    let mut expected = Vec::new();
    let mut start = 0;
    while start + size <= watermark {
        let end = start + size;
        let inside = |ts: u64| ts >= start && ts < end;
        for l in left.iter().filter(|l| inside(l.1)) {
            for r in right.iter().filter(|r| inside(r.1) && r.0 == l.0) {
                expected.push((start, end, *l, *r));
            }
        }
        start += slide;
    }
    expected.sort_unstable();
    expected
}

#[test]
fn test_tumbling_join_single_match() {
    let handler = handler(config(1000, 1000));
    let mut driver = Driver::new(&handler);

    assert_eq!(driver.left.execute(&side(&[1], &[1000], &[10])).unwrap(), 1);
    assert_eq!(
        driver
            .right
            .execute(&side(&[1, 2], &[1002, 1500], &[20, 30]))
            .unwrap(),
        2
    );
    assert!(driver.watermark(1999).is_empty());

    let outputs = driver.watermark(2000);
    assert_eq!(outputs.len(), 1);
    assert_eq!((outputs[0].start(), outputs[0].end()), (1000, 2000));
    assert_eq!(
        rows(&outputs),
        vec![(1000, 2000, (1, 1000, 10), (1, 1002, 20))]
    );

    let metrics = handler.metrics();
    assert_eq!(metrics.left_records, 1);
    assert_eq!(metrics.right_records, 2);
    assert_eq!(metrics.matches, 1);
    assert_eq!(metrics.store.windows_triggered, 1);
}

#[test]
fn test_sliding_join_matches_brute_force() {
    let (size, slide) = (100, 20);
    let handler = handler(config(size, slide));
    let mut driver = Driver::new(&handler);
    let left = records(300, 1000, 7);
    let right = records(300, 1000, 11);

    let mut outputs = Vec::new();
    for (l, r) in left.chunks(50).zip(right.chunks(50)) {
        driver.left.execute(&batch_of(l)).unwrap();
        driver.right.execute(&batch_of(r)).unwrap();
    }
    outputs.extend(driver.watermark(1500));
    outputs.extend(driver.watermark(2200));

    assert_eq!(rows(&outputs), brute_force(&left, &right, size, slide, 2200));
    for pair in outputs.windows(2) {
        assert!(pair[0].sequence_number < pair[1].sequence_number);
        assert!(pair[0].window < pair[1].window);
    }
}

#[test]
fn test_nested_loop_matches_hash_join() {
    let left = records(200, 600, 3);
    let right = records(200, 600, 5);
    let run = |strategy: JoinStrategy| {
        let handler = handler(config(200, 50).with_strategy(strategy));
        let mut driver = Driver::new(&handler);
        driver.left.execute(&batch_of(&left)).unwrap();
        driver.right.execute(&batch_of(&right)).unwrap();
        driver.watermark(2000)
    };

    let hash = run(JoinStrategy::HashJoin);
    let nested = run(JoinStrategy::NestedLoop);
    assert!(!hash.is_empty());
    assert_eq!(hash.len(), nested.len());
    for (h, n) in hash.iter().zip(&nested) {
        assert_eq!(h.window, n.window);
        assert_eq!(h.batches, n.batches);
    }
}

#[test]
fn test_output_schema_disambiguates_names() {
    let config = config(1000, 1000);
    let names: Vec<_> = config
        .output_schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    assert_eq!(
        names,
        vec!["start", "end", "id", "ts", "value", "id_j1", "ts_j2", "value_j3"]
    );
    assert_eq!(config.key_types(), &[DataType::Int64]);
}

#[test]
fn test_keys_of_different_widths_join() {
    let left = RecordBatch::try_from_iter(vec![
        ("k", Arc::new(Int8Array::from(vec![7_i8, -3])) as ArrayRef),
        ("ts", Arc::new(UInt64Array::from(vec![10_u64, 20])) as ArrayRef),
    ])
    .unwrap();
    let right = RecordBatch::try_from_iter(vec![
        ("key", Arc::new(Int32Array::from(vec![-3, 7, 300])) as ArrayRef),
        ("at", Arc::new(UInt64Array::from(vec![30_u64, 40, 50])) as ArrayRef),
    ])
    .unwrap();
    let config = HashJoinConfig::builder()
        .tumbling(100)
        .left_schema(left.schema())
        .right_schema(right.schema())
        .on("k", "key")
        .left_time(TimeFunction::event_time("ts"))
        .right_time(TimeFunction::event_time("at"))
        .build()
        .unwrap();
    assert_eq!(config.key_types(), &[DataType::Int32]);

    let handler = handler(config);
    let mut driver = Driver::new(&handler);
    driver.left.execute(&left).unwrap();
    driver.right.execute(&right).unwrap();
    let outputs = driver.watermark(100);

    assert_eq!(outputs.len(), 1);
    let batch = &outputs[0].batches[0];
    assert_eq!(batch.schema().field(2).data_type(), &DataType::Int8);
    assert_eq!(batch.schema().field(4).data_type(), &DataType::Int32);
    let mut pairs: Vec<(i8, i32)> = (0..batch.num_rows())
        .map(|row| {
            (
                batch.column(2).as_primitive::<arrow_array::types::Int8Type>().value(row),
                batch.column(4).as_primitive::<arrow_array::types::Int32Type>().value(row),
            )
        })
        .collect();
    pairs.sort_unstable();
    assert_eq!(pairs, vec![(-3, -3), (7, 7)]);
}

#[test]
fn test_null_keys_never_match() {
    let nullable = |ids: Vec<Option<i64>>, ts: Vec<u64>| {
        RecordBatch::try_from_iter(vec![
            ("id", Arc::new(Int64Array::from(ids)) as ArrayRef),
            ("ts", Arc::new(UInt64Array::from(ts)) as ArrayRef),
            ("value", Arc::new(Int64Array::from(vec![0; 2])) as ArrayRef),
        ])
        .unwrap()
    };
    let handler = handler(config(100, 100));
    let mut driver = Driver::new(&handler);
    driver
        .left
        .execute(&nullable(vec![Some(1), None], vec![10, 20]))
        .unwrap();
    driver
        .right
        .execute(&nullable(vec![None, Some(1)], vec![30, 40]))
        .unwrap();

    let outputs = driver.watermark(100);
    assert_eq!(outputs.iter().map(WindowOutput::num_rows).sum::<usize>(), 1);
    assert_eq!(handler.metrics().left_records, 2);
}

#[test]
fn test_unrepresentable_keys_never_match() {
    let left = RecordBatch::try_from_iter(vec![
        ("k", Arc::new(UInt64Array::from(vec![u64::MAX, 5])) as ArrayRef),
        ("ts", Arc::new(UInt64Array::from(vec![10_u64, 20])) as ArrayRef),
    ])
    .unwrap();
    let right = RecordBatch::try_from_iter(vec![
        ("k", Arc::new(Int64Array::from(vec![None, Some(5)])) as ArrayRef),
        ("ts", Arc::new(UInt64Array::from(vec![30_u64, 40])) as ArrayRef),
    ])
    .unwrap();
    let config = HashJoinConfig::builder()
        .tumbling(100)
        .left_schema(left.schema())
        .right_schema(right.schema())
        .on("k", "k")
        .time(TimeFunction::event_time("ts"))
        .build()
        .unwrap();
    assert_eq!(config.key_types(), &[DataType::Int64]);

    let handler = handler(config);
    let mut driver = Driver::new(&handler);
    driver.left.execute(&left).unwrap();
    driver.right.execute(&right).unwrap();
    let outputs = driver.watermark(100);
    assert_eq!(outputs.iter().map(WindowOutput::num_rows).sum::<usize>(), 1);
}

#[test]
fn test_windows_without_matches_emit_nothing() {
    let handler = handler(config(100, 100));
    let mut driver = Driver::new(&handler);
    driver.left.execute(&side(&[1], &[10], &[0])).unwrap();
    driver.right.execute(&side(&[2], &[20], &[0])).unwrap();
    driver.left.execute(&side(&[3], &[110], &[0])).unwrap();

    assert!(driver.watermark(300).is_empty());
    assert_eq!(handler.metrics().store.windows_triggered, 2);
    assert_eq!(handler.store().slice_count(), 0);
}

#[test]
fn test_late_rows_are_dropped() {
    let handler = handler(config(100, 100));
    let mut driver = Driver::new(&handler);
    driver.left.execute(&side(&[1], &[150], &[0])).unwrap();
    driver.watermark(100);

    let accepted = driver
        .right
        .execute(&side(&[1, 1], &[50, 160], &[0, 1]))
        .unwrap();
    assert_eq!(accepted, 1);
    assert_eq!(handler.metrics().store.late_records, 1);
    assert_eq!(handler.metrics().right_records, 1);

    let outputs = driver.watermark(200);
    assert_eq!(rows(&outputs), vec![(100, 200, (1, 150, 0), (1, 160, 1))]);
}

#[test]
fn test_slowest_origin_gates_trigger() {
    let (left_origin, right_origin) = (OriginId(1), OriginId(2));
    let handler = handler_with(
        config(100, 100),
        &[left_origin, right_origin],
        &EngineConfig::default(),
    );
    let driver = Driver::new(&handler);
    driver.left.execute(&side(&[4], &[10], &[0])).unwrap();
    driver.right.execute(&side(&[4], &[90], &[0])).unwrap();

    let update = |watermark, origin| WatermarkUpdate::new(watermark, SequenceData::single(1), origin);
    assert!(driver.probe.on_watermark(update(500, left_origin)).unwrap().is_empty());
    assert_eq!(handler.watermark(), Watermark::new(0));

    let outputs = driver.probe.on_watermark(update(100, right_origin)).unwrap();
    assert_eq!(outputs.len(), 1);
    assert_eq!(handler.watermark(), Watermark::new(100));

    let err = driver.probe.on_watermark(update(600, OriginId(9))).unwrap_err();
    assert!(matches!(err, OperatorError::Time(_)));
}

#[test]
fn test_emit_batch_rows_splits_output() {
    let engine = EngineConfig::builder().emit_batch_rows(2).build().unwrap();
    let handler = handler_with(config(100, 100), &[ORIGIN], &engine);
    let mut driver = Driver::new(&handler);
    driver.left.execute(&side(&[1], &[10], &[0])).unwrap();
    driver
        .right
        .execute(&side(&[1; 5], &[11, 12, 13, 14, 15], &[1, 2, 3, 4, 5]))
        .unwrap();

    let outputs = driver.watermark(100);
    assert_eq!(outputs.len(), 1);
    let sizes: Vec<_> = outputs[0].batches.iter().map(RecordBatch::num_rows).collect();
    assert_eq!(sizes, vec![2, 2, 1]);
    assert_eq!(handler.metrics().matches, 5);
}

#[test]
fn test_schema_mismatch_rejected() {
    let handler = handler(config(100, 100));
    let driver = Driver::new(&handler);
    let wrong = RecordBatch::try_from_iter(vec![
        ("id", Arc::new(StringArray::from(vec!["a"])) as ArrayRef),
        ("ts", Arc::new(UInt64Array::from(vec![10_u64])) as ArrayRef),
        ("value", Arc::new(Int64Array::from(vec![0])) as ArrayRef),
    ])
    .unwrap();
    let err = driver.right.execute(&wrong).unwrap_err();
    assert!(matches!(err, OperatorError::SchemaMismatch(msg) if msg.starts_with("right")));

    let narrow = RecordBatch::try_from_iter(vec![(
        "id",
        Arc::new(Int64Array::from(vec![1])) as ArrayRef,
    )])
    .unwrap();
    assert!(matches!(
        driver.left.execute(&narrow),
        Err(OperatorError::SchemaMismatch(_))
    ));
    assert_eq!(driver.left.execute(&side(&[], &[], &[])).unwrap(), 0);
}

#[test]
fn test_config_errors() {
    let base = || {
        HashJoinConfig::builder()
            .tumbling(100)
            .left_schema(schema())
            .right_schema(schema())
            .time(TimeFunction::event_time("ts"))
    };

    assert!(matches!(base().build(), Err(OperatorError::InvalidConfig(_))));
    assert!(matches!(
        base().on("id", "missing").build(),
        Err(OperatorError::ColumnNotFound(c)) if c == "missing"
    ));
    assert!(matches!(
        base().sliding(100, 0).on("id", "id").build(),
        Err(OperatorError::InvalidWindow { .. })
    ));
    assert!(matches!(
        base()
            .on("id", "id")
            .key_types(vec![DataType::Int64, DataType::Int64])
            .build(),
        Err(OperatorError::InvalidConfig(_))
    ));
    assert!(matches!(
        base().on("id", "id").left_time(TimeFunction::event_time("nope")).build(),
        Err(OperatorError::Time(_))
    ));

    let strings = Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, true),
        Field::new("ts", DataType::UInt64, false),
    ]));
    assert!(matches!(
        base().right_schema(strings).on("id", "id").build(),
        Err(OperatorError::UnsupportedType { .. })
    ));
    assert!(matches!(
        HashJoinConfig::builder().tumbling(100).on("id", "id").build(),
        Err(OperatorError::InvalidConfig(_))
    ));
}

#[test]
fn test_graceful_stop_flushes_open_windows() {
    let handler = handler(config(100, 50));
    let driver = Driver::new(&handler);
    driver.left.execute(&side(&[1], &[120], &[0])).unwrap();
    driver.right.execute(&side(&[1], &[130], &[1])).unwrap();

    let flushed = handler.stop(QueryTerminationType::Graceful).unwrap();
    let windows: Vec<_> = flushed.iter().map(|o| (o.start(), o.end())).collect();
    assert_eq!(windows, vec![(50, 150), (100, 200)]);
    assert_eq!(handler.store().slice_count(), 0);

    assert!(handler.stop(QueryTerminationType::Graceful).unwrap().is_empty());
    assert!(matches!(
        driver.left.execute(&side(&[1], &[500], &[0])),
        Err(OperatorError::HandlerStopped(2))
    ));
    assert!(matches!(
        handler.snapshot(0),
        Err(OperatorError::HandlerStopped(_))
    ));
}

#[test]
fn test_hard_stop_discards_open_windows() {
    let handler = handler(config(100, 100));
    let driver = Driver::new(&handler);
    driver.left.execute(&side(&[1], &[10], &[0])).unwrap();
    driver.right.execute(&side(&[1], &[20], &[0])).unwrap();

    assert!(handler.stop(QueryTerminationType::HardStop).unwrap().is_empty());
    assert_eq!(handler.metrics().matches, 0);
    assert!(driver
        .probe
        .on_watermark(WatermarkUpdate::new(100, SequenceData::single(1), ORIGIN))
        .is_err());
}

#[test]
fn test_snapshot_restore_continues() {
    let (size, slide) = (100, 25);
    let left = records(120, 400, 21);
    let right = records(120, 400, 23);
    let (early_left, late_left) = left.split_at(60);
    let (early_right, late_right) = right.split_at(60);

    let original = handler(config(size, slide));
    let mut driver = Driver::new(&original);
    driver.left.execute(&batch_of(early_left)).unwrap();
    driver.right.execute(&batch_of(early_right)).unwrap();
    let mut outputs = driver.watermark(1200);
    let bytes = original.snapshot(0).unwrap();

    let engine = EngineConfig::default();
    let ctx = PipelineExecutionContext::new(1, engine.clone());
    let restored = Arc::new(
        JoinOperatorHandler::restore(OperatorHandlerId(3), config(size, slide), &engine, &bytes)
            .unwrap(),
    );
    restored.start(&ctx).unwrap();
    assert_eq!(restored.watermark(), Watermark::new(1200));

    let mut resumed = Driver::new(&restored);
    resumed.sequence = driver.sequence;
    let on_time = |records: &[(i64, u64, i64)]| -> Vec<(i64, u64, i64)> {
        records.iter().copied().filter(|r| r.1 >= 1200).collect()
    };
    let (late_left, late_right) = (on_time(late_left), on_time(late_right));
    resumed.left.execute(&batch_of(&late_left)).unwrap();
    resumed.right.execute(&batch_of(&late_right)).unwrap();
    let continued = resumed.watermark(2000);
    assert!(continued
        .iter()
        .all(|o| o.sequence_number >= outputs.last().map_or(1, |l| l.sequence_number + 1)));
    outputs.extend(continued);

    let all_left: Vec<_> = early_left.iter().copied().chain(late_left).collect();
    let all_right: Vec<_> = early_right.iter().copied().chain(late_right).collect();
    assert_eq!(rows(&outputs), brute_force(&all_left, &all_right, size, slide, 2000));
}

#[test]
fn test_restore_rejects_aggregation_snapshot() {
    let bytes = crate::state::encode(SnapshotKind::Aggregation, &7_u64).unwrap();
    let err = JoinOperatorHandler::restore(
        OperatorHandlerId(4),
        config(100, 100),
        &EngineConfig::default(),
        &bytes,
    )
    .unwrap_err();
    assert!(matches!(err, OperatorError::State(_)));
}

#[test]
fn test_concurrent_builds() {
    let (size, slide) = (50, 10);
    let engine = EngineConfig::builder().worker_threads(4).build().unwrap();
    let handler = handler_with(config(size, slide), &[ORIGIN], &engine);
    let left = records(400, 800, 31);
    let right = records(400, 800, 37);

    std::thread::scope(|scope| {
        for (l, r) in left.chunks(100).zip(right.chunks(100)) {
            let left_build = JoinBuild::left(Arc::clone(&handler));
            let right_build = JoinBuild::right(Arc::clone(&handler));
            scope.spawn(move || {
                for chunk in l.chunks(10) {
                    left_build.execute(&batch_of(chunk)).unwrap();
                }
            });
            scope.spawn(move || {
                for chunk in r.chunks(10) {
                    right_build.execute(&batch_of(chunk)).unwrap();
                }
            });
        }
    });

    let mut driver = Driver::new(&handler);
    let outputs = driver.watermark(1900);
    assert_eq!(rows(&outputs), brute_force(&left, &right, size, slide, 1900));
    assert_eq!(handler.metrics().left_records, 400);
}
