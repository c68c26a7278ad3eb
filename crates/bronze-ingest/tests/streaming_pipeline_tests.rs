//! Streaming pipeline integration tests
//!
//! Flows run against an in-memory source and a temporary directory, so no
//! broker or object store is needed.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use bronze_ingest::config::StreamingJobConfig;
use bronze_ingest::storage::StorageUri;
use bronze_ingest::streaming::checkpoint::CheckpointLog;
use bronze_ingest::streaming::kafka::{KafkaSettings, SecurityProtocol};
use bronze_ingest::streaming::{
    build_queries, Enricher, FlowSupervisor, PartitionOffsets, PartitionedTransactionSink,
    StreamingQuery,
};
use common::{message, transaction, AfterLast, TopicLog, VecSource, TOPIC};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn job_config(root: &Path, audit_enabled: bool) -> StreamingJobConfig {
    StreamingJobConfig {
        job_name: "bronze-transactions".to_string(),
        kafka: KafkaSettings {
            bootstrap_servers: "localhost:9092".to_string(),
            topic: TOPIC.to_string(),
            security_protocol: SecurityProtocol::Plaintext,
            aws_region: None,
        },
        target_path: StorageUri::Local(root.join("bronze")),
        schema_registry_url: "http://registry:8081".to_string(),
        audit_enabled,
        audit_table: StorageUri::Local(root.join("audit")),
        trigger: Duration::from_millis(50),
    }
}

fn main_query(root: &Path, source: VecSource) -> StreamingQuery {
    let target = common::local_location(root, "bronze");
    StreamingQuery::new(
        "main",
        source.boxed(),
        Box::new(PartitionedTransactionSink::new(target.clone())),
        CheckpointLog::new(&target),
        Enricher::new(TOPIC),
    )
    .with_trigger(Duration::from_millis(50))
}

fn sample_messages() -> Vec<bronze_ingest::streaming::SourceMessage> {
    vec![
        message(0, 0, Some(&transaction("tx-1", "purchase", 10.0))),
        message(0, 1, Some(&transaction("tx-2", "refund", -4.5))),
        message(1, 0, Some(&transaction("tx-3", "purchase", 99.9))),
    ]
}

#[tokio::test]
async fn test_valid_messages_keep_fields_and_gain_lineage() {
    let dir = tempfile::tempdir().unwrap();
    let progress = main_query(dir.path(), VecSource::new(sample_messages(), AfterLast::End))
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(progress.records, 3);
    assert_eq!(progress.offsets.get(&0), Some(&2));
    assert_eq!(progress.offsets.get(&1), Some(&1));

    assert!(common::exists(
        dir.path(),
        "bronze/transaction_type=purchase/part-00000.snappy.parquet"
    ));
    assert!(common::exists(
        dir.path(),
        "bronze/transaction_type=refund/part-00000.snappy.parquet"
    ));

    let files = common::read_parquet_files(&common::local_location(dir.path(), "bronze")).await;
    let mut ids = BTreeSet::new();
    for (key, batch) in &files {
        let schema = batch.schema();
        assert!(schema.field_with_name("transaction_type").is_err(), "{}", key);
        for column in [
            "kafka_timestamp",
            "ingestion_timestamp",
            "data_source",
            "transaction_timestamp",
        ] {
            assert!(schema.field_with_name(column).is_ok(), "{} missing {}", key, column);
        }
        assert!(common::strings(batch, "data_source")
            .iter()
            .all(|s| s.as_deref() == Some(TOPIC)));
        assert!(common::strings(batch, "currency")
            .iter()
            .all(|s| s.as_deref() == Some("EUR")));
        ids.extend(common::strings(batch, "id").into_iter().flatten());
    }
    assert_eq!(ids, BTreeSet::from(["tx-1".into(), "tx-2".into(), "tx-3".into()]));
}

#[tokio::test]
async fn test_malformed_messages_surface_as_nulls() {
    let dir = tempfile::tempdir().unwrap();
    let messages = vec![
        message(0, 0, Some("this is not json")),
        message(0, 1, Some(r#"{"id": "tx-9", "amount": "a lot"}"#)),
        message(0, 2, None),
    ];
    let progress = main_query(dir.path(), VecSource::new(messages, AfterLast::End))
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(progress.records, 3);

    let files = common::read_parquet_files(&common::local_location(dir.path(), "bronze")).await;
    assert_eq!(files.len(), 1);
    let (key, batch) = &files[0];
    assert!(key.contains("transaction_type=__HIVE_DEFAULT_PARTITION__"));
    assert_eq!(batch.num_rows(), 3);
    assert_eq!(
        common::strings(batch, "id"),
        vec![None, Some("tx-9".to_string()), None]
    );
}

#[tokio::test]
async fn test_audit_disabled_writes_nothing_to_audit_path() {
    let dir = tempfile::tempdir().unwrap();
    let config = job_config(dir.path(), false);
    let target = common::local_location(dir.path(), "bronze");

    let queries = build_queries(&config, target, None, |_| {
        Ok(VecSource::new(sample_messages(), AfterLast::End).boxed())
    })
    .await
    .unwrap();
    assert_eq!(queries.len(), 1);

    let mut supervisor = FlowSupervisor::new(&CancellationToken::new());
    for query in queries {
        supervisor.spawn(query);
    }
    let progress = supervisor.wait().await.unwrap();

    assert_eq!(progress.len(), 1);
    assert!(!dir.path().join("audit").exists());
}

#[tokio::test]
async fn test_audit_enabled_mirrors_every_record() {
    let dir = tempfile::tempdir().unwrap();
    let config = job_config(dir.path(), true);
    let target = common::local_location(dir.path(), "bronze");
    let audit = common::local_location(dir.path(), "audit");

    let queries = build_queries(&config, target.clone(), Some(audit.clone()), |_| {
        Ok(VecSource::new(sample_messages(), AfterLast::End).boxed())
    })
    .await
    .unwrap();
    assert_eq!(queries.len(), 2);

    let mut supervisor = FlowSupervisor::new(&CancellationToken::new());
    for query in queries {
        supervisor.spawn(query);
    }
    supervisor.wait().await.unwrap();

    let mut main_rows: Vec<_> = common::read_parquet_files(&target)
        .await
        .iter()
        .flat_map(|(_, b)| common::row_positions(b))
        .collect();
    let audit_files = common::read_parquet_files(&audit).await;
    let mut audit_rows: Vec<_> = audit_files
        .iter()
        .flat_map(|(_, b)| common::row_positions(b))
        .collect();
    main_rows.sort();
    audit_rows.sort();

    assert_eq!(main_rows.len(), 3);
    assert_eq!(main_rows, audit_rows);
    assert!(audit_files[0]
        .1
        .schema()
        .field_with_name("processed_timestamp")
        .is_ok());
    assert!(common::exists(dir.path(), "audit/_checkpoints/metadata"));
}

#[tokio::test]
async fn test_restart_resumes_after_committed_offsets() {
    let dir = tempfile::tempdir().unwrap();

    let first = VecSource::new(sample_messages(), AfterLast::End);
    main_query(dir.path(), first)
        .run(CancellationToken::new())
        .await
        .unwrap();

    // a batch that was written but never committed
    let target = common::local_location(dir.path(), "bronze");
    target
        .put(
            "transaction_type=stale/part-00001.snappy.parquet",
            bytes::Bytes::from_static(b"partial"),
        )
        .await
        .unwrap();

    // the broker still holds everything plus two new messages
    let mut replay = sample_messages();
    replay.push(message(0, 2, Some(&transaction("tx-4", "refund", 1.0))));
    replay.push(message(1, 1, Some(&transaction("tx-5", "purchase", 2.0))));
    let second = VecSource::new(replay, AfterLast::End);
    let seeks = second.seeks();

    let progress = main_query(dir.path(), second)
        .run(CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(seeks.lock().unwrap()[0].get(&0), Some(&2));
    assert_eq!(progress.records, 2);
    assert_eq!(progress.last_batch_id, Some(1));
    assert!(!common::exists(
        dir.path(),
        "bronze/transaction_type=stale/part-00001.snappy.parquet"
    ));

    let mut positions: Vec<_> = common::read_parquet_files(&target)
        .await
        .iter()
        .flat_map(|(_, b)| common::row_positions(b))
        .collect();
    positions.sort();
    positions.dedup();
    assert_eq!(positions.len(), 5);
}

#[tokio::test]
async fn test_idle_partition_resumes_from_its_start_offset() {
    let dir = tempfile::tempdir().unwrap();
    let topic = TopicLog::new(&[0, 1]);
    for i in 0..6 {
        topic.produce(0, &transaction(&format!("tx-{}", i), "purchase", 1.0));
    }

    let first = main_query(dir.path(), topic.consumer(AfterLast::End).from_earliest())
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.records, 6);
    assert_eq!(first.offsets, PartitionOffsets::from([(0, 6), (1, 0)]));

    // produced while the job was down, partition 1 for the first time
    topic.produce(1, &transaction("tx-idle", "refund", 3.0));
    topic.produce(0, &transaction("tx-6", "purchase", 1.0));

    let second = main_query(dir.path(), topic.consumer(AfterLast::End))
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.records, 2);

    let target = common::local_location(dir.path(), "bronze");
    let latest = CheckpointLog::new(&target).latest().await.unwrap().unwrap();
    assert_eq!(latest.offsets, PartitionOffsets::from([(0, 7), (1, 1)]));

    let positions: Vec<_> = common::read_parquet_files(&target)
        .await
        .iter()
        .flat_map(|(_, b)| common::row_positions(b))
        .collect();
    assert_eq!(positions.len(), 8);
    assert!(positions.contains(&(Some("tx-idle".to_string()), 1, 0)));
}

#[tokio::test]
async fn test_restart_before_first_commit_keeps_start_position() {
    let dir = tempfile::tempdir().unwrap();
    let topic = TopicLog::new(&[0]);
    topic.produce(0, &transaction("tx-old", "purchase", 1.0));

    let first = main_query(dir.path(), topic.consumer(AfterLast::End))
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.batches, 0);

    topic.produce(0, &transaction("tx-new", "purchase", 2.0));
    let second = main_query(dir.path(), topic.consumer(AfterLast::End))
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.records, 1);

    let files = common::read_parquet_files(&common::local_location(dir.path(), "bronze")).await;
    let ids: Vec<_> = files
        .iter()
        .flat_map(|(_, b)| common::strings(b, "id"))
        .collect();
    assert_eq!(ids, vec![Some("tx-new".to_string())]);
}

#[tokio::test]
async fn test_flows_started_apart_share_their_start_offsets() {
    let dir = tempfile::tempdir().unwrap();
    let config = job_config(dir.path(), true);
    let target = common::local_location(dir.path(), "bronze");
    let audit = common::local_location(dir.path(), "audit");
    let topic = TopicLog::new(&[0]);
    topic.produce(0, &transaction("tx-old", "purchase", 1.0));

    let queries = build_queries(&config, target.clone(), Some(audit.clone()), |_| {
        Ok(topic.consumer(AfterLast::End).boxed())
    })
    .await
    .unwrap();
    let mut queries = queries.into_iter();
    let main = queries.next().unwrap();
    let audit_query = queries.next().unwrap();

    topic.produce(0, &transaction("tx-1", "purchase", 5.0));
    main.run(CancellationToken::new()).await.unwrap();

    // the audit flow is assigned only after the main flow has caught up
    audit_query.run(CancellationToken::new()).await.unwrap();

    let main_rows: Vec<_> = common::read_parquet_files(&target)
        .await
        .iter()
        .flat_map(|(_, b)| common::row_positions(b))
        .collect();
    let audit_rows: Vec<_> = common::read_parquet_files(&audit)
        .await
        .iter()
        .flat_map(|(_, b)| common::row_positions(b))
        .collect();
    assert_eq!(main_rows, vec![(Some("tx-1".to_string()), 0, 1)]);
    assert_eq!(main_rows, audit_rows);
}

#[tokio::test]
async fn test_trigger_flushes_and_cancel_stops_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let query = main_query(
        dir.path(),
        VecSource::new(sample_messages(), AfterLast::Block),
    );
    let handle = tokio::spawn(query.run(cancel.clone()));

    let log = CheckpointLog::new(&common::local_location(dir.path(), "bronze"));
    let mut committed = None;
    for _ in 0..100 {
        committed = log.latest().await.unwrap();
        if committed.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(committed.map(|c| c.records), Some(3));

    cancel.cancel();
    let progress = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(progress.batches, 1);
}

#[tokio::test]
async fn test_failing_flow_cancels_its_sibling() {
    let dir = tempfile::tempdir().unwrap();
    let config = job_config(dir.path(), true);
    let target = common::local_location(dir.path(), "bronze");
    let audit = common::local_location(dir.path(), "audit");

    let queries = build_queries(&config, target, Some(audit), |name| {
        let after_last = if name == "audit" {
            AfterLast::Fail
        } else {
            AfterLast::Block
        };
        Ok(VecSource::new(Vec::new(), after_last).boxed())
    })
    .await
    .unwrap();

    let mut supervisor = FlowSupervisor::new(&CancellationToken::new());
    for query in queries {
        supervisor.spawn(query);
    }
    let err = tokio::time::timeout(Duration::from_secs(5), supervisor.wait())
        .await
        .expect("main flow should be cancelled")
        .unwrap_err();

    let message = format!("{:#}", err);
    assert!(message.contains("audit flow failed"), "{}", message);
    assert!(message.contains("broker connection lost"), "{}", message);
}
