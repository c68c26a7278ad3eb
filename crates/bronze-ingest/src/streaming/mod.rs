//! Streaming ingestion: Kafka topic to partitioned Parquet
//!
//! A job runs one [`StreamingQuery`] per flow: the main flow writes
//! transactions partitioned by type, and the optional audit flow writes a
//! narrow audit projection from its own consumer. Both flows start from the
//! same resolved offsets and share nothing else but a cancellation token; see
//! [`FlowSupervisor`].

use anyhow::{anyhow, Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod checkpoint;
pub mod kafka;
pub mod query;
pub mod record;
pub mod schema;
pub mod sink;
pub mod source;

pub use checkpoint::{CheckpointLog, CommitEntry};
pub use kafka::{KafkaSettings, KafkaSource, SecurityProtocol};
pub use query::{QueryProgress, StreamingQuery};
pub use record::{AuditRecord, EnrichedTransaction, Enricher, SourceMessage};
pub use schema::Transaction;
pub use sink::{AuditSink, MicroBatchSink, PartitionedTransactionSink};
pub use source::{MessageSource, PartitionOffsets};

use crate::config::StreamingJobConfig;
use crate::storage::{Location, StorageResolver};

pub const MAIN_QUERY: &str = "main";
pub const AUDIT_QUERY: &str = "audit";

/// Runs flows concurrently; the first failure cancels the rest
pub struct FlowSupervisor {
    tasks: JoinSet<Result<QueryProgress>>,
    cancel: CancellationToken,
}

impl FlowSupervisor {
    /// Flows stop when `parent` is cancelled, or when any sibling fails
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            tasks: JoinSet::new(),
            cancel: parent.child_token(),
        }
    }

    pub fn spawn(&mut self, query: StreamingQuery) {
        let name = query.name().to_string();
        let token = self.cancel.clone();
        self.tasks.spawn(async move {
            query
                .run(token)
                .await
                .with_context(|| format!("{} flow failed", name))
        });
    }

    /// Wait for every flow to finish.
    ///
    /// Returns the progress of all flows, or the first error once the
    /// remaining flows have wound down.
    pub async fn wait(mut self) -> Result<Vec<QueryProgress>> {
        let mut finished = Vec::new();
        let mut failure: Option<anyhow::Error> = None;

        while let Some(joined) = self.tasks.join_next().await {
            let outcome = match joined {
                Ok(result) => result,
                Err(e) => Err(anyhow!("flow task aborted: {}", e)),
            };
            match outcome {
                Ok(progress) => finished.push(progress),
                Err(e) if failure.is_none() => {
                    error!(error = %format!("{:#}", e), "Flow failed, stopping the others");
                    self.cancel.cancel();
                    failure = Some(e);
                },
                Err(e) => warn!(error = %format!("{:#}", e), "Additional flow failure"),
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(finished),
        }
    }
}

/// Assemble the main flow and, if enabled, the audit flow.
///
/// `connect` opens one independent source per flow, given the flow name.
/// The topic's end offsets are read once here and handed to every flow, so
/// flows starting without a checkpoint begin at the same position.
pub async fn build_queries<F>(
    config: &StreamingJobConfig,
    target: Location,
    audit: Option<Location>,
    mut connect: F,
) -> Result<Vec<StreamingQuery>>
where
    F: FnMut(&str) -> Result<Box<dyn MessageSource>>,
{
    let mut main_source = connect(MAIN_QUERY)?;
    let initial = main_source
        .end_offsets()
        .await
        .context("resolve starting offsets")?;
    debug!(offsets = ?initial, "Resolved starting offsets");

    let enricher = Enricher::new(&config.kafka.topic);
    let mut queries = vec![StreamingQuery::new(
        MAIN_QUERY,
        main_source,
        Box::new(PartitionedTransactionSink::new(target.clone())),
        CheckpointLog::new(&target),
        enricher.clone(),
    )
    .with_trigger(config.trigger)
    .with_initial_offsets(initial.clone())];

    if let Some(audit) = audit {
        queries.push(
            StreamingQuery::new(
                AUDIT_QUERY,
                connect(AUDIT_QUERY)?,
                Box::new(AuditSink::new(audit.clone())),
                CheckpointLog::new(&audit),
                enricher,
            )
            .with_trigger(config.trigger)
            .with_initial_offsets(initial),
        );
    }
    Ok(queries)
}

/// Run the streaming job until cancelled or a flow fails
pub async fn run_job(
    config: StreamingJobConfig,
    resolver: &StorageResolver,
    cancel: CancellationToken,
) -> Result<Vec<QueryProgress>> {
    debug!(
        schema_registry_url = %config.schema_registry_url,
        "Schema registry configured; records are decoded with the built-in schema"
    );

    let target = resolver.resolve(&config.target_path).await;
    let audit = if config.audit_enabled {
        Some(resolver.resolve(&config.audit_table).await)
    } else {
        None
    };

    info!(
        job = %config.job_name,
        topic = %config.kafka.topic,
        target = %target.uri(),
        audit = audit.as_ref().map(|a| a.uri()).unwrap_or_else(|| "disabled".to_string()),
        "Starting streaming job"
    );

    let kafka = config.kafka.clone();
    let queries = build_queries(&config, target, audit, |name| {
        Ok(Box::new(KafkaSource::connect(&kafka, name)?) as Box<dyn MessageSource>)
    })
    .await?;

    let mut supervisor = FlowSupervisor::new(&cancel);
    for query in queries {
        supervisor.spawn(query);
    }
    supervisor.wait().await
}
