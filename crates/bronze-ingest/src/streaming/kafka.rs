//! Kafka-backed [`MessageSource`]
//!
//! Partitions are assigned manually and positioned from the checkpoint log;
//! the consumer group is throwaway and nothing is committed to the broker.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_msk_iam_sasl_signer::generate_auth_token;
use aws_types::region::Region;
use bronze_common::BronzeError;
use chrono::DateTime;
use rdkafka::client::OAuthToken;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, ConsumerContext, StreamConsumer};
use rdkafka::{ClientContext, Message, Offset, TopicPartitionList};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::record::SourceMessage;
use super::source::{MessageSource, PartitionOffsets};

const METADATA_TIMEOUT: Duration = Duration::from_secs(30);

/// `security.protocol` values understood by librdkafka
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityProtocol {
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "PLAINTEXT",
            SecurityProtocol::Ssl => "SSL",
            SecurityProtocol::SaslPlaintext => "SASL_PLAINTEXT",
            SecurityProtocol::SaslSsl => "SASL_SSL",
        }
    }

    /// MSK IAM authentication is only wired for SASL over TLS
    pub fn uses_iam(&self) -> bool {
        matches!(self, SecurityProtocol::SaslSsl)
    }
}

impl fmt::Display for SecurityProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecurityProtocol {
    type Err = BronzeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PLAINTEXT" => Ok(SecurityProtocol::Plaintext),
            "SSL" => Ok(SecurityProtocol::Ssl),
            "SASL_PLAINTEXT" => Ok(SecurityProtocol::SaslPlaintext),
            "SASL_SSL" => Ok(SecurityProtocol::SaslSsl),
            other => Err(BronzeError::Config(format!(
                "unknown kafka security protocol '{}'",
                other
            ))),
        }
    }
}

/// Connection settings shared by every consumer of a job
#[derive(Debug, Clone)]
pub struct KafkaSettings {
    pub bootstrap_servers: String,
    pub topic: String,
    pub security_protocol: SecurityProtocol,
    /// Region used to sign MSK IAM tokens
    pub aws_region: Option<String>,
}

impl KafkaSettings {
    /// librdkafka properties for one consumer; `query_name` keeps the
    /// group ids of the main and audit consumers apart in broker logs.
    pub fn client_properties(&self, query_name: &str) -> Vec<(&'static str, String)> {
        let mut props = vec![
            ("bootstrap.servers", self.bootstrap_servers.clone()),
            ("security.protocol", self.security_protocol.to_string()),
            ("group.id", format!("bronze-{}-{}", query_name, uuid::Uuid::new_v4())),
            ("enable.auto.commit", "false".to_string()),
            ("enable.auto.offset.store", "false".to_string()),
            ("auto.offset.reset", "latest".to_string()),
        ];
        if self.security_protocol.uses_iam() {
            props.push(("sasl.mechanism", "OAUTHBEARER".to_string()));
        }
        props
    }

    pub fn client_config(&self, query_name: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        for (key, value) in self.client_properties(query_name) {
            config.set(key, value);
        }
        config
    }

    fn token_context(&self) -> Result<IamTokenContext> {
        if !self.security_protocol.uses_iam() {
            return Ok(IamTokenContext { signer: None });
        }
        let region = self
            .aws_region
            .clone()
            .ok_or_else(|| BronzeError::Config("SASL_SSL requires an AWS region".to_string()))?;
        let runtime = tokio::runtime::Handle::try_current()
            .context("Kafka IAM authentication needs a tokio runtime")?;
        Ok(IamTokenContext {
            signer: Some(TokenSigner {
                region: Region::new(region),
                runtime,
            }),
        })
    }
}

#[derive(Clone)]
struct TokenSigner {
    region: Region,
    runtime: tokio::runtime::Handle,
}

/// Client context that mints MSK IAM OAUTHBEARER tokens on demand
#[derive(Clone)]
pub struct IamTokenContext {
    signer: Option<TokenSigner>,
}

impl ClientContext for IamTokenContext {
    const ENABLE_REFRESH_OAUTH_TOKEN: bool = true;

    fn generate_oauth_token(
        &self,
        _oauthbearer_config: Option<&str>,
    ) -> std::result::Result<OAuthToken, Box<dyn std::error::Error>> {
        let Some(signer) = self.signer.clone() else {
            return Err("OAUTHBEARER requested without IAM authentication".into());
        };
        // librdkafka calls this from its own thread; the signer is async
        let (token, expiration_ms) = std::thread::spawn(move || {
            signer
                .runtime
                .block_on(generate_auth_token(signer.region.clone()))
                .map_err(|e| e.to_string())
        })
        .join()
        .map_err(|_| "token signer thread panicked")??;

        debug!(expiration_ms, "Refreshed MSK IAM token");
        Ok(OAuthToken {
            token,
            principal_name: String::new(),
            lifetime_ms: expiration_ms,
        })
    }
}

impl ConsumerContext for IamTokenContext {}

/// Manually-assigned consumer over every partition of one topic
pub struct KafkaSource {
    consumer: Arc<StreamConsumer<IamTokenContext>>,
    topic: String,
}

impl KafkaSource {
    pub fn connect(settings: &KafkaSettings, query_name: &str) -> Result<Self> {
        let context = settings.token_context()?;
        let consumer: StreamConsumer<IamTokenContext> = settings
            .client_config(query_name)
            .create_with_context(context)
            .with_context(|| format!("create consumer for {}", settings.bootstrap_servers))?;

        info!(
            brokers = %settings.bootstrap_servers,
            topic = %settings.topic,
            protocol = %settings.security_protocol,
            query = query_name,
            "Kafka consumer created"
        );
        Ok(Self {
            consumer: Arc::new(consumer),
            topic: settings.topic.clone(),
        })
    }

    async fn partitions(&self) -> Result<Vec<i32>> {
        let consumer = self.consumer.clone();
        let topic = self.topic.clone();

        // metadata fetch blocks on the broker round trip
        tokio::task::spawn_blocking(move || -> Result<Vec<i32>> {
            let metadata = consumer
                .fetch_metadata(Some(&topic), METADATA_TIMEOUT)
                .with_context(|| format!("fetch metadata for topic {}", topic))?;
            let partitions: Vec<i32> = metadata
                .topics()
                .iter()
                .filter(|t| t.name() == topic)
                .flat_map(|t| t.partitions().iter().map(|p| p.id()))
                .collect();
            Ok(partitions)
        })
        .await
        .context("metadata task panicked")?
    }

    /// High watermark of each partition, the offset the next produced
    /// message will get
    async fn high_watermarks(&self, partitions: Vec<i32>) -> Result<PartitionOffsets> {
        let consumer = self.consumer.clone();
        let topic = self.topic.clone();

        tokio::task::spawn_blocking(move || -> Result<PartitionOffsets> {
            let mut ends = PartitionOffsets::new();
            for partition in partitions {
                let (_, high) = consumer
                    .fetch_watermarks(&topic, partition, METADATA_TIMEOUT)
                    .with_context(|| format!("fetch watermarks of {}[{}]", topic, partition))?;
                ends.insert(partition, high);
            }
            Ok(ends)
        })
        .await
        .context("watermark task panicked")?
    }

    async fn topic_partitions(&self) -> Result<Vec<i32>> {
        let partitions = self.partitions().await?;
        if partitions.is_empty() {
            return Err(BronzeError::NotFound(format!("kafka topic {}", self.topic)).into());
        }
        Ok(partitions)
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn end_offsets(&mut self) -> Result<PartitionOffsets> {
        let partitions = self.topic_partitions().await?;
        self.high_watermarks(partitions).await
    }

    async fn seek(&mut self, offsets: &PartitionOffsets) -> Result<PartitionOffsets> {
        let partitions = self.topic_partitions().await?;
        let unknown: Vec<i32> = partitions
            .iter()
            .copied()
            .filter(|p| !offsets.contains_key(p))
            .collect();
        let fresh = unknown.len();
        let ends = self.high_watermarks(unknown).await?;

        let mut resolved = PartitionOffsets::new();
        let mut assignment = TopicPartitionList::new();
        for partition in &partitions {
            let Some(next) = offsets.get(partition).or_else(|| ends.get(partition)).copied() else {
                continue;
            };
            assignment
                .add_partition_offset(&self.topic, *partition, Offset::Offset(next))
                .with_context(|| format!("assign {}[{}]", self.topic, partition))?;
            resolved.insert(*partition, next);
        }
        for stale in offsets.keys().filter(|p| !partitions.contains(p)) {
            warn!(topic = %self.topic, partition = stale, "Checkpointed partition no longer exists");
        }

        self.consumer
            .assign(&assignment)
            .with_context(|| format!("assign partitions of {}", self.topic))?;
        info!(
            topic = %self.topic,
            partitions = partitions.len(),
            resumed = partitions.len() - fresh,
            from_end = fresh,
            "Partitions assigned"
        );
        Ok(resolved)
    }

    async fn next_message(&mut self) -> Result<Option<SourceMessage>> {
        let message = self
            .consumer
            .recv()
            .await
            .with_context(|| format!("receive from {}", self.topic))?;

        Ok(Some(SourceMessage {
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec),
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            timestamp: message
                .timestamp()
                .to_millis()
                .and_then(DateTime::from_timestamp_millis),
        }))
    }
}
