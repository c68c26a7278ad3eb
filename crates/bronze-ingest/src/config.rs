//! Job parameters
//!
//! Command-line flags keep the job-argument names the jobs were deployed
//! with (`--JOB_NAME`, `--kafka_topic`, ...) and fall back to environment
//! variables. Each set of raw arguments is resolved once into a validated
//! job config.

use anyhow::Result;
use bronze_common::BronzeError;
use clap::Args;
use std::time::Duration;

use crate::batch::FileFormat;
use crate::storage::StorageUri;
use crate::streaming::{KafkaSettings, SecurityProtocol};

/// Default seconds between micro-batches
pub const DEFAULT_TRIGGER_INTERVAL_SECS: u64 = 60;

/// Arguments of `bronze-ingest stream`
#[derive(Args, Debug, Clone)]
pub struct StreamArgs {
    #[arg(long = "JOB_NAME", env = "JOB_NAME")]
    pub job_name: String,

    /// Comma-separated broker list
    #[arg(long = "kafka_bootstrap_servers", env = "KAFKA_BOOTSTRAP_SERVERS")]
    pub kafka_bootstrap_servers: String,

    #[arg(long = "kafka_topic", env = "KAFKA_TOPIC")]
    pub kafka_topic: String,

    /// Output root of the partitioned transaction data
    #[arg(long = "target_path", env = "TARGET_PATH")]
    pub target_path: String,

    /// Accepted for compatibility; records are decoded with the built-in schema
    #[arg(long = "schema_registry_url", env = "SCHEMA_REGISTRY_URL")]
    pub schema_registry_url: String,

    /// PLAINTEXT, SSL, SASL_PLAINTEXT or SASL_SSL (MSK IAM)
    #[arg(long = "kafka_security_protocol", env = "KAFKA_SECURITY_PROTOCOL")]
    pub kafka_security_protocol: String,

    /// Audit flow runs only when this is "true" (any case)
    #[arg(long = "audit_logging_enabled", env = "AUDIT_LOGGING_ENABLED")]
    pub audit_logging_enabled: String,

    /// Output root of the audit records
    #[arg(long = "audit_table", env = "AUDIT_TABLE")]
    pub audit_table: String,

    #[arg(
        long = "trigger_interval_secs",
        env = "TRIGGER_INTERVAL_SECS",
        default_value_t = DEFAULT_TRIGGER_INTERVAL_SECS
    )]
    pub trigger_interval_secs: u64,

    /// Region for MSK IAM tokens
    #[arg(long = "aws_region", env = "AWS_REGION")]
    pub aws_region: Option<String>,
}

/// Arguments of `bronze-ingest convert`
#[derive(Args, Debug, Clone)]
pub struct BatchArgs {
    #[arg(long = "JOB_NAME", env = "JOB_NAME")]
    pub job_name: String,

    /// Bucket name, or a full `s3://` / local path
    #[arg(long = "source_bucket", env = "SOURCE_BUCKET")]
    pub source_bucket: String,

    /// Raw key prefix to list below the source
    #[arg(long = "source_prefix", env = "SOURCE_PREFIX")]
    pub source_prefix: String,

    #[arg(long = "target_path", env = "TARGET_PATH")]
    pub target_path: String,

    /// csv, json or parquet
    #[arg(long = "file_format", env = "FILE_FORMAT")]
    pub file_format: String,
}

/// Resolved parameters of the streaming job
#[derive(Debug, Clone)]
pub struct StreamingJobConfig {
    pub job_name: String,
    pub kafka: KafkaSettings,
    pub target_path: StorageUri,
    pub schema_registry_url: String,
    pub audit_enabled: bool,
    pub audit_table: StorageUri,
    pub trigger: Duration,
}

impl StreamingJobConfig {
    pub fn validate(&self) -> Result<()> {
        if self.job_name.trim().is_empty() {
            anyhow::bail!("JOB_NAME cannot be empty");
        }
        if self.kafka.bootstrap_servers.trim().is_empty() {
            anyhow::bail!("kafka_bootstrap_servers cannot be empty");
        }
        if self.kafka.topic.trim().is_empty() {
            anyhow::bail!("kafka_topic cannot be empty");
        }
        if self.trigger.is_zero() {
            anyhow::bail!("trigger_interval_secs must be greater than 0");
        }
        if self.audit_enabled
            && (self.target_path.contains(&self.audit_table)
                || self.audit_table.contains(&self.target_path))
        {
            anyhow::bail!("audit_table and target_path must not contain one another");
        }
        if self.kafka.security_protocol.uses_iam() && self.kafka.aws_region.is_none() {
            tracing::warn!("SASL_SSL without aws_region; IAM token generation will fail");
        }
        Ok(())
    }
}

impl TryFrom<StreamArgs> for StreamingJobConfig {
    type Error = anyhow::Error;

    fn try_from(args: StreamArgs) -> Result<Self> {
        let config = Self {
            job_name: args.job_name,
            kafka: KafkaSettings {
                bootstrap_servers: args.kafka_bootstrap_servers,
                topic: args.kafka_topic,
                security_protocol: args.kafka_security_protocol.parse::<SecurityProtocol>()?,
                aws_region: args.aws_region.filter(|r| !r.trim().is_empty()),
            },
            target_path: args.target_path.parse()?,
            schema_registry_url: args.schema_registry_url,
            audit_enabled: args.audit_logging_enabled.trim().eq_ignore_ascii_case("true"),
            audit_table: args.audit_table.parse()?,
            trigger: Duration::from_secs(args.trigger_interval_secs),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Resolved parameters of the batch conversion job
#[derive(Debug, Clone)]
pub struct BatchJobConfig {
    pub job_name: String,
    pub source: StorageUri,
    pub source_prefix: String,
    pub target_path: StorageUri,
    pub file_format: FileFormat,
}

impl BatchJobConfig {
    pub fn validate(&self) -> Result<()> {
        if self.job_name.trim().is_empty() {
            anyhow::bail!("JOB_NAME cannot be empty");
        }
        if self.source == self.target_path && self.source_prefix.is_empty() {
            anyhow::bail!("target_path cannot be the whole source");
        }
        Ok(())
    }
}

/// A bare bucket name, or anything [`StorageUri`] accepts
fn parse_source(source: &str) -> std::result::Result<StorageUri, BronzeError> {
    let source = source.trim();
    let is_bucket_name = !source.is_empty()
        && source
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        && !source.starts_with('.');
    if is_bucket_name {
        Ok(StorageUri::S3 {
            bucket: source.to_string(),
            prefix: String::new(),
        })
    } else {
        source.parse()
    }
}

impl TryFrom<BatchArgs> for BatchJobConfig {
    type Error = anyhow::Error;

    fn try_from(args: BatchArgs) -> Result<Self> {
        // format first: an unsupported format must fail before any I/O
        let file_format = args.file_format.parse::<FileFormat>()?;
        let config = Self {
            job_name: args.job_name,
            source: parse_source(&args.source_bucket)?,
            source_prefix: args.source_prefix,
            target_path: args.target_path.parse()?,
            file_format,
        };
        config.validate()?;
        Ok(config)
    }
}
