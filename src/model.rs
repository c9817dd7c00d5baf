//! Durable entities: batches, transactions and the links between them.
//!
//! The durable store is the single source of truth for every status below.
//! Payload references (`data_handles`) are opaque to the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state_machine::{BatchStatus, StageOptions, TransactionStatus};
use crate::topic::StageTopic;

/// How a batch participates in its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    #[default]
    Processing,
    Training,
    /// Supporting documents are classified and rendered but never extracted.
    Supporting,
    /// Documents that only ride along to the final document upload.
    Uploading,
}

impl std::fmt::Display for BatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchMode::Processing => write!(f, "processing"),
            BatchMode::Training => write!(f, "training"),
            BatchMode::Supporting => write!(f, "supporting"),
            BatchMode::Uploading => write!(f, "uploading"),
        }
    }
}

/// Physical shape of the batch contents; selects the enrichment worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    #[default]
    Document,
    Spreadsheet,
}

/// Discriminator for the two transaction variants.
///
/// Both share the same orchestration shape up to output generation; they differ
/// in the ingest topic and in what happens once every batch has rendered output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Processing,
    Training,
}

impl TransactionKind {
    /// Worker topic that splits an incoming transaction into batches.
    pub fn ingest_topic(self) -> StageTopic {
        match self {
            TransactionKind::Processing => StageTopic::EmailBatchQueued,
            TransactionKind::Training => StageTopic::TrainBatchQueued,
        }
    }

    /// Batch mode assigned when the split result does not name one.
    pub fn default_batch_mode(self) -> BatchMode {
        match self {
            TransactionKind::Processing => BatchMode::Processing,
            TransactionKind::Training => BatchMode::Training,
        }
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionKind::Processing => write!(f, "processing"),
            TransactionKind::Training => write!(f, "training"),
        }
    }
}

/// Side-effecting transaction-level actions guarded against double execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerFlag {
    /// Fan-out of `batch_queued` once every batch finished preprocessing.
    Processing,
    Assembly,
    ApiCall,
    DocUpload,
}

impl TriggerFlag {
    pub const ALL: [TriggerFlag; 4] = [
        TriggerFlag::Processing,
        TriggerFlag::Assembly,
        TriggerFlag::ApiCall,
        TriggerFlag::DocUpload,
    ];

    /// Flag guarding the transaction-level action published on `topic`.
    pub fn for_topic(topic: StageTopic) -> Option<Self> {
        match topic {
            StageTopic::AssemblyQueued => Some(TriggerFlag::Assembly),
            StageTopic::ApiCallQueued => Some(TriggerFlag::ApiCall),
            StageTopic::DocUploadQueued => Some(TriggerFlag::DocUpload),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TriggerFlag::Processing => "processing_triggered",
            TriggerFlag::Assembly => "assembly_triggered",
            TriggerFlag::ApiCall => "api_triggered",
            TriggerFlag::DocUpload => "doc_upload_triggered",
        }
    }
}

impl std::fmt::Display for TriggerFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerFlags {
    pub processing_triggered: bool,
    pub assembly_triggered: bool,
    pub api_triggered: bool,
    pub doc_upload_triggered: bool,
}

impl TriggerFlags {
    pub fn get(&self, flag: TriggerFlag) -> bool {
        match flag {
            TriggerFlag::Processing => self.processing_triggered,
            TriggerFlag::Assembly => self.assembly_triggered,
            TriggerFlag::ApiCall => self.api_triggered,
            TriggerFlag::DocUpload => self.doc_upload_triggered,
        }
    }

    pub fn set(&mut self, flag: TriggerFlag, value: bool) {
        match flag {
            TriggerFlag::Processing => self.processing_triggered = value,
            TriggerFlag::Assembly => self.assembly_triggered = value,
            TriggerFlag::ApiCall => self.api_triggered = value,
            TriggerFlag::DocUpload => self.doc_upload_triggered = value,
        }
    }
}

/// Human review state of a processing transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerificationState {
    #[default]
    NotRequired,
    Pending,
    Verified,
}

/// One recorded outbound API call made on behalf of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundResult {
    pub attempt: u32,
    pub status_code: u16,
    pub body: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub status: BatchStatus,
    pub mode: BatchMode,
    pub format: DocumentFormat,
    /// Owning transaction id, `None` for a standalone batch.
    pub parent: Option<String>,
    pub data_handles: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(id: impl Into<String>, mode: BatchMode, format: DocumentFormat) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: BatchStatus::Uploading,
            mode,
            format,
            parent: None,
            data_handles: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_parent(mut self, transaction_id: impl Into<String>) -> Self {
        self.parent = Some(transaction_id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub kind: TransactionKind,
    pub status: TransactionStatus,
    pub flags: TriggerFlags,
    pub assembled_results: serde_json::Value,
    pub outbound_results: Vec<OutboundResult>,
    pub verification: VerificationState,
    /// Stage options every child batch is dispatched with.
    #[serde(default)]
    pub options: StageOptions,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(id: impl Into<String>, kind: TransactionKind) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            kind,
            status: TransactionStatus::Received,
            flags: TriggerFlags::default(),
            assembled_results: serde_json::Value::Null,
            outbound_results: Vec::new(),
            verification: VerificationState::NotRequired,
            options: StageOptions::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_options(mut self, options: StageOptions) -> Self {
        self.options = options;
        self
    }
}

/// Association between a transaction and one of its batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub transaction_id: String,
    pub batch_id: String,
    pub classified: bool,
    pub uploaded: bool,
    pub mode: BatchMode,
}

impl Link {
    pub fn uploaded(transaction_id: impl Into<String>, batch_id: impl Into<String>, mode: BatchMode) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            batch_id: batch_id.into(),
            classified: false,
            uploaded: true,
            mode,
        }
    }
}
