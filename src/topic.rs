//! Logical worker topics. The string names are the wire contract with the
//! stage workers and must not change.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageTopic {
    EmailBatchQueued,
    TrainBatchQueued,
    PreClassificationProcessQueued,
    BatchQueued,
    ClassifyBatchQueued,
    KeyvalExtractor,
    DefinitionExtraction,
    LabelMapping,
    MergeDataJson,
    ProcessTableKeys,
    ExcelTableProcess,
    ExcelTableKeysProcess,
    PostProcessing,
    AiAgent,
    OutputJson,
    AssemblyQueued,
    ApiCallQueued,
    DocUploadQueued,
}

impl StageTopic {
    pub const ALL: [StageTopic; 18] = [
        StageTopic::EmailBatchQueued,
        StageTopic::TrainBatchQueued,
        StageTopic::PreClassificationProcessQueued,
        StageTopic::BatchQueued,
        StageTopic::ClassifyBatchQueued,
        StageTopic::KeyvalExtractor,
        StageTopic::DefinitionExtraction,
        StageTopic::LabelMapping,
        StageTopic::MergeDataJson,
        StageTopic::ProcessTableKeys,
        StageTopic::ExcelTableProcess,
        StageTopic::ExcelTableKeysProcess,
        StageTopic::PostProcessing,
        StageTopic::AiAgent,
        StageTopic::OutputJson,
        StageTopic::AssemblyQueued,
        StageTopic::ApiCallQueued,
        StageTopic::DocUploadQueued,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageTopic::EmailBatchQueued => "email_batch_queued",
            StageTopic::TrainBatchQueued => "train_batch_queued",
            StageTopic::PreClassificationProcessQueued => "pre_classification_process_queued",
            StageTopic::BatchQueued => "batch_queued",
            StageTopic::ClassifyBatchQueued => "classify_batch_queued",
            StageTopic::KeyvalExtractor => "keyval_extractor",
            StageTopic::DefinitionExtraction => "definition_extraction",
            StageTopic::LabelMapping => "label_mapping",
            StageTopic::MergeDataJson => "merge_data_json",
            StageTopic::ProcessTableKeys => "process_table_keys",
            StageTopic::ExcelTableProcess => "excel_table_process",
            StageTopic::ExcelTableKeysProcess => "excel_table_keys_process",
            StageTopic::PostProcessing => "post_processing",
            StageTopic::AiAgent => "ai_agent",
            StageTopic::OutputJson => "output_json",
            StageTopic::AssemblyQueued => "assembly_queued",
            StageTopic::ApiCallQueued => "api_call_queued",
            StageTopic::DocUploadQueued => "doc_upload_queued",
        }
    }

    /// Topics whose worker acts on a whole transaction rather than one batch.
    pub fn is_transaction_level(self) -> bool {
        matches!(
            self,
            StageTopic::EmailBatchQueued
                | StageTopic::TrainBatchQueued
                | StageTopic::AssemblyQueued
                | StageTopic::ApiCallQueued
                | StageTopic::DocUploadQueued
        )
    }
}

impl fmt::Display for StageTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownTopic(pub String);

impl fmt::Display for UnknownTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown stage topic: {}", self.0)
    }
}

impl std::error::Error for UnknownTopic {}

impl FromStr for StageTopic {
    type Err = UnknownTopic;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageTopic::ALL
            .into_iter()
            .find(|topic| topic.as_str() == s)
            .ok_or_else(|| UnknownTopic(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_match_serde_names() {
        for topic in StageTopic::ALL {
            let json = serde_json::to_string(&topic).unwrap();
            assert_eq!(json, format!("\"{}\"", topic.as_str()));
        }
    }

    #[test]
    fn parses_every_wire_name() {
        for topic in StageTopic::ALL {
            assert_eq!(topic.as_str().parse::<StageTopic>().unwrap(), topic);
        }
        assert!("ocr_engine".parse::<StageTopic>().is_err());
    }

    #[test]
    fn transaction_level_topics() {
        assert!(StageTopic::AssemblyQueued.is_transaction_level());
        assert!(StageTopic::EmailBatchQueued.is_transaction_level());
        assert!(!StageTopic::OutputJson.is_transaction_level());
        assert!(!StageTopic::BatchQueued.is_transaction_level());
    }
}
