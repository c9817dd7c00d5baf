use std::fmt;

use serde::{Deserialize, Serialize};

use crate::barrier::JoinPoint;
use crate::model::{BatchMode, DocumentFormat, TransactionKind};
use crate::topic::StageTopic;

/// Durable status of a batch.
///
/// Each batch flows through: UPLOADING → QUEUED → CLASSIFYING → EXTRACTING_AUTO →
/// EXTRACTING_MANUAL → MERGING → ENRICHING → POST_PROCESSING → OUTPUT_READY →
/// (WAITING_REVIEW | ASSEMBLING) → COMPLETED, with AWAITING_AGENT as an optional
/// detour before OUTPUT_READY and FAILED reachable from anywhere non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Uploading,
    Queued,
    Classifying,
    ExtractingAuto,
    ExtractingManual,
    Merging,
    Enriching,
    PostProcessing,
    AwaitingAgent,
    OutputReady,
    WaitingReview,
    Assembling,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }

    /// Position in the fixed stage order. `Failed` sorts last.
    pub fn rank(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BatchStatus::Uploading => "uploading",
            BatchStatus::Queued => "queued",
            BatchStatus::Classifying => "classifying",
            BatchStatus::ExtractingAuto => "extracting_auto",
            BatchStatus::ExtractingManual => "extracting_manual",
            BatchStatus::Merging => "merging",
            BatchStatus::Enriching => "enriching",
            BatchStatus::PostProcessing => "post_processing",
            BatchStatus::AwaitingAgent => "awaiting_agent",
            BatchStatus::OutputReady => "output_ready",
            BatchStatus::WaitingReview => "waiting_review",
            BatchStatus::Assembling => "assembling",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Durable status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Received,
    Preprocessing,
    Processing,
    Assembling,
    CallingApi,
    UploadingDocuments,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionStatus::Completed | TransactionStatus::Failed)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionStatus::Received => "received",
            TransactionStatus::Preprocessing => "preprocessing",
            TransactionStatus::Processing => "processing",
            TransactionStatus::Assembling => "assembling",
            TransactionStatus::CallingApi => "calling_api",
            TransactionStatus::UploadingDocuments => "uploading_documents",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Per-ingest switches that bypass or add individual stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageOptions {
    pub skip_post_processor: bool,
    pub skip_table_processing: bool,
    pub skip_key_processing: bool,
    pub ai_agent_enabled: bool,
    pub review_required: bool,
    pub doc_upload_enabled: bool,
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            skip_post_processor: false,
            skip_table_processing: false,
            skip_key_processing: false,
            ai_agent_enabled: false,
            review_required: false,
            doc_upload_enabled: true,
        }
    }
}

/// The routing-relevant shape of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRoute {
    pub mode: BatchMode,
    pub format: DocumentFormat,
    /// Kind of the owning transaction, `None` for standalone batches.
    pub parent: Option<TransactionKind>,
}

impl BatchRoute {
    pub fn standalone(mode: BatchMode, format: DocumentFormat) -> Self {
        Self { mode, format, parent: None }
    }

    pub fn linked(mode: BatchMode, format: DocumentFormat, kind: TransactionKind) -> Self {
        Self { mode, format, parent: Some(kind) }
    }
}

/// What the dispatcher should do once a batch has entered a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Send the batch to the worker that owns the status.
    Dispatch { status: BatchStatus, topic: StageTopic },
    /// Rest until every sibling reaches the join point.
    Join { status: BatchStatus, join: JoinPoint },
    /// Rest until an operator releases the review hold.
    Hold { status: BatchStatus },
    /// A standalone batch finished its last stage.
    Complete,
}

/// Fixed stage lookup table keyed on (status, batch route, options).
pub struct StateMachine;

impl StateMachine {
    /// Worker topic for a status, or `None` for resting states.
    pub fn topic_for(status: BatchStatus, route: &BatchRoute, opts: &StageOptions) -> Option<StageTopic> {
        let topic = match status {
            BatchStatus::Uploading => StageTopic::PreClassificationProcessQueued,
            BatchStatus::Queued => StageTopic::BatchQueued,
            BatchStatus::Classifying => StageTopic::ClassifyBatchQueued,
            BatchStatus::ExtractingAuto => StageTopic::KeyvalExtractor,
            BatchStatus::ExtractingManual => match route.mode {
                BatchMode::Training => StageTopic::LabelMapping,
                _ => StageTopic::DefinitionExtraction,
            },
            BatchStatus::Merging => StageTopic::MergeDataJson,
            BatchStatus::Enriching => match route.format {
                DocumentFormat::Document => StageTopic::ProcessTableKeys,
                DocumentFormat::Spreadsheet if opts.skip_key_processing => {
                    StageTopic::ExcelTableProcess
                }
                DocumentFormat::Spreadsheet => StageTopic::ExcelTableKeysProcess,
            },
            BatchStatus::PostProcessing => StageTopic::PostProcessing,
            BatchStatus::AwaitingAgent => StageTopic::AiAgent,
            BatchStatus::OutputReady => StageTopic::OutputJson,
            BatchStatus::WaitingReview
            | BatchStatus::Assembling
            | BatchStatus::Completed
            | BatchStatus::Failed => return None,
        };
        Some(topic)
    }

    /// Status a batch moves to after the worker for `current` succeeded.
    ///
    /// Skipped stages are walked over so the remaining order is preserved.
    /// Returns `None` for statuses no worker completion can advance.
    pub fn successor(current: BatchStatus, route: &BatchRoute, opts: &StageOptions) -> Option<BatchStatus> {
        let mut next = Self::raw_successor(current, route, opts)?;
        while Self::is_skipped(next, opts) {
            next = Self::raw_successor(next, route, opts)?;
        }
        Some(next)
    }

    /// Action implied by having entered `status`.
    pub fn transition_for(status: BatchStatus, route: &BatchRoute, opts: &StageOptions) -> Option<Transition> {
        if status == BatchStatus::Queued && route.parent.is_some() {
            return Some(Transition::Join {
                status,
                join: JoinPoint::Preprocessed,
            });
        }
        if let Some(topic) = Self::topic_for(status, route, opts) {
            return Some(Transition::Dispatch { status, topic });
        }
        match (status, route.parent) {
            (BatchStatus::WaitingReview, _) => Some(Transition::Hold { status }),
            (BatchStatus::Assembling, Some(_)) => Some(Transition::Join {
                status,
                join: JoinPoint::OutputReady,
            }),
            (BatchStatus::Completed, Some(TransactionKind::Training)) => Some(Transition::Join {
                status,
                join: JoinPoint::Completed,
            }),
            (BatchStatus::Completed, _) => Some(Transition::Complete),
            _ => None,
        }
    }

    /// Successor plus the action it implies.
    pub fn next(current: BatchStatus, route: &BatchRoute, opts: &StageOptions) -> Option<Transition> {
        let status = Self::successor(current, route, opts)?;
        Self::transition_for(status, route, opts)
    }

    fn raw_successor(current: BatchStatus, route: &BatchRoute, opts: &StageOptions) -> Option<BatchStatus> {
        use BatchStatus::*;
        let next = match current {
            Uploading => Queued,
            Queued if route.mode == BatchMode::Uploading => Self::settle(route, opts),
            Queued => Classifying,
            Classifying if route.mode == BatchMode::Supporting => OutputReady,
            Classifying => ExtractingAuto,
            ExtractingAuto => ExtractingManual,
            ExtractingManual => Merging,
            Merging => Enriching,
            Enriching => PostProcessing,
            PostProcessing => AwaitingAgent,
            AwaitingAgent => OutputReady,
            OutputReady => Self::settle(route, opts),
            WaitingReview => Assembling,
            Assembling | Completed | Failed => return None,
        };
        Some(next)
    }

    // Where a batch rests once its own stages are done.
    fn settle(route: &BatchRoute, opts: &StageOptions) -> BatchStatus {
        match route.parent {
            None | Some(TransactionKind::Training) => BatchStatus::Completed,
            Some(TransactionKind::Processing)
                if opts.review_required && route.mode != BatchMode::Uploading =>
            {
                BatchStatus::WaitingReview
            }
            Some(TransactionKind::Processing) => BatchStatus::Assembling,
        }
    }

    fn is_skipped(status: BatchStatus, opts: &StageOptions) -> bool {
        match status {
            BatchStatus::Enriching => opts.skip_table_processing && opts.skip_key_processing,
            BatchStatus::PostProcessing => opts.skip_post_processor,
            BatchStatus::AwaitingAgent => !opts.ai_agent_enabled,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn doc(parent: Option<TransactionKind>) -> BatchRoute {
        BatchRoute {
            mode: BatchMode::Processing,
            format: DocumentFormat::Document,
            parent,
        }
    }

    fn walk(route: &BatchRoute, opts: &StageOptions) -> Vec<BatchStatus> {
        let mut path = vec![BatchStatus::Uploading];
        let mut current = BatchStatus::Uploading;
        while let Some(next) = StateMachine::successor(current, route, opts) {
            if current == BatchStatus::WaitingReview {
                break;
            }
            path.push(next);
            current = next;
        }
        path
    }

    #[test]
    fn happy_path_walks_all_states() {
        use BatchStatus::*;
        let path = walk(&doc(Some(TransactionKind::Processing)), &StageOptions::default());
        assert_eq!(
            path,
            vec![
                Uploading,
                Queued,
                Classifying,
                ExtractingAuto,
                ExtractingManual,
                Merging,
                Enriching,
                PostProcessing,
                OutputReady,
                Assembling,
            ]
        );
    }

    #[test]
    fn standalone_batch_ends_completed() {
        let path = walk(&doc(None), &StageOptions::default());
        assert_eq!(path.last(), Some(&BatchStatus::Completed));
        assert_eq!(
            StateMachine::transition_for(BatchStatus::Completed, &doc(None), &StageOptions::default()),
            Some(Transition::Complete)
        );
    }

    #[test]
    fn skip_flags_bypass_stages() {
        let opts = StageOptions {
            skip_post_processor: true,
            skip_table_processing: true,
            skip_key_processing: true,
            ..Default::default()
        };
        let route = doc(None);
        assert_eq!(
            StateMachine::successor(BatchStatus::Merging, &route, &opts),
            Some(BatchStatus::OutputReady)
        );
    }

    #[test]
    fn table_skip_alone_keeps_enrichment() {
        let opts = StageOptions {
            skip_table_processing: true,
            ..Default::default()
        };
        assert_eq!(
            StateMachine::successor(BatchStatus::Merging, &doc(None), &opts),
            Some(BatchStatus::Enriching)
        );
    }

    #[test]
    fn ai_agent_detour_before_output() {
        let opts = StageOptions {
            ai_agent_enabled: true,
            ..Default::default()
        };
        let route = doc(None);
        assert_eq!(
            StateMachine::successor(BatchStatus::PostProcessing, &route, &opts),
            Some(BatchStatus::AwaitingAgent)
        );
        assert_eq!(
            StateMachine::next(BatchStatus::PostProcessing, &route, &opts),
            Some(Transition::Dispatch {
                status: BatchStatus::AwaitingAgent,
                topic: StageTopic::AiAgent
            })
        );
        assert_eq!(
            StateMachine::successor(BatchStatus::AwaitingAgent, &route, &opts),
            Some(BatchStatus::OutputReady)
        );
    }

    #[test]
    fn review_required_holds_processing_batches() {
        let opts = StageOptions {
            review_required: true,
            ..Default::default()
        };
        let route = doc(Some(TransactionKind::Processing));
        assert_eq!(
            StateMachine::next(BatchStatus::OutputReady, &route, &opts),
            Some(Transition::Hold {
                status: BatchStatus::WaitingReview
            })
        );
        assert_eq!(
            StateMachine::next(BatchStatus::WaitingReview, &route, &opts),
            Some(Transition::Join {
                status: BatchStatus::Assembling,
                join: JoinPoint::OutputReady
            })
        );
    }

    #[test]
    fn linked_batch_waits_at_preprocessing_join() {
        let route = doc(Some(TransactionKind::Processing));
        assert_eq!(
            StateMachine::next(BatchStatus::Uploading, &route, &StageOptions::default()),
            Some(Transition::Join {
                status: BatchStatus::Queued,
                join: JoinPoint::Preprocessed
            })
        );
        assert_eq!(
            StateMachine::next(BatchStatus::Uploading, &doc(None), &StageOptions::default()),
            Some(Transition::Dispatch {
                status: BatchStatus::Queued,
                topic: StageTopic::BatchQueued
            })
        );
    }

    #[test]
    fn training_batches_use_label_mapping_and_completion_join() {
        let route = BatchRoute::linked(
            BatchMode::Training,
            DocumentFormat::Document,
            TransactionKind::Training,
        );
        let opts = StageOptions::default();
        assert_eq!(
            StateMachine::topic_for(BatchStatus::ExtractingManual, &route, &opts),
            Some(StageTopic::LabelMapping)
        );
        assert_eq!(
            StateMachine::next(BatchStatus::OutputReady, &route, &opts),
            Some(Transition::Join {
                status: BatchStatus::Completed,
                join: JoinPoint::Completed
            })
        );
    }

    #[test]
    fn spreadsheet_enrichment_topics() {
        let route = BatchRoute::standalone(BatchMode::Processing, DocumentFormat::Spreadsheet);
        assert_eq!(
            StateMachine::topic_for(BatchStatus::Enriching, &route, &StageOptions::default()),
            Some(StageTopic::ExcelTableKeysProcess)
        );
        let opts = StageOptions {
            skip_key_processing: true,
            ..Default::default()
        };
        assert_eq!(
            StateMachine::topic_for(BatchStatus::Enriching, &route, &opts),
            Some(StageTopic::ExcelTableProcess)
        );
    }

    #[test]
    fn supporting_and_uploading_modes_shortcut() {
        let supporting = BatchRoute::linked(
            BatchMode::Supporting,
            DocumentFormat::Document,
            TransactionKind::Processing,
        );
        assert_eq!(
            StateMachine::successor(BatchStatus::Classifying, &supporting, &StageOptions::default()),
            Some(BatchStatus::OutputReady)
        );

        let uploading = BatchRoute::linked(
            BatchMode::Uploading,
            DocumentFormat::Document,
            TransactionKind::Processing,
        );
        let opts = StageOptions {
            review_required: true,
            ..Default::default()
        };
        assert_eq!(
            StateMachine::successor(BatchStatus::Queued, &uploading, &opts),
            Some(BatchStatus::Assembling)
        );
    }

    #[test]
    fn resting_states_have_no_successor() {
        let route = doc(Some(TransactionKind::Processing));
        let opts = StageOptions::default();
        assert_eq!(StateMachine::successor(BatchStatus::Assembling, &route, &opts), None);
        assert_eq!(StateMachine::successor(BatchStatus::Completed, &route, &opts), None);
        assert_eq!(StateMachine::successor(BatchStatus::Failed, &route, &opts), None);
        assert_eq!(StateMachine::topic_for(BatchStatus::Failed, &route, &opts), None);
    }

    #[test]
    fn status_display() {
        assert_eq!(BatchStatus::ExtractingAuto.to_string(), "extracting_auto");
        assert_eq!(BatchStatus::OutputReady.to_string(), "output_ready");
        assert_eq!(TransactionStatus::CallingApi.to_string(), "calling_api");
        let json = serde_json::to_string(&BatchStatus::WaitingReview).unwrap();
        assert_eq!(json, "\"waiting_review\"");
    }

    fn arb_route() -> impl Strategy<Value = BatchRoute> {
        let mode = prop_oneof![
            Just(BatchMode::Processing),
            Just(BatchMode::Training),
            Just(BatchMode::Supporting),
            Just(BatchMode::Uploading),
        ];
        let format = prop_oneof![Just(DocumentFormat::Document), Just(DocumentFormat::Spreadsheet)];
        let parent = prop_oneof![
            Just(None),
            Just(Some(TransactionKind::Processing)),
            Just(Some(TransactionKind::Training)),
        ];
        (mode, format, parent).prop_map(|(mode, format, parent)| BatchRoute { mode, format, parent })
    }

    fn arb_options() -> impl Strategy<Value = StageOptions> {
        any::<[bool; 6]>().prop_map(|f| StageOptions {
            skip_post_processor: f[0],
            skip_table_processing: f[1],
            skip_key_processing: f[2],
            ai_agent_enabled: f[3],
            review_required: f[4],
            doc_upload_enabled: f[5],
        })
    }

    proptest! {
        #[test]
        fn every_path_moves_forward_and_visits_each_state_once(route in arb_route(), opts in arb_options()) {
            let path = walk(&route, &opts);
            for pair in path.windows(2) {
                prop_assert!(pair[0].rank() < pair[1].rank(), "{:?} -> {:?}", pair[0], pair[1]);
            }
            let last = *path.last().unwrap();
            prop_assert!(matches!(
                last,
                BatchStatus::Completed | BatchStatus::Assembling | BatchStatus::WaitingReview
            ));
            prop_assert!(!path.contains(&BatchStatus::Failed));
        }

        #[test]
        fn skipped_stages_never_appear(route in arb_route(), opts in arb_options()) {
            let path = walk(&route, &opts);
            if opts.skip_post_processor {
                prop_assert!(!path.contains(&BatchStatus::PostProcessing));
            }
            if !opts.ai_agent_enabled {
                prop_assert!(!path.contains(&BatchStatus::AwaitingAgent));
            }
            if opts.skip_table_processing && opts.skip_key_processing {
                prop_assert!(!path.contains(&BatchStatus::Enriching));
            }
        }
    }
}
