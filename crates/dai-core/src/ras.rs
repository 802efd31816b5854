// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! RAS (reliability, availability, serviceability) event emission.
//!
//! Emission never fails the caller: store calls run on tracked background
//! tasks and any failure is logged and dropped. [`RasEventEmitter::flush`]
//! waits for in-flight emissions, which the agent does before closing the
//! gateway.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::OnceCell;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::adapter::AdapterIdentity;
use crate::gateway::{CallOutcome, ProcedureGateway, Value};
use crate::now_micros;

/// Event type used when a descriptive name is not in the metadata table.
pub const NON_DESCRIPTIVE_EVENT_TYPE: &str = "0001000013";

/// Job id that asks the store to work out the affected job from the location.
pub const CHECK_FOR_JOB: &str = "?";

/// Descriptive names of the events this crate emits.
pub mod events {
    pub const ADAPTER_ABEND: &str = "RasGenAdapterAbend";
    pub const ADAPTER_EXCEPTION: &str = "RasGenAdapterException";
    pub const MISSING_CASE: &str = "RasGenAdapterMissingCaseStmt";
    pub const FIND_AND_OWN_FAILED: &str = "RasGenWorkItemFindAndOwnFailed";
    pub const WAIT_FOR_WORK_ITEM_FAILED: &str =
        "RasGenAdapterWaitForWorkItemToFinishAndMarkDoneFailed";
    pub const SAVE_RESTART_DATA_FAILED: &str = "RasGenAdapterWiSaveRestartDataFailed";
    pub const CALLBACK_WITH_VALUE_FAILED: &str =
        "RasGenAdapterMyCallbackForHouseKeepingLongRtrnValueFailed";
    pub const CALLBACK_NO_VALUE_FAILED: &str =
        "RasGenAdapterMyCallbackForHouseKeepingNoRtrnValueFailed";
    pub const OUT_OF_ORDER: &str = "RasGenAdapterDetectedOutOfTsOrderItem";
    pub const EXCEPTION_BUT_CONTINUE: &str = "RasGenAdapterExceptionButContinue";
    pub const NODE_ACTIVE: &str = "RasProvNodeActive";
    pub const COMPUTE_NODE_UNKNOWN: &str = "RasProvCompNodeSetStateFailedInvalidNode";
    pub const SERVICE_NODE_UNKNOWN: &str = "RasProvServiceNodeSetStateFailedInvalidNode";
    pub const WLM_NON_COMPUTE_NODE: &str = "RasWlmCantTellWlmToUseNonComputeNode";
    pub const WLM_UNOWNED_NODE: &str = "RasWlmCantTellWlmToUseUnownedNode";
}

/// What the emitter knows about the job an event affects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "job", content = "id", rename_all = "snake_case")]
pub enum AffectedJob {
    #[default]
    None,
    Job(String),
    CheckForJob,
}

/// One event to store.
#[derive(Debug, Clone, Serialize)]
pub struct RasEvent {
    pub descriptive_name: String,
    pub instance_data: Option<String>,
    pub lctn: Option<String>,
    pub job: AffectedJob,
    pub timestamp_micros: i64,
    /// Work item the event is reported against; the base work item when unset.
    pub work_item_id: Option<i64>,
}

impl RasEvent {
    pub fn new(descriptive_name: impl Into<String>) -> Self {
        Self {
            descriptive_name: descriptive_name.into(),
            instance_data: None,
            lctn: None,
            job: AffectedJob::None,
            timestamp_micros: now_micros(),
            work_item_id: None,
        }
    }

    pub fn instance_data(mut self, data: impl Into<String>) -> Self {
        self.instance_data = Some(data.into());
        self
    }

    pub fn lctn(mut self, lctn: impl Into<String>) -> Self {
        self.lctn = Some(lctn.into());
        self
    }

    pub fn job(mut self, job_id: impl Into<String>) -> Self {
        self.job = AffectedJob::Job(job_id.into());
        self
    }

    pub fn check_for_job(mut self) -> Self {
        self.job = AffectedJob::CheckForJob;
        self
    }

    pub fn at(mut self, timestamp_micros: i64) -> Self {
        self.timestamp_micros = timestamp_micros;
        self
    }

    pub fn for_work_item(mut self, work_item_id: i64) -> Self {
        self.work_item_id = Some(work_item_id);
        self
    }

    /// Job id column value. A job check without a location degrades to "no job".
    fn job_id(&self) -> Option<&str> {
        match &self.job {
            AffectedJob::None => None,
            AffectedJob::Job(id) => Some(id),
            AffectedJob::CheckForJob => match self.lctn.as_deref() {
                Some(lctn) if !lctn.trim().is_empty() => Some(CHECK_FOR_JOB),
                _ => None,
            },
        }
    }
}

/// Recognized classes of failed detached calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnknownComputeNode,
    UnknownServiceNode,
    ErrorToActiveRejected,
    Unclassified,
}

#[derive(Debug, Clone)]
struct FailureRule {
    fragment: &'static str,
    kind: FailureKind,
    event: Option<&'static str>,
}

/// Result of classifying a failure message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: FailureKind,
    /// RAS event to emit, `None` when the failure is already handled.
    pub event: Option<&'static str>,
}

/// Maps failure message fragments to a [`FailureKind`] and the RAS event it warrants.
///
/// Rules are checked in order; the first fragment found in the message wins.
/// Unmatched failures are [`FailureKind::Unclassified`] and emit the generic
/// callback failure event.
#[derive(Debug, Clone)]
pub struct FailureClassifier {
    rules: Vec<FailureRule>,
}

impl FailureClassifier {
    /// Classifier with no rules; every failure is unclassified.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn rule(
        mut self,
        fragment: &'static str,
        kind: FailureKind,
        event: Option<&'static str>,
    ) -> Self {
        self.rules.push(FailureRule {
            fragment,
            kind,
            event,
        });
        self
    }

    pub fn classify(&self, message: &str, returns_value: bool) -> Classification {
        self.rules
            .iter()
            .find(|rule| message.contains(rule.fragment))
            .map(|rule| Classification {
                kind: rule.kind,
                event: rule.event,
            })
            .unwrap_or(Classification {
                kind: FailureKind::Unclassified,
                event: Some(if returns_value {
                    events::CALLBACK_WITH_VALUE_FAILED
                } else {
                    events::CALLBACK_NO_VALUE_FAILED
                }),
            })
    }
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::empty()
            .rule(
                "no entry in the ComputeNode table",
                FailureKind::UnknownComputeNode,
                Some(events::COMPUTE_NODE_UNKNOWN),
            )
            .rule(
                "no entry in the ServiceNode table",
                FailureKind::UnknownServiceNode,
                Some(events::SERVICE_NODE_UNKNOWN),
            )
            .rule(
                "Invalid state change was attempted from ERROR to ACTIVE",
                FailureKind::ErrorToActiveRejected,
                None,
            )
    }
}

/// Context of a detached call, used to describe its failure.
#[derive(Debug, Clone)]
pub struct DetachedCall {
    pub procedure: String,
    pub pertinent_info: String,
    pub lctn: Option<String>,
    pub work_item_id: i64,
    /// Whether the procedure returns a scalar the caller inspects.
    pub returns_value: bool,
}

/// Stores RAS events on behalf of one adapter instance.
pub struct RasEventEmitter {
    gateway: Arc<dyn ProcedureGateway>,
    identity: Arc<AdapterIdentity>,
    classifier: FailureClassifier,
    event_types: OnceCell<HashMap<String, String>>,
    in_flight: TaskTracker,
}

impl RasEventEmitter {
    pub fn new(gateway: Arc<dyn ProcedureGateway>, identity: Arc<AdapterIdentity>) -> Self {
        Self::with_classifier(gateway, identity, FailureClassifier::default())
    }

    pub fn with_classifier(
        gateway: Arc<dyn ProcedureGateway>,
        identity: Arc<AdapterIdentity>,
        classifier: FailureClassifier,
    ) -> Self {
        Self {
            gateway,
            identity,
            classifier,
            event_types: OnceCell::new(),
            in_flight: TaskTracker::new(),
        }
    }

    pub fn classifier(&self) -> &FailureClassifier {
        &self.classifier
    }

    pub fn identity(&self) -> &Arc<AdapterIdentity> {
        &self.identity
    }

    async fn load_event_types(&self) -> Result<HashMap<String, String>, String> {
        let response = self
            .gateway
            .call("RasMetaDataList", &[])
            .await
            .map_err(|e| e.to_string())?;
        if !response.is_success() {
            return Err(format!(
                "Status={}, StatusString={}",
                response.status,
                response.message()
            ));
        }

        let mut event_types = HashMap::new();
        if let Some(table) = response.first_table() {
            for row in table.rows() {
                if let (Some(name), Some(event_type)) =
                    (row.get_string("DescriptiveName"), row.get_string("EventType"))
                {
                    event_types.insert(name.to_string(), event_type.to_string());
                }
            }
        }
        info!(count = event_types.len(), "Loaded RAS metadata");
        Ok(event_types)
    }

    /// Load the descriptive name to event type table if it is not loaded yet.
    pub async fn load_metadata(&self) -> bool {
        match self
            .event_types
            .get_or_try_init(|| self.load_event_types())
            .await
        {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "Unable to load RAS metadata");
                false
            }
        }
    }

    /// Event type for a descriptive name, or [`NON_DESCRIPTIVE_EVENT_TYPE`] if unknown.
    pub async fn event_type(&self, descriptive_name: &str) -> String {
        if !self.load_metadata().await {
            return NON_DESCRIPTIVE_EVENT_TYPE.to_string();
        }
        match self
            .event_types
            .get()
            .and_then(|types| types.get(descriptive_name))
        {
            Some(event_type) => event_type.clone(),
            None => {
                error!(
                    descriptive_name,
                    "Unknown RAS event name, using the non-descriptive event type"
                );
                NON_DESCRIPTIVE_EVENT_TYPE.to_string()
            }
        }
    }

    /// Store an event in the background.
    pub async fn emit(&self, event: RasEvent) {
        let event_type = self.event_type(&event.descriptive_name).await;
        let work_item_id = event
            .work_item_id
            .unwrap_or_else(|| self.identity.base_work_item_id());
        let args = vec![
            Value::from(event_type.as_str()),
            Value::from(event.instance_data.clone()),
            Value::from(event.lctn.clone()),
            Value::from(event.job_id()),
            Value::Long(event.timestamp_micros),
            Value::from(self.identity.adapter_type()),
            Value::Long(work_item_id),
        ];

        let gateway = self.gateway.clone();
        let descriptive_name = event.descriptive_name;
        self.in_flight.spawn(async move {
            match CallOutcome::from_result(gateway.call("RasEventStore", &args).await) {
                CallOutcome::Completed { return_value } => {
                    debug!(
                        %descriptive_name,
                        %event_type,
                        ras_event_id = ?return_value,
                        "RAS event stored"
                    );
                }
                CallOutcome::Failed { status, message } => {
                    error!(
                        %descriptive_name,
                        %event_type,
                        %status,
                        %message,
                        "Unable to store RAS event"
                    );
                }
            }
        });
    }

    /// Correlate a stored event with a job, in the background.
    pub fn set_associated_job_id(
        self: &Arc<Self>,
        job_id: impl Into<String>,
        event_type: impl Into<String>,
        event_id: i64,
    ) {
        let job_id = job_id.into();
        let event_type = event_type.into();
        let this = self.clone();
        self.in_flight.spawn(async move {
            let args = vec![
                Value::from(job_id.as_str()),
                Value::from(event_type.as_str()),
                Value::Long(event_id),
            ];
            let outcome =
                CallOutcome::from_result(this.gateway.call("RasEventUpdateJobId", &args).await);
            if let CallOutcome::Failed { message, .. } = outcome {
                let call = DetachedCall {
                    procedure: "RasEventUpdateJobId".to_string(),
                    pertinent_info: format!(
                        "JobId={}, EventType={}, Id={}",
                        job_id, event_type, event_id
                    ),
                    lctn: None,
                    work_item_id: this.identity.base_work_item_id(),
                    returns_value: false,
                };
                this.report_failure(&call, &message).await;
            }
        });
    }

    /// Emit whatever event the classifier assigns to a failed detached call.
    pub async fn report_failure(&self, call: &DetachedCall, message: &str) -> FailureKind {
        let classification = self.classifier.classify(message, call.returns_value);
        warn!(
            procedure = %call.procedure,
            pertinent_info = %call.pertinent_info,
            kind = ?classification.kind,
            %message,
            "Detached call failed"
        );

        let Some(descriptive_name) = classification.event else {
            error!(
                procedure = %call.procedure,
                pertinent_info = %call.pertinent_info,
                "State change rejected, node state left unchanged"
            );
            return classification.kind;
        };

        let mut event = RasEvent::new(descriptive_name)
            .instance_data(format!(
                "AdapterName={}, SpThisIsCallbackFor={}, PertinentInfo={}, StatusString={}",
                self.identity.name(),
                call.procedure,
                call.pertinent_info,
                message
            ))
            .for_work_item(call.work_item_id);
        // Generic failures are not tied to a location.
        if let Some(lctn) = call
            .lctn
            .as_ref()
            .filter(|_| classification.kind != FailureKind::Unclassified)
        {
            event = event.lctn(lctn.clone());
        }
        self.emit(event).await;
        classification.kind
    }

    /// Wait for every emission started so far.
    pub async fn flush(&self) {
        self.in_flight.close();
        self.in_flight.wait().await;
        self.in_flight.reopen();
    }
}
