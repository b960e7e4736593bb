//! The conversation flow engine: node graphs, tools, workflows.

pub mod base;
pub mod eligibility;
pub mod lab_results;
pub mod manager;
pub mod scheduling;
pub mod turn;
pub mod types;

use std::sync::Arc;

pub use base::{CallFlow, FlowCore, TriageFlowConfig};
pub use manager::FlowManager;
pub use turn::LlmTurnProcessor;
pub use types::{
    ActionConfig, ContextStrategy, FlowState, FunctionHandler, FunctionSchema, HandlerOutcome,
    NodeConfig, TurnDisposition, action_fn, handler_fn,
};

use crate::error::{CallError, Result};

/// Resolve a workflow name to its flow implementation.
pub fn load_flow(workflow: &str, core: FlowCore) -> Result<Arc<dyn CallFlow>> {
    match workflow {
        "patient_scheduling" => Ok(scheduling::PatientSchedulingFlow::new(core)),
        "lab_results" => Ok(lab_results::LabResultsFlow::new(core)),
        "eligibility_verification" => Ok(eligibility::EligibilityVerificationFlow::new(core)),
        other => Err(CallError::Flow(format!("unknown workflow: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ColdTransferConfig;
    use crate::store::MemoryStore;
    use crate::test_utils::MockTransport;

    #[tokio::test]
    async fn registry_resolves_known_workflows() {
        let store = MemoryStore::shared();
        let core = FlowCore::new(
            serde_json::json!({}),
            "s-1",
            "org-1",
            ColdTransferConfig::default(),
            store.clone(),
            store,
            Arc::new(MockTransport::new()),
        );
        for name in [
            "patient_scheduling",
            "lab_results",
            "eligibility_verification",
        ] {
            let flow = load_flow(name, core.clone()).expect("known workflow");
            assert_eq!(flow.workflow(), name);
        }
        assert!(load_flow("prescription_status", core).is_err());
    }
}
