use crate::logger;

/// Stages of a single launch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStage {
    Requested,
    KeypairResolved,
    ReattachCandidateFound,
    NewInstanceLaunched,
    Tagged,
    Bound,
    // Terminal failures
    NoKeypair,
    CapacityExceeded,
    ProviderRejected,
    Failed,
}

impl LaunchStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchStage::Requested => "requested",
            LaunchStage::KeypairResolved => "keypair-resolved",
            LaunchStage::ReattachCandidateFound => "reattach-candidate-found",
            LaunchStage::NewInstanceLaunched => "new-instance-launched",
            LaunchStage::Tagged => "tagged",
            LaunchStage::Bound => "bound",
            LaunchStage::NoKeypair => "no-keypair",
            LaunchStage::CapacityExceeded => "capacity-exceeded",
            LaunchStage::ProviderRejected => "provider-rejected",
            LaunchStage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LaunchStage::Bound
                | LaunchStage::NoKeypair
                | LaunchStage::CapacityExceeded
                | LaunchStage::ProviderRejected
                | LaunchStage::Failed
        )
    }

    pub fn can_transition_to(&self, next: LaunchStage) -> bool {
        use LaunchStage::*;
        matches!(
            (self, next),
            (Requested, KeypairResolved)
                | (Requested, NoKeypair)
                | (KeypairResolved, ReattachCandidateFound)
                | (KeypairResolved, NewInstanceLaunched)
                | (KeypairResolved, CapacityExceeded)
                | (KeypairResolved, ProviderRejected)
                | (KeypairResolved, Failed)
                | (ReattachCandidateFound, Tagged)
                | (ReattachCandidateFound, Bound)
                | (ReattachCandidateFound, Failed)
                | (NewInstanceLaunched, Tagged)
                // tagging failed; the instance is queued for re-tagging
                | (NewInstanceLaunched, Bound)
                | (Tagged, Bound)
        )
    }
}

/// Tracks and logs one launch attempt.
#[derive(Debug)]
pub struct LaunchAttempt {
    cloud: String,
    template: String,
    instance_id: Option<String>,
    stage: LaunchStage,
    history: Vec<LaunchStage>,
}

impl LaunchAttempt {
    pub fn new(cloud: &str, template: &str) -> Self {
        Self {
            cloud: cloud.to_string(),
            template: template.to_string(),
            instance_id: None,
            stage: LaunchStage::Requested,
            history: vec![LaunchStage::Requested],
        }
    }

    pub fn stage(&self) -> LaunchStage {
        self.stage
    }

    pub fn history(&self) -> &[LaunchStage] {
        &self.history
    }

    pub fn bind_instance(&mut self, instance_id: &str) {
        self.instance_id = Some(instance_id.to_string());
    }

    /// Move to `next`. Returns false (and stays put) on an illegal transition.
    pub fn advance(&mut self, next: LaunchStage, reason: &str) -> bool {
        if !self.stage.can_transition_to(next) {
            tracing::warn!(
                "⚠️ [state_machine] illegal launch transition {} -> {} (cloud={}, template={})",
                self.stage.as_str(),
                next.as_str(),
                self.cloud,
                self.template
            );
            return false;
        }
        logger::log_state_transition(
            &self.cloud,
            &self.template,
            self.instance_id.as_deref(),
            self.stage.as_str(),
            next.as_str(),
            reason,
        );
        self.stage = next;
        self.history.push(next);
        true
    }
}
