use serde::{Deserialize, Serialize};

/// Moderation state attached to each [`crate::User`], owned authoritatively
/// by the Data Manager and mutated only via Policy Evaluator updates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyState {
    pub is_suspended: bool,
    pub suspension_lift_time: f64,
    /// Strike timestamps within the rolling `strike_window`; pruned lazily.
    pub strike_timestamps: Vec<f64>,
    pub is_terminated: bool,
    /// Raised by the action model for the most recent action; consumed (and
    /// cleared) by the Policy Evaluator on the next evaluation.
    pub bad_message_posting: bool,
}

impl PolicyState {
    /// A user is eligible for feed construction and dispatch only while
    /// neither suspended nor terminated.
    pub fn is_active(&self) -> bool {
        !self.is_suspended && !self.is_terminated
    }
}
