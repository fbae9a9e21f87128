//! Inter-participant envelope payload shapes (§3 "Envelope", §4's per-
//! participant operations). Every payload here travels wrapped in
//! [`simsom_types::Envelope`], tagged with the sender role it came from so
//! the receiving actor can validate it against the senders it expects for
//! that variant (§7's protocol-error class).

use simsom_types::{Message, PolicyState, Uid, User, View};

/// One user's accumulated work, as handed back by a Worker after running its
/// action model (§4.4).
#[derive(Debug)]
pub struct ProcessedUser {
    pub user: User,
    pub new_messages: Vec<Message>,
    pub passive_actions: Vec<View>,
}

/// A moderation outcome the Policy Evaluator applies to the authoritative
/// user record (§4.6). `clear_newsfeed` mirrors "empty the user's newsfeed"
/// taken alongside a fresh suspension.
#[derive(Debug, Clone)]
pub struct PolicyUpdate {
    pub uid: Uid,
    pub policy: PolicyState,
    pub clear_newsfeed: bool,
}

/// Payloads the Data Manager's mailbox accepts: from Workers, from the
/// Recommender (forwarding the Agent Pool Manager's request), and from the
/// Policy Evaluator (§4.2).
#[derive(Debug)]
pub enum DataManagerPayload {
    WorkerBatch(Vec<ProcessedUser>),
    DataRequest,
    PolicyUpdate(PolicyUpdate),
}

/// One user's dispatch-ready work pack (§4.2's `(user, outgoing_active[uid],
/// outgoing_passive[uid])` tuple).
#[derive(Debug, Clone)]
pub struct UserPackItem {
    pub user: User,
    pub outgoing_active: Vec<Message>,
    pub outgoing_passive: Vec<View>,
}

/// Payloads the Recommender's mailbox accepts: a forwarded data request from
/// the Agent Pool Manager, and the Data Manager's reply to a prior request
/// (§4.5).
#[derive(Debug)]
pub enum RecommenderPayload {
    DataRequest,
    DataReply {
        batch: Vec<UserPackItem>,
        firehose: Vec<Message>,
    },
}

/// Payload the Agent Pool Manager's mailbox accepts: a user pack batch ready
/// to fan out to Workers (§4.3).
#[derive(Debug)]
pub struct AgentPoolManagerPayload {
    pub users: Vec<User>,
}

/// Payload a Worker's mailbox accepts: one user to run `make_actions` over
/// (§4.4).
#[derive(Debug)]
pub struct WorkerPayload {
    pub user: User,
}

/// Payload the Policy Evaluator's mailbox accepts: a batch of user copies to
/// evaluate (§4.6).
#[derive(Debug)]
pub struct PolicyEvalPayload {
    pub users: Vec<User>,
}

/// Payload the Analyzer's mailbox accepts: one batch's worth of built feeds,
/// flattened activities/passivities, and the firehose chunk forwarded
/// verbatim (§4.5, §4.7).
#[derive(Debug)]
pub struct AnalyzerPayload {
    pub users: Vec<User>,
    pub activities: Vec<Message>,
    pub passivities: Vec<View>,
    pub firehose: Vec<Message>,
}
