use serde::{Deserialize, Serialize};

use crate::ids::{Mid, Uid, Vid};

/// A passive action: recorded when a user scans a feed item without resharing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    pub vid: Vid,
    pub uid: Uid,
    pub parent_mid: Mid,
    pub parent_uid: Uid,
}
