//! Data model shared across SimSoM's simulation participants: the objects
//! that travel through the pipeline (`User`, `Message`, `View`), the
//! envelope protocol they're wrapped in, and the external action contract a
//! Worker drives.

mod action;
mod envelope;
mod error;
mod ids;
mod message;
mod policy;
mod user;
mod view;

pub use action::{ActionGenerator, DefaultActionGenerator};
pub use envelope::{Envelope, SenderRole};
pub use error::ProtocolError;
pub use ids::{Mid, Uid, Vid, WorkerRank};
pub use message::{Message, QualityParams};
pub use policy::PolicyState;
pub use user::{generate_message_topics, generate_user_topics, User};
pub use view::View;
