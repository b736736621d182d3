// Log module - THE ORDERING SERVICE (abstract)
// Client interface to the external append-only consensus log, plus an in-memory implementation

mod memory;
mod traits;

pub use memory::InMemoryLog;
pub use traits::{
    LogError, LogEvent, LogPosition, OrderedLog, StartFrom, SubscriptionHandle, TopicId,
};
