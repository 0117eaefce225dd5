//! 持久化审批队列

pub mod store;

pub use store::{ApprovalError, ApprovalItem, ApprovalQueue, ApprovalRequest, ApprovalStatus, EXPIRY_ACTOR};
