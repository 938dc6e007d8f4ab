//! Shared data types for the refund risk-decision pipeline

pub mod decision;
pub mod profile;
pub mod request;

pub use decision::{DecisionRecord, FinalDecision, RefundResponse};
pub use profile::{HistoricalRefundSample, ItemDetail, UserProfile};
pub use request::RefundRequest;
