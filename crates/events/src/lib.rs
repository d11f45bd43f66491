//! Change events and their delivery bookkeeping types.
//!
//! Events are produced by the identity-management side when a change commits
//! (account created, group membership changed, ...). This crate holds the
//! immutable event record, the envelope that moves events through the dispatch
//! queue, and the eligibility/bookkeeping vocabulary shared with the change
//! log store.

pub mod delivery;
pub mod envelope;
pub mod event;

pub use delivery::{DeliveryRecord, DeliveryStatus, EligibilityWindow};
pub use envelope::Envelope;
pub use event::Event;
