//! Registration controller
//!
//! Turns Service lifecycle events into registrar calls. The controller holds
//! no registration state; every decision is made from the live cluster.

mod registration;

pub use registration::{
    on_service_created, on_service_deleted, on_service_updated, reconcile, Context,
    ContextBuilder, Outcome, Reconciler, SkipReason,
};
