pub mod alerts;
pub mod config;
pub mod cycle;
pub mod document;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod partner;
pub mod reconciler;
pub mod selector;
pub mod test_utils;
