pub mod batch;
pub mod directus;
pub mod dispatch;
pub mod gs1;
pub mod health;
pub mod metrics;
pub mod store;
pub mod timestamp;
