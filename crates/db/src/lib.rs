pub mod connection;
pub mod fixtures;
pub mod migrations;
pub mod repositories;

pub use connection::{connect_with_settings, DbPool};
pub use fixtures::{DemoSeedDataset, SeedError, SeedResult, SeedVerification, DEMO_COMPANY_ID};
pub use repositories::{RepositoryError, SqlApprovalStore, SqlAuditSink};
