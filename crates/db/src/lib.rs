pub mod activation;
pub mod connection;
pub mod fixtures;
pub mod migrations;
pub mod repositories;
pub mod store;

pub use activation::{ActivationManager, ActivationReport, DeactivationReport, ResumeMode};
pub use connection::{connect, connect_with_settings, DbPool};
pub use fixtures::{DemoSeedDataset, SeedResult, VerificationResult};
pub use store::{ArchiveOutcome, ConfigurationStore};
