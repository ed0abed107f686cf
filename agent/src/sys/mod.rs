// Zero-Trust Architecture: every external system is reached through a trait in
// `traits`; concrete managers below shell out to the real tools.

pub mod traits;      // Global contracts
pub mod secrets;     // Memory hygiene (AssumedCredentials)
pub mod aws_cli;     // Shared `aws` subprocess runner
pub mod credentials; // Cross-account role assumption
pub mod store;       // Source bundle storage
pub mod sandbox;     // Per-deployment working directories
pub mod sanitize;    // Output scrubbing
pub mod tool;        // IaC tool stages and pipelines
