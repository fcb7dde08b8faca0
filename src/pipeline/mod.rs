pub mod analysis;
pub mod discovery;
pub mod documents;
pub mod extraction;
pub mod fetch;
pub mod processor; // Report orchestrator: patient data → documents → two-stage analysis
