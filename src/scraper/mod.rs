pub mod activity;
pub mod gate;
pub mod snapshot;

pub use activity::ActivityScraper;
pub use gate::AdmissionGate;
pub use snapshot::SnapshotScraper;
