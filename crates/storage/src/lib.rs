pub mod journal;
pub mod pidfile;
pub mod trust;

pub use journal::{Journal, JournalEvent};
pub use pidfile::PidFile;
pub use trust::{TrustDecision, TrustStore, TrustedExtensions};
