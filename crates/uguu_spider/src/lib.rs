//! uguu spider
//!
//! Keeps the uguu catalog in sync with the network shares it indexes. For
//! every due share an external scanner lists the share's contents, either
//! in full or as a patch against the listing saved by the previous scan,
//! and the result is reconciled into the share's content-addressed tree.

pub mod baseline;
pub mod config;
pub mod error;
pub mod protocol;
pub mod reconcile;
pub mod rehash;
pub mod scanner;
pub mod search_text;
pub mod spider;

pub use config::SpiderConfig;
pub use error::{ErrorKind, Result, SpiderError};
pub use protocol::{LineParser, Record, ScanMode};
pub use reconcile::{ReconcileStats, ScanJob, ScanOutcome};
pub use rehash::{rehash, RehashSummary};
pub use scanner::{CaptureOptions, CapturedScan, ScanCommand, ScannerKind};
pub use spider::{RunSummary, Spider};
