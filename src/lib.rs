//! Live annotation cache for an out-of-process source analysis engine.
//!
//! Keeps per-file offset regions (highlights, navigation, overrides,
//! implemented markers) in step with both the engine's pushes and local
//! edits the engine has not seen yet.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod host;
pub mod region;
pub mod roots;
pub mod session;
pub mod unsent;

pub use cache::AnnotationCache;
pub use config::{Settings, load_settings};
pub use engine::{AnalysisClient, ClientEvent, ConnectionState, EngineLauncher};
pub use error::{ClientError, ConfigError, RequestError};
pub use host::{Host, MemoryHost};
pub use region::{EditEvent, Region, RegionKind, RegionList, RegionStore};
pub use roots::{ContentRoot, FixedRoots, ProjectRootTracker, ProjectRoots, RootsProvider};
pub use session::Session;
pub use unsent::UnsentChangesTracker;
