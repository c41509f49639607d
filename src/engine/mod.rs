//! Connection to the out-of-process analysis engine.

mod client;
pub mod loopback;
pub mod protocol;
mod reader;
mod request_tracker;
mod router;
mod state;

pub use client::{AnalysisClient, ClientEvent, EngineConnection, EngineLauncher};
pub use loopback::{EngineEndpoint, LoopbackLauncher};
pub use protocol::{EngineNotification, EngineRequest, RequestId, RequestKind};
pub use request_tracker::RequestTracker;
pub use state::ConnectionState;
