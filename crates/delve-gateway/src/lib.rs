mod admission;
mod auth;
mod host;
mod lanes;
mod protocol;
mod routes;
mod server;
mod sse;
mod state;

pub use admission::{build_admission, AdmissionControl, AllowAll, QuotaLedger};
pub use host::{RunHost, RunRequest, RunStream, StreamItem};
pub use lanes::{LaneGuard, RunLanes};
pub use protocol::StreamRunBody;
pub use server::GatewayServer;
pub use sse::render_frame;
pub use state::AppState;
