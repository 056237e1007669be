pub mod session;
pub mod stream_json;

pub use session::{AgentSessionManager, CommandReceipt};
