pub mod broker;
pub mod clients;
pub mod config;
pub mod credentials;
pub mod error;
pub mod invites;
pub mod kv;
pub mod queue;
pub mod rate_limit;
mod supervisor;
pub mod tokens;

pub use broker::Broker;
pub use config::Config;
pub use error::BrokerError;
pub use invites::InviteStore;
pub use kv::Kv;
pub use rate_limit::{Allow, RateLimits, SlidingWindow};
pub use tokens::{TokenMap, mint_session_token, verify_session_token};
