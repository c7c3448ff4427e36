pub mod algorithms;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod health;
pub mod identifier;
pub mod metrics;
pub mod middleware;
pub mod mode;
pub mod policy;
pub mod redis;
pub mod response;
pub mod server;

pub use algorithms::{AdmissionResult, LocalWindowStore, RedisSlidingWindow, SharedCounter};
pub use config::Config;
pub use engine::{AdmissionEngine, Decision, DecisionMode};
pub use error::{Error, Result};
pub use identifier::{derive_identifier, RequestDescriptor, RequestIdentifier};
pub use middleware::admission_middleware;
pub use policy::{PolicyConfig, PolicyRegistry, RateLimitPolicy};
pub use server::create_app;
