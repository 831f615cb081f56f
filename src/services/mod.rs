pub mod health;

pub use health::{ComponentHealth, HealthResponse, HealthStatus};
