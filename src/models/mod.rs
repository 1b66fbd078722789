mod api;

pub use api::{Envelope, HealthResponse, ServiceStatus, ServicesResponse};
