mod health;
mod proxy;
mod services;

pub use health::health_check;
pub use proxy::proxy_request;
pub use services::list_services;
