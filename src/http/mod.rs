//! HTTP integration: admission middleware and the server hosting it.

mod middleware;
mod server;

pub use middleware::{
    admission_middleware, request_info, AdmissionControl, AuthenticatedUser, QuotaHeaders,
    Rejection,
};
pub use server::HttpServer;
