mod api;

pub use api::{DataResponse, HealthResponse, SlowParams, SlowResponse, WhoAmIResponse};
