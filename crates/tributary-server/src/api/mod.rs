//! API envelope types shared by every route

pub mod response;

pub use response::{ApiResponse, ErrorDetail, ErrorResponse};
