pub mod rest;
mod ws;

pub use rest::{ApiResponse, RestApi};
