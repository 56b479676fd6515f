pub mod client;
pub mod http;

pub use client::{
    GenerationClient, GenerationError, GenerationRequest, GenerationResponse, GenerationUsage,
};
pub use http::{HttpGenerationClient, HttpGenerationClientConfig};
