mod cache_error;
mod server_error;

pub use cache_error::*;
pub use server_error::*;
