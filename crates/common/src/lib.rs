pub mod error;
pub mod principal;
pub mod response;

pub use error::{Error, Result};
pub use principal::Principal;
pub use response::ApiResponse;
