mod cookie;
mod error;
mod filters;
mod handler;
mod router;

pub use error::{ApiErrorCode, recover_error};
pub use filters::MAX_BODY_BYTES;
pub use router::{app, routes};
