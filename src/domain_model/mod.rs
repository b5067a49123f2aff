mod channel;
mod session;
mod subject;
mod user;

pub use channel::*;
pub use session::*;
pub use subject::*;
pub use user::*;
