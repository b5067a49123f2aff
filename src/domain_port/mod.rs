mod bus;
mod presence;
mod store;

pub use bus::*;
pub use presence::*;
pub use store::*;
