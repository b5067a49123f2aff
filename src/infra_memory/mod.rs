mod bus_memory;
mod presence_memory;
mod store_memory;

pub use bus_memory::*;
pub use presence_memory::*;
pub use store_memory::*;
