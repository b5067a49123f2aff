mod bus_nats;

pub use bus_nats::*;
