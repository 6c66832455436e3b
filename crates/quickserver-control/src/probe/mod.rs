pub mod rcon;
pub mod status;

pub use rcon::RconProbe;
pub use status::{StatusReport, parse as parse_status};
