pub mod ports;

pub use ports::{discover_ports, list_available_ports, PortInfo};
