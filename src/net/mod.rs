pub mod port_probe;

pub use port_probe::{is_port_free, pick_ephemeral_port, PortStatus};
