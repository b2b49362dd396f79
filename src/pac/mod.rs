pub mod builder;
pub mod server;
pub mod store;

pub use builder::{render_with_ports, PacDocumentBuilder};
pub use server::{pac_url, PacServer};
pub use store::PacStore;
