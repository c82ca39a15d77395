mod error;
mod tls;

pub use error::TransportError;
pub use tls::TlsMaterial;
