// Wire plumbing for the sync protocol: length-prefixed framing over any
// byte stream, plus dialers that reach peers through the overlay.

pub mod framed;
pub mod transport;

mod error;

pub use error::NetError;
pub use framed::FramedConnection;
pub use transport::{Dialer, StaticDialer, TorDialer};
