pub mod addr;
pub mod error;
pub mod stream;
pub mod tls;

pub use addr::Address;
pub use error::{DatabaseKind, GeoError, GeoErrorKind};
pub use stream::ProxyStream;
