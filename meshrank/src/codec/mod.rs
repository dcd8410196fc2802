pub mod decode;
pub mod keystore;
pub mod types;

pub use decode::decode;
pub use keystore::KeyStore;
pub use types::*;
