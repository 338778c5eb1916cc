/// Version of this crate, sent in the `User-Agent` header.
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const FEATURES_PATH: &str = "api/features";
pub const STREAM_PATH: &str = "sub";
pub const FEATURES_EVENT: &str = "features";
pub const CACHE_KEY_SEPARATOR: &str = "||";
pub const DEFAULT_HASH_ATTRIBUTE: &str = "id";
