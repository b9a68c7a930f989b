pub mod redis;
pub mod request_caching;
