pub mod fetcher;
pub mod repository;
pub mod stream;
