pub mod collect;
pub mod collectors;
pub mod config;
pub mod fetch;
pub mod ingest;
pub mod logging;
pub mod models;
pub mod normalization;
pub mod scoring;
pub mod storage;

pub mod util {
    pub mod env;
}

#[cfg(test)]
pub mod testing;
