pub mod config;
pub mod db;
pub mod diagnostics;
pub mod editing_session;
pub mod storage;

#[cfg(test)]
mod config_test;
