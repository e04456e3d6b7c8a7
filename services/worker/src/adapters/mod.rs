//! services/worker/src/adapters/mod.rs

pub mod db;

pub use db::DbAdapter;
