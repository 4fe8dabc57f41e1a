//! Shared infrastructure for the paygate workspace.

mod db;

pub use db::{create_pool, PoolSettings};
