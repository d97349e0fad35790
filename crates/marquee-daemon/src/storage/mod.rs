//! SQLite storage for the Marquee daemon.

mod db;
mod models;
mod queries;

pub use db::{Database, DatabaseError};
pub use models::*;
