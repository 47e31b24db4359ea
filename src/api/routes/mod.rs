pub mod health;
pub mod push;
pub mod query;
pub mod stats;
