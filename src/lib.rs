pub mod autosave;
pub mod connection;
pub mod erase;
pub mod events;
pub mod journal;
pub mod models;
pub mod permissions;
pub mod presence;
pub mod rate_limit;
pub mod rooms;
pub mod store;
