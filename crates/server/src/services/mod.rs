pub mod geocoding;
pub mod messages;
pub mod projects;
pub mod stats;
pub mod storage;
pub mod users;
