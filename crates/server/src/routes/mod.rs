pub mod auth;
pub mod geocode;
pub mod media;
pub mod messages;
pub mod projects;
pub mod users;
