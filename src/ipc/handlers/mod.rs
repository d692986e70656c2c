pub mod assignments;
pub mod attendance;
pub mod auth;
pub mod catalog;
pub mod core;
pub mod dashboard;
pub mod groups;
pub mod notifications;
pub mod qr;
pub mod rooms;
pub mod scores;
pub mod setup;
pub mod users;
