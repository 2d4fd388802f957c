pub mod models;
pub mod orientation;
pub mod settings;
