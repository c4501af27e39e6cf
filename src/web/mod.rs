pub mod admin;
pub mod relay;
