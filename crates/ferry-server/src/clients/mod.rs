pub mod bot;
pub mod federation;
