pub mod boards;
pub mod captive_portal;
pub mod setting;

pub use setting::Setting;
