pub mod catalog;
pub mod settings;
