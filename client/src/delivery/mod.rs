// From a fetched batch to what the user sees and hears

pub mod display;
pub mod icon;
pub mod pipeline;
pub mod sound;
pub mod store;
