// Pushover Open Client protocol: REST calls, the push socket, and the wire model

pub mod error;
pub mod model;
pub mod rest;
pub mod socket;
