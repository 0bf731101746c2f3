// Desktop client for the Pushover Open Client API

// Pushover REST calls, push socket and wire model
pub mod protocol;

// Connection lifecycle (manager actor, reachability, wake detection)
pub mod connection;

// Batch processing, archive, display and sound
pub mod delivery;

// Paths and persisted settings
pub mod config;
pub mod persistence;
pub mod settings;

// Async test helpers, shared with integration tests
pub mod test_utils;
