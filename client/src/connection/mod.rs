// Connection lifecycle: the manager actor and the OS signals it reacts to

pub mod manager;
pub mod reachability;
pub mod state;
pub mod wake;
