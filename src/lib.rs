pub mod bowing;
pub mod config;
pub mod device_sim;
pub mod error;
pub mod fingerboard;
pub mod kinematics;
pub mod link;
pub mod performer;
pub mod signal;
pub mod types;
