pub mod api;
pub mod artifact;
pub mod config;
pub mod errors;
pub mod feedback;
pub mod logging;
pub mod orchestrator;
pub mod provider;
pub mod runtime;
pub mod safety;
pub mod session;
pub mod util;
