//! CLI command implementations

pub mod checksum;
pub mod config;
pub mod run;
pub mod serve;
pub mod worker;

pub use checksum::execute as checksum;
pub use config::execute as config;
pub use run::execute as run;
pub use serve::execute as serve;
pub use worker::execute as worker;
