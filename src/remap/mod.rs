pub mod executor;
pub mod report;
pub mod setup;
pub mod table;
