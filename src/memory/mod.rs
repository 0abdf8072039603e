pub mod ledger;
pub mod stats;
pub mod vm;

#[cfg(test)]
pub static TEST_MUTEX: std::sync::RwLock<()> = std::sync::RwLock::new(());
