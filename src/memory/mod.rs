pub mod config;
pub mod error;
pub mod identity;
pub mod introspect;
pub(crate) mod large;
pub(crate) mod magazine;
pub mod pressure;
pub(crate) mod region;
pub mod registry;
pub mod size_class;
pub mod stats;
pub mod vm;
pub mod zone;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
