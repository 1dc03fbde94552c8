pub(crate) mod block_allocator;
pub(crate) mod error;
pub(crate) mod integration;
pub(crate) mod stats;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
