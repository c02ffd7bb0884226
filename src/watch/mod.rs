mod watcher_mgr;
pub use watcher_mgr::*;

#[cfg(test)]
mod watcher_mgr_test;
