use std::sync::atomic::{AtomicU64, Ordering};

use fnv::FnvHashMap;
use spin::Mutex;
use thiserror::Error;

use fabric_api::Handle;

#[derive(Debug, Error)]
pub(crate) enum Error {
    #[error("Resource not found")]
    NotFound,
    #[error("Resource exists")]
    Exists,
}

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Handles name provider objects (domains, queues, endpoints) and double as
/// the rdma_cm user context of the ids they own.
pub(crate) fn alloc_handle() -> Handle {
    Handle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug)]
pub(crate) struct ResourceTable<R> {
    table: Mutex<FnvHashMap<Handle, R>>,
}

impl<R> Default for ResourceTable<R> {
    fn default() -> Self {
        ResourceTable {
            table: Mutex::new(FnvHashMap::default()),
        }
    }
}

impl<R: Clone> ResourceTable<R> {
    pub(crate) fn insert(&self, handle: Handle, r: R) -> Result<(), Error> {
        let mut table = self.table.lock();
        if table.contains_key(&handle) {
            return Err(Error::Exists);
        }
        table.insert(handle, r);
        Ok(())
    }

    pub(crate) fn get(&self, handle: Handle) -> Result<R, Error> {
        self.table.lock().get(&handle).cloned().ok_or(Error::NotFound)
    }

    pub(crate) fn remove(&self, handle: Handle) -> Result<R, Error> {
        self.table.lock().remove(&handle).ok_or(Error::NotFound)
    }
}
