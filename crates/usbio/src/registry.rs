//! Submitted-transfer registry
//!
//! While a transfer is in flight the driver holds a raw pointer to the native
//! descriptor and will invoke its completion callback exactly once. This
//! process-wide table keeps one strong reference per submitted transfer,
//! keyed by the descriptor address, so the backing memory cannot be released
//! before that callback has fired. Entries exist if and only if the transfer
//! is submitted; insertion happens in `submit()` and removal in the
//! completion dispatch (or in `submit()` itself when the native call fails).

use crate::transfer::TransferCore;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

static SUBMITTED: LazyLock<Mutex<HashMap<usize, Arc<TransferCore>>>> =
    LazyLock::new(Default::default);

pub(crate) fn insert(key: usize, core: Arc<TransferCore>) {
    SUBMITTED.lock().unwrap().insert(key, core);
}

pub(crate) fn remove(key: usize) -> Option<Arc<TransferCore>> {
    SUBMITTED.lock().unwrap().remove(&key)
}

pub(crate) fn contains(key: usize) -> bool {
    SUBMITTED.lock().unwrap().contains_key(&key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::Transfer;

    #[test]
    fn test_registry_round_trip() {
        let transfer = Transfer::detached(0).unwrap();
        let key = transfer.core.native_addr().unwrap();

        assert!(!contains(key));
        insert(key, Arc::clone(&transfer.core));
        assert!(contains(key));
        let removed = remove(key).expect("entry present");
        assert!(Arc::ptr_eq(&removed, &transfer.core));
        assert!(!contains(key));
        assert!(remove(key).is_none());
    }
}
