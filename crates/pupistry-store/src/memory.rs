//! In-memory store that records every operation.
//!
//! Used by lifecycle tests to assert upload ordering and to check that a
//! no-op publish performs zero uploads.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::{validate_key, ObjectStore, StoreError, StoreResult};

/// A recorded store operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Upload(String),
    Download(String),
    List,
}

/// Object store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RefCell<BTreeMap<String, Vec<u8>>>,
    ops: RefCell<Vec<StoreOp>>,
    read_only: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle that refuses uploads, modelling the agent profile.
    pub fn read_only_view(&self) -> Self {
        Self {
            objects: RefCell::new(self.objects.borrow().clone()),
            ops: RefCell::new(Vec::new()),
            read_only: true,
        }
    }

    /// Seed an object without recording an operation.
    pub fn insert(&self, key: &str, bytes: impl Into<Vec<u8>>) {
        self.objects.borrow_mut().insert(key.to_string(), bytes.into());
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.borrow().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.borrow().keys().cloned().collect()
    }

    pub fn ops(&self) -> Vec<StoreOp> {
        self.ops.borrow().clone()
    }

    /// Keys uploaded, in upload order.
    pub fn uploads(&self) -> Vec<String> {
        self.ops
            .borrow()
            .iter()
            .filter_map(|op| match op {
                StoreOp::Upload(key) => Some(key.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear_ops(&self) {
        self.ops.borrow_mut().clear();
    }
}

impl ObjectStore for MemoryStore {
    fn upload(&self, local_path: &Path, key: &str) -> StoreResult<()> {
        validate_key(key)?;
        if self.read_only {
            return Err(StoreError::AccessDenied {
                target: key.to_string(),
            });
        }
        let bytes =
            fs::read(local_path).map_err(|e| StoreError::io(local_path.display().to_string(), e))?;
        self.ops.borrow_mut().push(StoreOp::Upload(key.to_string()));
        self.objects.borrow_mut().insert(key.to_string(), bytes);
        Ok(())
    }

    fn download(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        validate_key(key)?;
        self.ops.borrow_mut().push(StoreOp::Download(key.to_string()));
        Ok(self.objects.borrow().get(key).cloned())
    }

    fn list(&self) -> StoreResult<Vec<String>> {
        self.ops.borrow_mut().push(StoreOp::List);
        Ok(self.keys())
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}
