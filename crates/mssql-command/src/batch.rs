//! Batch RPC mode and per-invocation accounting.
//!
//! Batch mode aggregates several commands into one wire round trip. The
//! column-encryption setting is locked by the first command added; every
//! later addition must agree. Each aggregated RPC records its own rows
//! affected, the running total, and the ranges of the execution's
//! diagnostic buffers that belong to it.

use tds_rpc::{RpcRecord, ServerFault};

use crate::command::ColumnEncryptionSetting;
use crate::error::{Error, Result};

/// State of a command running in batch RPC mode.
#[derive(Debug, Default)]
pub struct BatchMode {
    /// The encryption setting locked in by the first added command.
    setting: Option<ColumnEncryptionSetting>,
    /// Aggregated invocation descriptors, in execution order.
    pub rpcs: Vec<RpcRecord>,
    /// Index of the RPC whose response is currently being read.
    pub current_index: usize,
}

impl BatchMode {
    /// Start an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock (or re-check) the batch's encryption setting.
    ///
    /// The first added command records its setting; every later one must
    /// carry the same value.
    pub fn lock_setting(&mut self, setting: ColumnEncryptionSetting) -> Result<()> {
        match self.setting {
            None => {
                self.setting = Some(setting);
                Ok(())
            }
            Some(locked) if locked == setting => Ok(()),
            Some(locked) => Err(Error::InvalidOperation(format!(
                "batch locked to column encryption setting {locked:?}, got {setting:?}"
            ))),
        }
    }

    /// The locked setting, once a command has been added.
    #[must_use]
    pub fn setting(&self) -> Option<ColumnEncryptionSetting> {
        self.setting
    }

    /// Append an aggregated invocation.
    pub fn push_rpc(&mut self, record: RpcRecord) {
        self.rpcs.push(record);
    }

    /// Number of aggregated invocations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rpcs.len()
    }

    /// Whether the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rpcs.is_empty()
    }

    /// Rows affected by invocation `index` alone.
    #[must_use]
    pub fn records_affected(&self, index: usize) -> Option<u64> {
        self.rpcs.get(index).and_then(|r| r.records_affected)
    }

    /// Rows affected up to and including invocation `index`.
    #[must_use]
    pub fn cumulative_records_affected(&self, index: usize) -> Option<u64> {
        self.rpcs.get(index).map(|r| r.cumulative_records_affected)
    }

    /// Reconstruct the faults of invocation `index` by combining its error
    /// and warning slices of the execution's diagnostic buffers.
    #[must_use]
    pub fn errors_for(
        &self,
        index: usize,
        errors: &[ServerFault],
        warnings: &[ServerFault],
    ) -> Vec<ServerFault> {
        let Some(rpc) = self.rpcs.get(index) else {
            return Vec::new();
        };
        let mut combined = Vec::new();
        let (es, ee) = rpc.errors_range;
        if let Some(slice) = errors.get(es..ee) {
            combined.extend_from_slice(slice);
        }
        let (ws, we) = rpc.warnings_range;
        if let Some(slice) = warnings.get(ws..we) {
            combined.extend_from_slice(slice);
        }
        combined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tds_rpc::{ProcId, RpcRecord};

    fn fault(number: i32, class: u8) -> ServerFault {
        ServerFault {
            number,
            class,
            state: 1,
            message: format!("fault {number}"),
            server: None,
            procedure: None,
            line: 1,
        }
    }

    #[test]
    fn test_setting_locks_on_first_add() {
        let mut batch = BatchMode::new();
        batch
            .lock_setting(ColumnEncryptionSetting::Enabled)
            .unwrap();
        batch
            .lock_setting(ColumnEncryptionSetting::Enabled)
            .unwrap();
        assert!(batch
            .lock_setting(ColumnEncryptionSetting::Disabled)
            .is_err());
        assert_eq!(batch.setting(), Some(ColumnEncryptionSetting::Enabled));
    }

    #[test]
    fn test_errors_for_combines_slices() {
        let mut batch = BatchMode::new();
        let mut first = RpcRecord::system(ProcId::ExecuteSql);
        first.errors_range = (0, 1);
        first.warnings_range = (0, 0);
        let mut second = RpcRecord::system(ProcId::ExecuteSql);
        second.errors_range = (1, 2);
        second.warnings_range = (0, 1);
        batch.push_rpc(first);
        batch.push_rpc(second);

        let errors = vec![fault(100, 16), fault(200, 16)];
        let warnings = vec![fault(5701, 10)];

        let combined = batch.errors_for(1, &errors, &warnings);
        assert_eq!(combined.len(), 2);
        assert_eq!(combined[0].number, 200);
        assert_eq!(combined[1].number, 5701);

        let first_only = batch.errors_for(0, &errors, &warnings);
        assert_eq!(first_only.len(), 1);
        assert_eq!(first_only[0].number, 100);
    }

    #[test]
    fn test_errors_for_out_of_range_index() {
        let batch = BatchMode::new();
        assert!(batch.errors_for(3, &[], &[]).is_empty());
    }

    #[test]
    fn test_records_affected_accessors() {
        let mut batch = BatchMode::new();
        let mut rpc = RpcRecord::system(ProcId::ExecuteSql);
        rpc.records_affected = Some(3);
        rpc.cumulative_records_affected = 10;
        batch.push_rpc(rpc);
        assert_eq!(batch.records_affected(0), Some(3));
        assert_eq!(batch.cumulative_records_affected(0), Some(10));
        assert_eq!(batch.records_affected(1), None);
    }
}
