//! Probe lifecycle: patching, unpatching and teardown.
//!
//! Every operation acts on a whole function chain (entry record plus all of
//! its return records) and is refused unless the owning module is live and
//! still at the load generation the records were created for.
//!
//! ```text
//! Unpatched --enable--> Enabled --suspend--> Suspended
//!     ^                  |   ^                  |
//!     +-----disable------+   +------resume------+
//! ```

use alloc::vec::Vec;

use crate::host::ModuleState;
use crate::provider::{Error, FbtProvider};
use crate::table::{ProbeHandle, ProbeRecord, ProbeState};

impl FbtProvider {
    /// Check that the module a record was created for is still the one in
    /// memory.
    pub(crate) fn check_binding(&self, record: &ProbeRecord) -> Result<(), Error> {
        let modules = &self.env.modules;
        if modules.state(record.module) != ModuleState::Live {
            return Err(Error::ModuleNotLive(record.name.clone()));
        }
        if modules.load_generation(record.module) != record.load_gen {
            return Err(Error::ModuleReloaded(record.name.clone()));
        }
        Ok(())
    }

    fn refuse(&self, op: &str, record: &ProbeRecord, err: &Error) {
        if self.config.verbose {
            info!("fbt: refusing to {} {}: {}", op, record.name, err);
        } else {
            debug!("fbt: refusing to {} {}: {}", op, record.name, err);
        }
    }

    /// Install the trap byte at every site of the function.
    ///
    /// Returns the number of bytes written.
    pub fn enable_probe(&self, head: ProbeHandle) -> Result<usize, Error> {
        self.transition(head, ProbeState::Enabled, "enable")
    }

    /// Restore the original byte at every site of the function.
    pub fn disable_probe(&self, head: ProbeHandle) -> Result<usize, Error> {
        self.transition(head, ProbeState::Unpatched, "disable")
    }

    /// Restore the original bytes while keeping the probe enabled.
    pub fn suspend_probe(&self, head: ProbeHandle) -> Result<usize, Error> {
        self.transition(head, ProbeState::Suspended, "suspend")
    }

    /// Reinstall the trap bytes of a suspended probe.
    pub fn resume_probe(&self, head: ProbeHandle) -> Result<usize, Error> {
        self.transition(head, ProbeState::Enabled, "resume")
    }

    fn transition(&self, head: ProbeHandle, target: ProbeState, op: &str) -> Result<usize, Error> {
        let chain = self.live_chain(head);
        let (_, first) = chain.first().ok_or(Error::StaleProbe)?;
        if let Err(e) = self.check_binding(first) {
            self.refuse(op, first, &e);
            return Err(e);
        }

        let mut written = 0;
        for (handle, record) in &chain {
            let val = match target {
                ProbeState::Enabled => record.patch_val,
                ProbeState::Unpatched | ProbeState::Suspended => record.saved,
            };
            match self.env.memory.write_text_byte(record.addr, val) {
                Ok(()) => {
                    self.table.update(*handle, |r| r.state = target);
                    written += 1;
                }
                Err(e) => {
                    warn!("fbt: {} {} at {:#x} failed: {:?}", op, record.name, record.addr, e);
                }
            }
        }
        Ok(written)
    }

    /// Tear down every record of the function.
    ///
    /// Patched sites are restored first when the module is still the one
    /// the records belong to. Destroying an already destroyed probe is a
    /// no-op. Returns the number of records released.
    pub fn destroy_probe(&self, head: ProbeHandle) -> usize {
        let chain = self.live_chain(head);
        let Some((_, first)) = chain.first() else {
            return 0;
        };

        if self.check_binding(first).is_ok() {
            for (_, record) in chain.iter().filter(|(_, r)| r.state == ProbeState::Enabled) {
                if let Err(e) = self.env.memory.write_text_byte(record.addr, record.saved) {
                    warn!("fbt: restore {} at {:#x} failed: {:?}", record.name, record.addr, e);
                }
            }
        }

        let released: Vec<ProbeRecord> = chain
            .iter()
            .filter_map(|(handle, _)| self.table.remove(*handle))
            .collect();
        let removed = released.len();

        let mut counts = self.module_counts.lock();
        for record in &released {
            let key = (record.module, record.load_gen);
            let drained = match counts.get_mut(&key) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count == 0
                }
                None => false,
            };
            if drained {
                counts.remove(&key);
            }
        }
        trace!("fbt: destroyed {} ({} records)", first.name, removed);
        removed
    }

    fn live_chain(&self, head: ProbeHandle) -> Vec<(ProbeHandle, ProbeRecord)> {
        self.table
            .chain(head)
            .into_iter()
            .filter_map(|h| self.table.get(h).map(|r| (h, r)))
            .collect()
    }
}
