//! Master/slave store toggle.
//!
//! Lets application code read from the slave (e.g. while the master is down
//! for maintenance) and flip back, without knowing which handle is which.

use crate::error::{ReplicationError, Result};
use std::sync::atomic::{AtomicBool, Ordering};

/// Which of two store handles is active.
///
/// Starts on the master.
#[derive(Debug)]
pub struct StoreSwitch<T> {
    master: T,
    slave: Option<T>,
    slave_active: AtomicBool,
}

impl<T> StoreSwitch<T> {
    pub fn new(master: T, slave: Option<T>) -> Self {
        Self {
            master,
            slave,
            slave_active: AtomicBool::new(false),
        }
    }

    /// Pick the first candidate matching each predicate.
    ///
    /// Fails when no candidate is a master; a missing slave is allowed.
    pub fn from_candidates<I, M, S>(candidates: I, is_master: M, is_slave: S) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        M: Fn(&T) -> bool,
        S: Fn(&T) -> bool,
    {
        let mut master = None;
        let mut slave = None;
        for candidate in candidates {
            if master.is_none() && is_master(&candidate) {
                master = Some(candidate);
            } else if slave.is_none() && is_slave(&candidate) {
                slave = Some(candidate);
            }
        }
        let master = master
            .ok_or_else(|| ReplicationError::Config("no master store among candidates".into()))?;
        Ok(Self::new(master, slave))
    }

    /// The handle currently in use.
    pub fn active(&self) -> &T {
        match (&self.slave, self.is_slave_active()) {
            (Some(slave), true) => slave,
            _ => &self.master,
        }
    }

    pub fn master(&self) -> &T {
        &self.master
    }

    pub fn slave(&self) -> Option<&T> {
        self.slave.as_ref()
    }

    pub fn switch_to_master(&self) {
        self.slave_active.store(false, Ordering::SeqCst);
    }

    /// Errors when no slave is configured.
    pub fn switch_to_slave(&self) -> Result<()> {
        if self.slave.is_none() {
            return Err(ReplicationError::Config("no slave store configured".into()));
        }
        self.slave_active.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Flip to the other handle; stays on the master if there is no slave.
    pub fn toggle(&self) -> &T {
        if self.is_slave_active() {
            self.switch_to_master();
        } else if self.slave.is_some() {
            self.slave_active.store(true, Ordering::SeqCst);
        }
        self.active()
    }

    pub fn is_master_active(&self) -> bool {
        !self.is_slave_active()
    }

    pub fn is_slave_active(&self) -> bool {
        self.slave_active.load(Ordering::SeqCst)
    }
}
