//! In-flight use accounting. Only the 0→1 and 1→0 transitions touch the
//! device; everything in between is counter arithmetic.

use super::{ObjectError, TokenObject};
use crate::transport::Transport;

impl TokenObject {
    /// Mark the object as in use, loading it on the first user.
    pub(crate) fn increment_use(&mut self, transport: &dyn Transport) -> Result<u32, ObjectError> {
        let next = self.active.checked_add(1).ok_or(ObjectError::General {
            op: "increment_use",
            id: self.id,
        })?;

        if self.active == 0 {
            let key = self
                .key_ref()
                .ok_or(ObjectError::ActionProhibited("object holds no key material"))?;
            let auth = self.unsealed_auth.as_deref().map(|a| a.as_slice());
            let hw = transport.load(&key, auth)?;
            tracing::debug!(id = %self.id, handle = self.handle, hw = hw.0, "Object loaded");
            self.hw_handle = Some(hw);
        }

        self.active = next;
        tracing::trace!(id = %self.id, active = self.active, "Use incremented");
        Ok(self.active)
    }

    /// Retire one user, evicting the object when the last one leaves.
    /// Evict failures are logged and do not keep the object busy.
    pub(crate) fn decrement_use(&mut self, transport: &dyn Transport) -> Result<u32, ObjectError> {
        if self.active == 0 {
            tracing::error!(id = %self.id, handle = self.handle, "Use count decremented below zero");
            return Err(ObjectError::General {
                op: "decrement_use",
                id: self.id,
            });
        }

        self.active -= 1;
        if self.active == 0 {
            if let Some(hw) = self.hw_handle.take() {
                match transport.evict(hw) {
                    Ok(()) => tracing::debug!(id = %self.id, hw = hw.0, "Object evicted"),
                    Err(e) => {
                        tracing::warn!(id = %self.id, hw = hw.0, error = %e, "Evict failed")
                    }
                }
            }
        }
        tracing::trace!(id = %self.id, active = self.active, "Use decremented");
        Ok(self.active)
    }
}
