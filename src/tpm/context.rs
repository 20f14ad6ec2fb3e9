use std::fmt;
use std::sync::{Arc, Mutex};

use tss_esapi::handles::KeyHandle;
use tss_esapi::{Context, TctiNameConf};

use super::{keys, TpmError};

struct Shared {
    ctx: Mutex<Context>,
    primary: KeyHandle,
    tcti: String,
}

/// One ESAPI context plus the storage primary every token key lives under.
/// Cheap to clone; all clones serialize on the same context.
#[derive(Clone)]
pub struct TpmContext {
    shared: Arc<Shared>,
}

impl fmt::Debug for TpmContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TpmContext")
            .field("tcti", &self.shared.tcti)
            .finish_non_exhaustive()
    }
}

/// Accept either a full TCTI string (`device:/dev/tpmrm0`, `mssim:...`) or a
/// bare device path.
pub fn tcti_conf(spec: &str) -> Result<TctiNameConf, TpmError> {
    let tcti_str = if spec.contains(':') {
        spec.to_string()
    } else {
        format!("device:{spec}")
    };
    tcti_str
        .parse::<TctiNameConf>()
        .map_err(|e| TpmError::Context(format!("{tcti_str}: {e}")))
}

impl TpmContext {
    pub fn new(tcti: &str) -> Result<Self, TpmError> {
        let mut ctx = Context::new(tcti_conf(tcti)?).map_err(|e| TpmError::Context(e.to_string()))?;
        let primary = keys::create_primary(&mut ctx)?;
        tracing::debug!(tcti, "TPM primary key ready");
        Ok(Self {
            shared: Arc::new(Shared {
                ctx: Mutex::new(ctx),
                primary,
                tcti: tcti.to_string(),
            }),
        })
    }

    pub fn tcti(&self) -> &str {
        &self.shared.tcti
    }

    /// Exclusive use of the context for one synchronous TPM exchange.
    pub fn with_ctx<F, T>(&self, f: F) -> Result<T, TpmError>
    where
        F: FnOnce(&mut Context, KeyHandle) -> Result<T, TpmError>,
    {
        let mut ctx = self
            .shared
            .ctx
            .lock()
            .map_err(|_| TpmError::Context("context mutex poisoned".into()))?;
        f(&mut ctx, self.shared.primary)
    }
}
