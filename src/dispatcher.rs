use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::config::DeviceIdentity;
use crate::config::OperationalParams;
use crate::coordinator::RefreshTrigger;
use crate::error::RejectReason;
use crate::error::WriteError;
use crate::error::WriteFailure;
use crate::field::FieldCatalog;
use crate::field::FieldValue;
use crate::lock::AccessLock;
use crate::util::mask_address;

/// How long the link stays held after a write so the device can apply it
pub const SETTLE_DELAY: Duration = Duration::from_secs(5);

/// A user initiated change of one field
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub field: String,
    pub value: FieldValue,
}

impl WriteRequest {
    pub fn new(field: impl Into<String>, value: FieldValue) -> Self {
        Self {
            field: field.into(),
            value,
        }
    }
}

/// Sends switch and select changes to the device.
///
/// Writes share the [`AccessLock`] with the polling coordinator and are
/// never retried: the caller is told about every failure.
pub struct CommandDispatcher {
    address: String,
    use_encryption: bool,
    catalog: Arc<FieldCatalog>,
    lock: Arc<AccessLock>,
    params: watch::Receiver<OperationalParams>,
    refresh: RefreshTrigger,
    settle_delay: Duration,
}

impl CommandDispatcher {
    pub fn new(
        identity: &DeviceIdentity,
        catalog: Arc<FieldCatalog>,
        lock: Arc<AccessLock>,
        params: watch::Receiver<OperationalParams>,
        refresh: RefreshTrigger,
    ) -> Self {
        Self {
            address: identity.address.clone(),
            use_encryption: identity.use_encryption,
            catalog,
            lock,
            params,
            refresh,
            settle_delay: SETTLE_DELAY,
        }
    }

    /// Write one field and request a refresh once the device has settled.
    ///
    /// Returns [`WriteError::Rejected`] without any I/O if the device is
    /// encrypted, the field is not writable or the value does not fit the
    /// field. Returns [`WriteError::Failed`] if the session could not
    /// complete the write in time; no refresh is requested in that case.
    pub async fn execute(&self, request: &WriteRequest) -> Result<(), WriteError> {
        self.check(request)?;

        let address = mask_address(&self.address);
        let write_timeout = self.params.borrow().timeout();
        debug!(address = %address, field = %request.field, value = %request.value, "writing");

        {
            let mut session = self.lock.acquire("write").await;
            let result = timeout(write_timeout, async {
                if !session.is_connected() {
                    session.connect().await?;
                }
                session.write(&request.field, &request.value, write_timeout).await
            })
            .await;

            let cause = match result {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(WriteFailure::Transport(err)),
                Err(_) => Some(WriteFailure::Timeout(write_timeout)),
            };
            if let Some(cause) = cause {
                error!(address = %address, field = %request.field, "write failed: {cause}");
                return Err(WriteError::Failed {
                    field: request.field.clone(),
                    cause,
                });
            }

            tokio::time::sleep(self.settle_delay).await;
        }

        info!(address = %address, field = %request.field, value = %request.value, "write applied");
        self.refresh.request();
        Ok(())
    }

    fn check(&self, request: &WriteRequest) -> Result<(), WriteError> {
        let reject = |reason| WriteError::Rejected {
            field: request.field.clone(),
            reason,
        };

        if self.use_encryption {
            return Err(reject(RejectReason::Encrypted));
        }

        let spec = self
            .catalog
            .get(&request.field)
            .filter(|spec| spec.kind.is_writable())
            .ok_or_else(|| reject(RejectReason::NotWritable))?;

        if !spec.kind.accepts(&request.value, &spec.options) {
            return Err(reject(RejectReason::InvalidValue(request.value.to_string())));
        }

        Ok(())
    }
}
