//! Preflight gate: authentication, required service version (hard), host
//! version (soft).

use quill_core::SyncError;

use crate::engine::SyncEngine;

impl SyncEngine {
    /// Run the preflight checks, surfacing a message for each failure.
    pub(crate) async fn preflight(&self) -> Result<(), SyncError> {
        let collab = &self.inner.collab;
        let notifier = &collab.notifier;

        if !collab.auth.available() {
            let text = "Sync needs an authentication provider; sign in to enable sync.";
            notifier.info(text);
            return Err(SyncError::precondition(text));
        }
        match collab.auth.status().await {
            Ok(status) if status.authenticated => {}
            Ok(_) => {
                let text = "You are not signed in; sign in to sync your project.";
                notifier.info(text);
                return Err(SyncError::precondition(text));
            }
            Err(err) => {
                let text = format!("Could not confirm your sign-in status: {err}");
                notifier.info(&text);
                return Err(SyncError::precondition(text));
            }
        }

        // Concurrent metadata writes from an outdated service corrupt data, so
        // this gate fails closed.
        match collab.versions.check_required_service_version().await {
            Ok(check) if check.ok => {}
            Ok(check) => {
                let text = format!(
                    "Sync is disabled: the sync service must be version {} or newer (installed: {}). \
                     Update it before syncing.",
                    check.required,
                    check.installed_label()
                );
                notifier.warn_modal(&text);
                return Err(SyncError::precondition(text));
            }
            Err(err) => {
                let text = format!("Sync is disabled: could not verify the sync service version ({err}).");
                notifier.warn_modal(&text);
                return Err(SyncError::precondition(text));
            }
        }

        match collab.versions.check_host_version().await {
            Ok(check) if !check.ok => {
                notifier.info(&format!(
                    "This editor is version {}; version {} or newer is recommended for syncing.",
                    check.installed_label(),
                    check.required
                ));
            }
            Ok(_) => {}
            Err(err) => tracing::debug!(error = %err, "host version check failed; continuing"),
        }

        Ok(())
    }
}
