use super::RequestScope;
use crate::core::Result;
use tracing::{Level, event, info_span};

impl RequestScope {
    /// Finishes the request in the fixed order:
    ///
    /// ```text
    /// PRESECURITY triggers -> commit checks -> pre_commit -> save/create
    ///   -> flush -> PRECOMMIT triggers -> audit -> commit -> POSTCOMMIT triggers
    /// ```
    ///
    /// The transaction is cancelled on any error raised before `commit`
    /// succeeds, and always closed. A failing POSTCOMMIT hook is reported
    /// but cannot undo the commit.
    pub fn complete(&mut self) -> Result<()> {
        let span = info_span!("complete_request", request_id = %self.request_id, user = self.user.name());
        let _enter = span.enter();

        let outcome = match self.commit_sequence() {
            Ok(()) => self.run_queued_post_commit_triggers().inspect_err(|err| {
                event!(Level::ERROR, error = %err, "post-commit hook failed after commit");
            }),
            Err(err) => {
                event!(Level::ERROR, error = %err, "request failed; cancelling transaction");
                self.transaction.cancel();
                Err(err)
            }
        };

        let closed = self.transaction.close();
        outcome?;
        closed?;

        event!(Level::INFO, "request committed");
        Ok(())
    }

    /// Abandons the request: cancels and closes the transaction.
    pub fn abort(&mut self) {
        self.transaction.cancel();
        if let Err(err) = self.transaction.close() {
            log::warn!("failed to close transaction for request {}: {}", self.request_id, err);
        }
    }

    fn commit_sequence(&mut self) -> Result<()> {
        self.run_queued_pre_security_triggers()?;
        self.execute_commit_checks()?;
        self.transaction.pre_commit()?;
        self.save_or_create_objects()?;
        self.transaction.flush(&self.arena)?;
        self.run_queued_pre_commit_triggers()?;
        self.commit_audit()?;
        self.transaction.commit()
    }
}

/// Executes `body` within a request.
///
/// If the body returns `Ok`, the request is completed.
/// If it returns `Err`, the transaction is cancelled.
pub fn run_request<T, F>(mut scope: RequestScope, body: F) -> Result<T>
where
    F: FnOnce(&mut RequestScope) -> Result<T>,
{
    match body(&mut scope) {
        Ok(value) => {
            scope.complete()?;
            Ok(value)
        }
        Err(err) => {
            scope.abort();
            Err(err)
        }
    }
}
