//! Transient vs permanent failure classification.
//!
//! The worker asks a [`FailureClassifier`] whether a failed operation is
//! worth retrying. The default, [`CommunicationFailure`], walks the whole
//! cause chain and answers yes only when some link reports a lost or refused
//! connection. Everything else is permanent and the operation is dropped.

use crate::store::StoreError;
use std::error::Error;
use std::io;

/// Decides whether an error is worth retrying.
///
/// Closures of the right shape implement this trait:
///
/// ```rust
/// use entity_replicator::classify::FailureClassifier;
///
/// let never = |_: &(dyn std::error::Error + 'static)| false;
/// let err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
/// assert!(!never.is_transient(&err));
/// ```
pub trait FailureClassifier: Send + Sync + 'static {
    fn is_transient(&self, error: &(dyn Error + 'static)) -> bool;
}

impl<F> FailureClassifier for F
where
    F: Fn(&(dyn Error + 'static)) -> bool + Send + Sync + 'static,
{
    fn is_transient(&self, error: &(dyn Error + 'static)) -> bool {
        self(error)
    }
}

/// Default classifier: transient iff the chain contains a connectivity failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommunicationFailure;

impl FailureClassifier for CommunicationFailure {
    fn is_transient(&self, error: &(dyn Error + 'static)) -> bool {
        is_communication_failure(error)
    }
}

/// The error followed by each of its causes.
pub fn causes<'a>(error: &'a (dyn Error + 'static)) -> impl Iterator<Item = &'a (dyn Error + 'static)> {
    std::iter::successors(Some(error), |&e| e.source())
}

/// First link of the chain matching `pred`.
pub fn find_in_chain<'a, P>(error: &'a (dyn Error + 'static), mut pred: P) -> Option<&'a (dyn Error + 'static)>
where
    P: FnMut(&(dyn Error + 'static)) -> bool,
{
    causes(error).find(|e| pred(*e))
}

/// True if any link of the chain is a communication failure.
pub fn is_communication_failure(error: &(dyn Error + 'static)) -> bool {
    find_in_chain(error, is_link_failure).is_some()
}

fn is_link_failure(error: &(dyn Error + 'static)) -> bool {
    if let Some(store) = error.downcast_ref::<StoreError>() {
        return store.is_communication_failure();
    }
    if let Some(io) = error.downcast_ref::<io::Error>() {
        return matches!(
            io.kind(),
            io::ErrorKind::ConnectionRefused
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::TimedOut
        );
    }
    error.is::<tokio::time::error::Elapsed>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReplicationError;

    #[test]
    fn test_direct_communication_failure() {
        let err = StoreError::communication("link down");
        assert!(CommunicationFailure.is_transient(&err));
    }

    #[test]
    fn test_nested_io_failure() {
        let io = io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer");
        let err = ReplicationError::from(StoreError::other("flush failed").with_source(io));
        assert!(CommunicationFailure.is_transient(&err));
        assert_eq!(causes(&err).count(), 3);
    }

    #[test]
    fn test_permanent_failures() {
        let err = ReplicationError::from(StoreError::conflict("duplicate key"));
        assert!(!CommunicationFailure.is_transient(&err));

        let io = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(!CommunicationFailure.is_transient(&io));

        let err = ReplicationError::Internal("boom".into());
        assert!(!CommunicationFailure.is_transient(&err));
    }

    #[tokio::test]
    async fn test_elapsed_is_transient() {
        let elapsed = tokio::time::timeout(
            std::time::Duration::from_millis(1),
            std::future::pending::<()>(),
        )
        .await
        .unwrap_err();
        assert!(is_communication_failure(&elapsed));
    }

    #[test]
    fn test_closure_classifier() {
        let always = |_: &(dyn Error + 'static)| true;
        let err = StoreError::conflict("x");
        assert!(always.is_transient(&err));
    }

    #[test]
    fn test_find_in_chain() {
        let io = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        let err = ReplicationError::from(StoreError::other("write").with_source(io));
        let found = find_in_chain(&err, |e| e.is::<io::Error>()).unwrap();
        assert!(found.to_string().contains("pipe"));
    }
}
