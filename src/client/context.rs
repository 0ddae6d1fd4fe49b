//! Caller context for calls made from inside a request handler.
//!
//! The server establishes a [`CallerContext`] around every dispatched handler
//! task. Outbound calls issued from that task pick it up, so the inbound user
//! and correlation id flow to the next service without call sites copying
//! headers by hand.

use crate::auth::RequestUser;
use std::future::Future;

tokio::task_local! {
    static CALLER: CallerContext;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerContext {
    pub user: RequestUser,
    pub correlation_id: Option<String>,
    /// Address of the original caller
    pub remote_addr: Option<String>,
}

impl CallerContext {
    /// Run `future` with this context installed.
    pub async fn scope<F: Future>(self, future: F) -> F::Output {
        CALLER.scope(self, future).await
    }

    /// The context of the current task, if one was installed.
    pub fn current() -> Option<CallerContext> {
        CALLER.try_with(|caller| caller.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_context_is_task_scoped() {
        assert!(CallerContext::current().is_none());

        let caller = CallerContext {
            user: RequestUser::new("42", 3),
            correlation_id: Some("abc".into()),
            remote_addr: Some("10.0.0.1".into()),
        };
        let seen = caller.clone().scope(async { CallerContext::current() }).await;
        assert_eq!(seen, Some(caller));

        assert!(CallerContext::current().is_none());
    }
}
