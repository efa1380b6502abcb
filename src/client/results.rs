use crate::{Error, registry::SubscriptionId};

/// Outcome of [`QueueClient::publish`](crate::QueueClient::publish).
///
/// Publishing never returns `Err`: transport failures, codec failures and
/// middleware vetoes are all reported here so fire-and-forget callers can
/// ignore the result.
#[derive(Debug)]
pub struct PublishResult {
    error: Option<Error>,
    error_message: Option<String>,
}

impl PublishResult {
    pub fn success() -> Self {
        Self {
            error: None,
            error_message: None,
        }
    }

    pub fn failure(error: Error) -> Self {
        Self {
            error_message: Some(error.kind().to_string()),
            error: Some(error),
        }
    }

    /// A veto issued by a middleware.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::failure(Error::middleware_rejected(reason))
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Short description of the failure, without the span trace.
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn into_error(self) -> Option<Error> {
        self.error
    }

    pub fn into_result(self) -> Result<(), Error> {
        match self.error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }
}

impl From<Result<(), Error>> for PublishResult {
    fn from(result: Result<(), Error>) -> Self {
        match result {
            Ok(()) => Self::success(),
            Err(error) => Self::failure(error),
        }
    }
}

/// Outcome of [`QueueClient::subscribe`](crate::QueueClient::subscribe) and
/// [`QueueClient::reply`](crate::QueueClient::reply).
#[derive(Debug)]
pub struct SubscribeResult {
    subscription_id: Option<SubscriptionId>,
    error: Option<Error>,
}

impl SubscribeResult {
    pub(crate) fn subscribed(id: SubscriptionId) -> Self {
        Self {
            subscription_id: Some(id),
            error: None,
        }
    }

    pub(crate) fn failed(error: Error) -> Self {
        Self {
            subscription_id: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Id to pass to `unsubscribe` / `stop_reply`. `None` on failure.
    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        self.subscription_id
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn into_result(self) -> Result<SubscriptionId, Error> {
        match (self.subscription_id, self.error) {
            (_, Some(error)) => Err(error),
            (Some(id), None) => Ok(id),
            (None, None) => Err(Error::processing()),
        }
    }
}
