//! Signature callbacks for session open and membership changes.
//!
//! The session layer never interprets a signature; it forwards the three
//! fields to the server verbatim.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use imkit_core::{ErrorCode, ImError, ImResult};

use crate::protocol::SignedFields;

/// What is being signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAction {
    Open,
    Start,
    Invite,
    Kick,
}

impl fmt::Display for SignatureAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Start => write!(f, "start"),
            Self::Invite => write!(f, "invite"),
            Self::Kick => write!(f, "kick"),
        }
    }
}

/// Context handed to a [`SignatureFactory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRequest {
    pub client_id: String,
    pub conversation_id: Option<String>,
    pub member_ids: Vec<String>,
    pub action: SignatureAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub signature: String,
    pub timestamp: i64,
    pub nonce: String,
}

impl From<Signature> for SignedFields {
    fn from(s: Signature) -> Self {
        Self {
            signature: s.signature,
            timestamp: s.timestamp,
            nonce: s.nonce,
        }
    }
}

type SignFn = dyn Fn(SignatureRequest) -> BoxFuture<'static, ImResult<Signature>> + Send + Sync;

/// Caller-supplied signing callback, synchronous or async.
#[derive(Clone)]
pub struct SignatureFactory {
    sign: Arc<SignFn>,
}

impl SignatureFactory {
    /// Wrap an async signing function.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(SignatureRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ImResult<Signature>> + Send + 'static,
    {
        Self {
            sign: Arc::new(move |request| -> BoxFuture<'static, ImResult<Signature>> {
                Box::pin(f(request))
            }),
        }
    }

    /// Wrap a synchronous signing function.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&SignatureRequest) -> ImResult<Signature> + Send + Sync + 'static,
    {
        Self {
            sign: Arc::new(move |request| -> BoxFuture<'static, ImResult<Signature>> {
                let result = f(&request);
                Box::pin(async move { result })
            }),
        }
    }

    /// Run the callback. Failures without a code surface as `failure_code`.
    pub(crate) async fn sign(
        &self,
        request: SignatureRequest,
        failure_code: ErrorCode,
    ) -> ImResult<SignedFields> {
        let action = request.action;
        match (self.sign)(request).await {
            Ok(signature) => Ok(signature.into()),
            Err(err @ ImError::Code { .. }) => Err(err),
            Err(err) => {
                tracing::warn!(%action, error = %err, "Signature factory failed");
                Err(ImError::code(failure_code, err.to_string()))
            }
        }
    }
}

impl fmt::Debug for SignatureFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SignatureFactory")
    }
}
