//! Server-side operation table
//!
//! Maps an operation name to its handler. Dispatch always produces exactly one
//! [`RpcResponse`]: unknown operations, handler errors, panics and
//! cancellation all become a failure status.

use crate::error::{KvError, Result};
use crate::protocol::{RpcRequest, RpcResponse};
use crate::shutdown::CancelToken;
use crate::transport::BulkEndpoint;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::task::JoinError;

/// Per-call state handed to a handler
#[derive(Clone)]
pub struct CallContext {
    pub request_id: u64,
    /// The caller's registered regions
    pub peer: Arc<dyn BulkEndpoint>,
    pub cancel: CancelToken,
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

pub trait Handler: Send + Sync + 'static {
    fn call(&self, ctx: CallContext, request: RpcRequest) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(CallContext, RpcRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn call(&self, ctx: CallContext, request: RpcRequest) -> HandlerFuture {
        Box::pin((self)(ctx, request))
    }
}

#[derive(Default)]
pub struct OperationTable {
    routes: HashMap<String, Arc<dyn Handler>>,
}

impl OperationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`. Each name may be registered once.
    pub fn register_operation<F, Fut>(&mut self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(CallContext, RpcRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if self.routes.contains_key(name) {
            return Err(KvError::DuplicateOperation(name.to_string()));
        }
        self.routes.insert(name.to_string(), Arc::new(handler));
        tracing::debug!("Registered operation {:?}", name);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.routes.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run the handler for `request` to completion and produce its response.
    pub async fn dispatch(&self, ctx: CallContext, request: RpcRequest) -> RpcResponse {
        let request_id = ctx.request_id;
        let operation = request.operation.clone();
        let key = request.key.clone();

        let handler = match self.routes.get(&operation) {
            Some(handler) => Arc::clone(handler),
            None => {
                tracing::warn!("Unknown operation {:?}, request_id={}", operation, request_id);
                return RpcResponse::failed();
            }
        };

        tracing::debug!(
            "{} request: key={:?}, size={}, request_id={}",
            operation,
            key,
            request.size,
            request_id
        );

        let cancel = ctx.cancel.clone();
        let mut task = tokio::spawn(handler.call(ctx, request));

        let outcome = tokio::select! {
            joined = &mut task => match joined {
                Ok(result) => result,
                Err(e) => {
                    if e.is_panic() {
                        tracing::error!("{} handler panicked, request_id={}", operation, request_id);
                    }
                    Err(join_failure(e))
                }
            },
            _ = cancel.cancelled() => {
                task.abort();
                Err(KvError::Cancelled)
            }
        };

        match outcome {
            Ok(()) => {
                tracing::debug!("{} success: key={:?}, request_id={}", operation, key, request_id);
                RpcResponse::ok()
            }
            Err(e) => {
                tracing::warn!(
                    "{} failed: key={:?}, error={}, request_id={}",
                    operation,
                    key,
                    e,
                    request_id
                );
                RpcResponse::from_error(&e)
            }
        }
    }
}

fn join_failure(e: JoinError) -> KvError {
    if e.is_panic() {
        KvError::Handler("handler panicked".to_string())
    } else {
        KvError::Cancelled
    }
}
