use std::future::Future;

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::error::HandlerError;
use crate::protocol::canonical::ToolCall;

/// Executes completed tool calls on behalf of the assembler.
///
/// The assembler awaits each call before it consumes the next event, so at
/// most one invocation is ever in flight per stream and its result is applied
/// before any later event. `Ok(None)` leaves the invocation in the `call`
/// state; `Ok(Some(result))` moves it to `result`.
pub trait ToolCallHandler: Send + Sync {
    fn handle_tool_call<'a>(
        &'a self,
        call: &'a ToolCall,
    ) -> BoxFuture<'a, Result<Option<Value>, HandlerError>>;
}

/// Adapts an async closure into a [`ToolCallHandler`].
pub struct FnToolCallHandler<F> {
    f: F,
}

/// Wrap `f` as a tool-call handler.
pub fn handler_fn<F, Fut>(f: F) -> FnToolCallHandler<F>
where
    F: Fn(ToolCall) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<Value>, HandlerError>> + Send + 'static,
{
    FnToolCallHandler { f }
}

impl<F, Fut> ToolCallHandler for FnToolCallHandler<F>
where
    F: Fn(ToolCall) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<Value>, HandlerError>> + Send + 'static,
{
    fn handle_tool_call<'a>(
        &'a self,
        call: &'a ToolCall,
    ) -> BoxFuture<'a, Result<Option<Value>, HandlerError>> {
        Box::pin((self.f)(call.clone()))
    }
}
