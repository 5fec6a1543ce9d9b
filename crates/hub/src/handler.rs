//! Handler trait for extending the hub's remote-call surface.
//!
//! The server routes `register`/`deregister` to the registry itself and
//! hands every other invocation to the handler. Default implementations
//! reject unknown methods, so embedders only override what they add.

use std::future::Future;
use std::pin::Pin;

use groupcast_protocol::constants::WS_ERR_CODE_NOT_IMPLEMENTED;
use groupcast_protocol::envelope::Message;
use groupcast_protocol::messages::InvokeRequest;
use tracing::warn;

use crate::connection::SessionHandle;

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Trait for handling hub-side work beyond the built-in registry methods.
pub trait Handler: Send + Sync + 'static {
    /// Called for invoke requests the hub does not handle itself. The
    /// handler replies through the session's sender.
    fn on_invoke(
        &self,
        session: SessionHandle,
        msg: Message,
        req: InvokeRequest,
    ) -> HandlerFuture<'_> {
        Box::pin(async move {
            warn!(method = %req.method, session = %session.id, "unknown method");
            let _ = session.sender.send_error(
                &msg,
                WS_ERR_CODE_NOT_IMPLEMENTED,
                &format!("unknown method {:?}", req.method),
            );
        })
    }

    /// Called when a session's transport comes up, before any invoke.
    fn on_session_opened(&self, session: SessionHandle) -> HandlerFuture<'_> {
        let _ = session;
        Box::pin(async {})
    }

    /// Called after a session's transport ended and the registry has been
    /// reconciled.
    fn on_session_closed(&self, session_id: String) -> HandlerFuture<'_> {
        let _ = session_id;
        Box::pin(async {})
    }
}

/// Handler with no extension methods: every unknown invoke is rejected.
pub struct DefaultHandler;

impl Handler for DefaultHandler {}
