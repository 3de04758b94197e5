//! Worker runtime: progress loop, deferred callbacks and listeners.
//!
//! * [`Worker`] – critical section, async context, one-shot progress queue
//!   and the progress engines it drives (FIFO interfaces among them).
//! * [`Listener`] – accepts connections on a socket address and defers the
//!   user's accept callback to [`Worker::progress`].
//! * [`Context`] – the transport resources a listener may open on.
//! * [`LoopbackTransport`] – in-process socket-address transport.

mod async_ctx;
mod callbackq;
mod config;
mod context;
mod error;
mod listener;
mod loopback;
mod worker;

pub use async_ctx::{AsyncBlockGuard, AsyncContext, AsyncEvent};
pub use callbackq::{CallbackQueue, OneShotTask};
pub use config::{ThreadMode, WorkerConfig};
pub use context::{
    ConnRequestHandler, Context, IfaceParams, MemoryDomain, OpenMode, ServerIface,
    SockaddrAccess, SockaddrTransport, TlResource, CB_FLAG_ASYNC, MD_FLAG_SOCKADDR,
};
pub use error::{WorkerError, WorkerResult};
pub use listener::{
    AcceptArg, AcceptCallback, AcceptHandler, EpHandle, Listener, ListenerParams,
    LISTENER_PARAM_FIELD_CALLBACK, LISTENER_PARAM_FIELD_SOCK_ADDR,
};
pub use loopback::{LoopbackMd, LoopbackTransport};
pub use worker::{CsGuard, ProgressEngine, Worker};
