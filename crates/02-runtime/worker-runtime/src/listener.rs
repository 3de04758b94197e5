//! Listening for inbound connections on a socket address.
//!
//! A [`Listener`] opens a server interface on the first transport resource
//! whose memory domain can listen on the requested address. Connection
//! requests may arrive from async context, where user code must not run, so
//! each request with an accept callback is turned into a one-shot task on the
//! worker's progress queue and the callback fires from [`Worker::progress`].

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use crate::callbackq::CallbackQueue;
use crate::context::{
    ConnRequestHandler, IfaceParams, OpenMode, ServerIface, SockaddrAccess, CB_FLAG_ASYNC,
    MD_FLAG_SOCKADDR,
};
use crate::error::{WorkerError, WorkerResult};
use crate::worker::Worker;

/// `ListenerParams::sockaddr` is set.
pub const LISTENER_PARAM_FIELD_SOCK_ADDR: u64 = 1 << 0;
/// `ListenerParams::accept_handler` is set.
pub const LISTENER_PARAM_FIELD_CALLBACK: u64 = 1 << 1;

pub type AcceptArg = Arc<dyn Any + Send + Sync>;
pub type AcceptCallback = Arc<dyn Fn(EpHandle, &AcceptArg) + Send + Sync>;

/// Endpoint handed to the accept callback.
///
/// Placeholder handle; endpoint construction belongs to the caller's
/// transport layer, so the handle is never constructed here.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EpHandle {
    _private: (),
}

impl EpHandle {
    pub fn is_constructed(&self) -> bool {
        false
    }
}

#[derive(Clone)]
pub struct AcceptHandler {
    pub cb: Option<AcceptCallback>,
    pub arg: AcceptArg,
}

impl Default for AcceptHandler {
    fn default() -> Self {
        Self {
            cb: None,
            arg: Arc::new(()),
        }
    }
}

#[derive(Clone, Default)]
pub struct ListenerParams {
    /// `LISTENER_PARAM_FIELD_*` bits naming the fields that are set.
    pub field_mask: u64,
    pub sockaddr: Option<SocketAddr>,
    pub accept_handler: AcceptHandler,
}

impl ListenerParams {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            field_mask: LISTENER_PARAM_FIELD_SOCK_ADDR,
            sockaddr: Some(addr),
            accept_handler: AcceptHandler::default(),
        }
    }

    pub fn with_accept_handler<F>(mut self, cb: F, arg: AcceptArg) -> Self
    where
        F: Fn(EpHandle, &AcceptArg) + Send + Sync + 'static,
    {
        self.field_mask |= LISTENER_PARAM_FIELD_CALLBACK;
        self.accept_handler = AcceptHandler {
            cb: Some(Arc::new(cb)),
            arg,
        };
        self
    }
}

impl fmt::Debug for ListenerParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerParams")
            .field("field_mask", &self.field_mask)
            .field("sockaddr", &self.sockaddr)
            .field("has_callback", &self.accept_handler.cb.is_some())
            .finish()
    }
}

struct ListenerShared {
    addr: SocketAddr,
    md_name: String,
    cb: Option<AcceptCallback>,
    arg: AcceptArg,
}

struct AcceptCtx {
    listener: Weak<ListenerShared>,
    ep: EpHandle,
}

impl AcceptCtx {
    fn run(self) {
        let Some(listener) = self.listener.upgrade() else {
            tracing::debug!("listener closed before its accept callback ran");
            return;
        };
        tracing::trace!(addr = %listener.addr, ep = ?self.ep, "running accept callback");
        if let Some(cb) = &listener.cb {
            cb(self.ep, &listener.arg);
        }
    }
}

fn conn_request_handler(
    listener: Weak<ListenerShared>,
    callbackq: Arc<CallbackQueue>,
) -> ConnRequestHandler {
    Arc::new(move |priv_data: &[u8]| {
        let Some(shared) = listener.upgrade() else {
            return Ok(());
        };
        tracing::trace!(addr = %shared.addr, len = priv_data.len(), "listener got connection request");

        if shared.cb.is_none() {
            return Ok(());
        }

        let accept = AcceptCtx {
            listener: Arc::downgrade(&shared),
            ep: EpHandle::default(),
        };
        callbackq
            .register_oneshot(move || accept.run())
            .inspect_err(|_| tracing::error!("failed to allocate listener accept context"))
    })
}

/// Accepts connections on a socket address through one server interface.
pub struct Listener {
    shared: Arc<ListenerShared>,
    wiface: Box<dyn ServerIface>,
}

impl Listener {
    /// Starts listening on `params.sockaddr` with the first capable resource.
    pub fn open(worker: &Worker, params: ListenerParams) -> WorkerResult<Listener> {
        let _cs = worker.enter_cs();
        let _blocked = worker.async_ctx().block();

        if params.field_mask & LISTENER_PARAM_FIELD_SOCK_ADDR == 0 {
            tracing::error!("missing sockaddr for listener");
            return Err(WorkerError::InvalidParam("missing sockaddr for listener"));
        }
        let Some(addr) = params.sockaddr else {
            tracing::error!("listener sockaddr must not be null");
            return Err(WorkerError::InvalidParam("listener sockaddr must not be null"));
        };

        for resource in worker.context().resources() {
            if resource.md.flags() & MD_FLAG_SOCKADDR == 0
                || !resource
                    .md
                    .is_sockaddr_accessible(&addr, SockaddrAccess::Local)
            {
                continue;
            }

            let cb = if params.field_mask & LISTENER_PARAM_FIELD_CALLBACK != 0 {
                let Some(cb) = params.accept_handler.cb.clone() else {
                    tracing::error!("listener accept callback must not be null");
                    return Err(WorkerError::InvalidParam(
                        "listener accept callback must not be null",
                    ));
                };
                Some(cb)
            } else {
                None
            };

            let shared = Arc::new(ListenerShared {
                addr,
                md_name: resource.md.name().to_owned(),
                cb,
                arg: Arc::clone(&params.accept_handler.arg),
            });
            let iface_params = IfaceParams {
                open_mode: OpenMode::SockaddrServer {
                    listen_sockaddr: addr,
                    conn_request: conn_request_handler(
                        Arc::downgrade(&shared),
                        Arc::clone(worker.callbackq()),
                    ),
                    cb_flags: CB_FLAG_ASYNC,
                },
                async_ctx: Arc::clone(worker.async_ctx()),
            };
            let wiface = resource.transport.open_server(iface_params)?;

            tracing::trace!(%addr, md = %shared.md_name, "listener accepting connections");
            return Ok(Listener { shared, wiface });
        }

        tracing::error!("none of the available transports can listen for connections on {addr}");
        Err(WorkerError::InvalidAddr { addr })
    }

    /// Stops listening. Accept tasks still queued for this listener are
    /// skipped when the worker runs them.
    pub fn close(self, worker: &Worker) {
        let _cs = worker.enter_cs();
        let _blocked = worker.async_ctx().block();
        tracing::trace!(addr = %self.shared.addr, "destroying listener");
        let Listener { shared, wiface } = self;
        drop(wiface);
        drop(shared);
    }

    /// Address passed at open.
    pub fn sockaddr(&self) -> SocketAddr {
        self.shared.addr
    }

    /// Address the interface reports it listens on.
    pub fn listen_addr(&self) -> SocketAddr {
        self.wiface.listen_addr()
    }

    /// Memory domain the listener was opened on.
    pub fn md_name(&self) -> &str {
        &self.shared.md_name
    }

    pub fn has_accept_callback(&self) -> bool {
        self.shared.cb.is_some()
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("addr", &self.shared.addr)
            .field("md", &self.shared.md_name)
            .field("has_callback", &self.shared.cb.is_some())
            .finish()
    }
}
