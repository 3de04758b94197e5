//! Transport resources a worker can open interfaces on.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::async_ctx::AsyncContext;
use crate::error::WorkerResult;

/// The memory domain can resolve socket addresses.
pub const MD_FLAG_SOCKADDR: u64 = 1 << 0;

/// Connection-request callbacks may run from async context.
pub const CB_FLAG_ASYNC: u32 = 1 << 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SockaddrAccess {
    /// The address can be listened on from this host.
    Local,
    /// The address can be connected to from this host.
    Remote,
}

pub trait MemoryDomain: Send + Sync {
    fn name(&self) -> &str;

    fn flags(&self) -> u64;

    fn is_sockaddr_accessible(&self, addr: &SocketAddr, mode: SockaddrAccess) -> bool;
}

/// Invoked by a server interface for each inbound connection request, with
/// the peer's private data.
pub type ConnRequestHandler = Arc<dyn Fn(&[u8]) -> WorkerResult<()> + Send + Sync>;

pub enum OpenMode {
    SockaddrServer {
        listen_sockaddr: SocketAddr,
        conn_request: ConnRequestHandler,
        cb_flags: u32,
    },
}

pub struct IfaceParams {
    pub open_mode: OpenMode,
    /// Context through which `CB_FLAG_ASYNC` callbacks are delivered.
    pub async_ctx: Arc<AsyncContext>,
}

/// An interface opened in server mode. Dropping it stops listening.
pub trait ServerIface: Send {
    fn listen_addr(&self) -> SocketAddr;
}

pub trait SockaddrTransport: Send + Sync {
    fn name(&self) -> &str;

    fn open_server(&self, params: IfaceParams) -> WorkerResult<Box<dyn ServerIface>>;
}

/// One transport on one memory domain.
#[derive(Clone)]
pub struct TlResource {
    pub md: Arc<dyn MemoryDomain>,
    pub transport: Arc<dyn SockaddrTransport>,
}

impl fmt::Debug for TlResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlResource")
            .field("md", &self.md.name())
            .field("transport", &self.transport.name())
            .finish()
    }
}

/// Read-only table of transport resources, in priority order.
#[derive(Clone, Debug, Default)]
pub struct Context {
    resources: Vec<TlResource>,
}

impl Context {
    pub fn new(resources: Vec<TlResource>) -> Self {
        Self { resources }
    }

    pub fn resources(&self) -> &[TlResource] {
        &self.resources
    }
}
