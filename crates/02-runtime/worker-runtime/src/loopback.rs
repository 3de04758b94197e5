//! In-process socket-address transport.
//!
//! Servers register under their listen address; [`LoopbackTransport::connect`]
//! looks the address up and raises a connection request on the server,
//! through its async context when the server asked for async callbacks.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::async_ctx::AsyncContext;
use crate::context::{
    ConnRequestHandler, IfaceParams, MemoryDomain, OpenMode, ServerIface, SockaddrAccess,
    SockaddrTransport, CB_FLAG_ASYNC, MD_FLAG_SOCKADDR,
};
use crate::error::{WorkerError, WorkerResult};

/// Memory domain accepting loopback and wildcard addresses, or an explicit
/// set of IPs.
#[derive(Debug, Clone)]
pub struct LoopbackMd {
    name: String,
    allowed: Option<Vec<IpAddr>>,
}

impl LoopbackMd {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            allowed: None,
        }
    }

    pub fn with_allowed(name: impl Into<String>, allowed: Vec<IpAddr>) -> Self {
        Self {
            name: name.into(),
            allowed: Some(allowed),
        }
    }
}

impl MemoryDomain for LoopbackMd {
    fn name(&self) -> &str {
        &self.name
    }

    fn flags(&self) -> u64 {
        MD_FLAG_SOCKADDR
    }

    fn is_sockaddr_accessible(&self, addr: &SocketAddr, mode: SockaddrAccess) -> bool {
        let ip = addr.ip();
        match (&self.allowed, mode) {
            (Some(allowed), _) => allowed.contains(&ip),
            (None, SockaddrAccess::Local) => ip.is_loopback() || ip.is_unspecified(),
            (None, SockaddrAccess::Remote) => ip.is_loopback(),
        }
    }
}

#[derive(Clone)]
struct ServerEntry {
    conn_request: ConnRequestHandler,
    cb_flags: u32,
    async_ctx: Arc<AsyncContext>,
}

type ServerTable = Mutex<HashMap<SocketAddr, ServerEntry>>;

#[derive(Default)]
pub struct LoopbackTransport {
    servers: Arc<ServerTable>,
    opened: AtomicUsize,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises a connection request with `priv_data` on the server listening
    /// on `addr`.
    ///
    /// For async servers the request is handed to the server's async context
    /// and its outcome is only logged; otherwise the handler's result is
    /// returned.
    pub fn connect(&self, addr: &SocketAddr, priv_data: &[u8]) -> WorkerResult<()> {
        let entry = self
            .servers
            .lock()
            .get(addr)
            .cloned()
            .ok_or(WorkerError::InvalidAddr { addr: *addr })?;

        if entry.cb_flags & CB_FLAG_ASYNC == 0 {
            return (entry.conn_request)(priv_data);
        }

        let addr = *addr;
        let data = priv_data.to_vec();
        let conn_request = entry.conn_request;
        entry.async_ctx.deliver(move || {
            if let Err(err) = conn_request(&data) {
                tracing::error!(%addr, "connection request dropped: {err}");
            }
        });
        Ok(())
    }

    /// Number of server interfaces ever opened.
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }

    /// Number of servers currently listening.
    pub fn listening(&self) -> usize {
        self.servers.lock().len()
    }
}

impl SockaddrTransport for LoopbackTransport {
    fn name(&self) -> &str {
        "loopback"
    }

    fn open_server(&self, params: IfaceParams) -> WorkerResult<Box<dyn ServerIface>> {
        let OpenMode::SockaddrServer {
            listen_sockaddr,
            conn_request,
            cb_flags,
        } = params.open_mode;

        let mut servers = self.servers.lock();
        if servers.contains_key(&listen_sockaddr) {
            tracing::debug!(addr = %listen_sockaddr, "loopback address already in use");
            return Err(WorkerError::InvalidAddr {
                addr: listen_sockaddr,
            });
        }
        servers.insert(
            listen_sockaddr,
            ServerEntry {
                conn_request,
                cb_flags,
                async_ctx: params.async_ctx,
            },
        );
        self.opened.fetch_add(1, Ordering::Relaxed);

        Ok(Box::new(LoopbackServer {
            addr: listen_sockaddr,
            servers: Arc::downgrade(&self.servers),
        }))
    }
}

struct LoopbackServer {
    addr: SocketAddr,
    servers: Weak<ServerTable>,
}

impl ServerIface for LoopbackServer {
    fn listen_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for LoopbackServer {
    fn drop(&mut self) {
        if let Some(servers) = self.servers.upgrade() {
            servers.lock().remove(&self.addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn md_accessibility() {
        let md = LoopbackMd::new("lo");
        assert!(md.is_sockaddr_accessible(&addr("127.0.0.1:4000"), SockaddrAccess::Local));
        assert!(md.is_sockaddr_accessible(&addr("[::1]:4000"), SockaddrAccess::Local));
        assert!(md.is_sockaddr_accessible(&addr("0.0.0.0:4000"), SockaddrAccess::Local));
        assert!(!md.is_sockaddr_accessible(&addr("0.0.0.0:4000"), SockaddrAccess::Remote));
        assert!(!md.is_sockaddr_accessible(&addr("10.1.2.3:4000"), SockaddrAccess::Local));

        let md = LoopbackMd::with_allowed("lan", vec!["10.1.2.3".parse().unwrap()]);
        assert!(md.is_sockaddr_accessible(&addr("10.1.2.3:1"), SockaddrAccess::Local));
        assert!(!md.is_sockaddr_accessible(&addr("127.0.0.1:1"), SockaddrAccess::Local));
    }

    #[test]
    fn sync_server_gets_request_inline_and_unregisters_on_drop() {
        let transport = LoopbackTransport::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&hits);
        let server = transport
            .open_server(IfaceParams {
                open_mode: OpenMode::SockaddrServer {
                    listen_sockaddr: addr("127.0.0.1:5000"),
                    conn_request: Arc::new(move |data: &[u8]| {
                        sink.fetch_add(data.len(), Ordering::SeqCst);
                        Ok(())
                    }),
                    cb_flags: 0,
                },
                async_ctx: Arc::new(AsyncContext::new()),
            })
            .unwrap();

        transport.connect(&addr("127.0.0.1:5000"), b"abc").unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(transport.listening(), 1);

        drop(server);
        assert_eq!(transport.listening(), 0);
        let err = transport.connect(&addr("127.0.0.1:5000"), b"").unwrap_err();
        assert!(matches!(err, WorkerError::InvalidAddr { .. }));
    }
}
