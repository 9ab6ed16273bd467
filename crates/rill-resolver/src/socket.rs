//! Socket construction helpers.

use crate::QueryContext;
use socket2::{Domain, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tracing::debug;

/// Callback that accounts a query socket to the application it serves.
/// Provided by the host; the resolver itself has no traffic accounting.
pub trait SocketTagger: Send + Sync + 'static {
    /// Tags a freshly created, not yet connected socket.
    fn tag_socket(&self, socket: &Socket, uid: u32);
}

/// Tagger that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTagger;

impl SocketTagger for NoopTagger {
    fn tag_socket(&self, _socket: &Socket, _uid: u32) {}
}

/// Creates a tagged, marked socket of the given type for talking to
/// `server`.
pub(crate) fn new_socket(
    server: &SocketAddr,
    kind: Type,
    ctx: &QueryContext,
    tagger: &dyn SocketTagger,
) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(*server), kind, None)?;
    socket.set_cloexec(true)?;
    tagger.tag_socket(&socket, ctx.uid);
    set_mark(&socket, ctx.mark)?;
    Ok(socket)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_mark(socket: &Socket, mark: u32) -> io::Result<()> {
    if mark != 0 {
        socket.set_mark(mark)?;
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_mark(_socket: &Socket, _mark: u32) -> io::Result<()> {
    Ok(())
}

/// Binds to a random source port in 1025..=65534, falling back to an
/// ephemeral port when ten attempts all collide.
pub(crate) fn random_bind(socket: &Socket, server: &SocketAddr) -> io::Result<()> {
    use rand::Rng;

    let any: IpAddr = match server {
        SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };

    let mut rng = rand::thread_rng();
    for _ in 0..10 {
        let port = rng.gen_range(1025..65535);
        if socket.bind(&SocketAddr::new(any, port).into()).is_ok() {
            return Ok(());
        }
    }

    // Ten collisions means the port table is busy; let the system pick.
    debug!("random bind kept colliding, using an ephemeral port");
    socket.bind(&SocketAddr::new(any, 0).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bind_lands_in_range() {
        let server: SocketAddr = "127.0.0.1:53".parse().unwrap();
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, None).unwrap();
        random_bind(&socket, &server).unwrap();

        let local: SocketAddr = socket.local_addr().unwrap().as_socket().unwrap();
        assert!(local.port() >= 1025);
    }
}
