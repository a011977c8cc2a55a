//! In-memory connection pair
//!
//! The recording proxy hands the bridge a pre-accepted client connection
//! instead of a TCP socket. `dual_pipe` builds the two halves of that
//! hand-off: a pair of bidirectional byte streams with crossed address
//! attributes. The server half is what the bridge runs its SSH server
//! handshake on; the client half is returned from `Server::dial()` and is
//! used by the proxy as if it were a socket to the real destination host.
//!
//! Closing (dropping) either half EOFs the peer's reads and fails its
//! writes, which the SSH layer above observes as a disconnect.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

use crate::addr::NetAddr;
use crate::defaults::PIPE_BUFFER_SIZE;

/// One endpoint of the in-memory pair.
pub struct PipeConn {
    stream: DuplexStream,
    local: NetAddr,
    peer: NetAddr,
}

impl PipeConn {
    /// Address this endpoint reports as its own.
    pub fn local_addr(&self) -> &NetAddr {
        &self.local
    }

    /// Address this endpoint reports for its peer.
    pub fn peer_addr(&self) -> &NetAddr {
        &self.peer
    }
}

impl AsyncRead for PipeConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for PipeConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

impl std::fmt::Debug for PipeConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeConn")
            .field("local", &self.local.to_string())
            .field("peer", &self.peer.to_string())
            .finish()
    }
}

/// Build the `(server, client)` pair for a bridge between `src` (the end
/// user's address) and `dst` (the target host's address).
///
/// The addresses are crossed: the server half speaks *as* the destination
/// host (local = `dst`, peer = `src`), while the client half speaks *to*
/// it (local = `src`, peer = `dst`). The client half's peer address is
/// what `Server::advertise_addr()` reports.
pub fn dual_pipe(src: NetAddr, dst: NetAddr) -> (PipeConn, PipeConn) {
    let (server_stream, client_stream) = tokio::io::duplex(PIPE_BUFFER_SIZE);
    let server = PipeConn {
        stream: server_stream,
        local: dst.clone(),
        peer: src.clone(),
    };
    let client = PipeConn {
        stream: client_stream,
        local: src,
        peer: dst,
    };
    (server, client)
}
