use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    time::Duration,
};

/// Socket `trait` is the datagram transport a transfer runs over.
///
/// A receive that hits the read timeout must fail with
/// [`io::ErrorKind::WouldBlock`] or [`io::ErrorKind::TimedOut`]; sessions treat
/// both as an expired wait.
pub trait Socket: Send + 'static {
    /// Sends one datagram to `to`.
    fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<()>;
    /// Receives one datagram, returning its length and sender. Datagrams larger
    /// than `buf` are truncated.
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    /// Sets how long [`Socket::recv_from`] may block.
    fn set_read_timeout(&mut self, dur: Duration) -> io::Result<()>;
    /// Returns the local endpoint, the transfer ID seen by the peer.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Socket for UdpSocket {
    fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<()> {
        UdpSocket::send_to(self, buf, to)?;

        Ok(())
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf)
    }

    fn set_read_timeout(&mut self, dur: Duration) -> io::Result<()> {
        // a zero timeout is rejected by the OS
        UdpSocket::set_read_timeout(self, Some(dur.max(Duration::from_millis(1))))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

impl<T: Socket + ?Sized> Socket for Box<T> {
    fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<()> {
        (**self).send_to(buf, to)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        (**self).recv_from(buf)
    }

    fn set_read_timeout(&mut self, dur: Duration) -> io::Result<()> {
        (**self).set_read_timeout(dur)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }
}

/// Binds a fresh UDP socket on an OS-chosen port for talking to `peer`.
///
/// Without an explicit `local_ip` the unspecified address of the peer's
/// family is used.
pub fn bind_ephemeral(peer: SocketAddr, local_ip: Option<IpAddr>) -> io::Result<UdpSocket> {
    let ip = local_ip.unwrap_or(match peer {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    });
    UdpSocket::bind(SocketAddr::new(ip, 0))
}

#[cfg(test)]
pub(crate) use channel::ChannelSocket;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_pair() {
        let a_addr: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let b_addr: SocketAddr = "127.0.0.1:50001".parse().unwrap();
        let (a, mut b) = ChannelSocket::pair(a_addr, b_addr);

        a.send_to(&[0, 4, 0, 1], b_addr).unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = b.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0, 4, 0, 1]);
        assert_eq!(from, a_addr);

        b.set_read_timeout(Duration::from_millis(10)).unwrap();
        let err = b.recv_from(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_bind_ephemeral() {
        let peer: SocketAddr = "127.0.0.1:69".parse().unwrap();
        let socket = bind_ephemeral(peer, Some(IpAddr::V4(Ipv4Addr::LOCALHOST))).unwrap();
        let local = Socket::local_addr(&socket).unwrap();
        assert!(local.ip().is_loopback());
        assert_ne!(local.port(), 0);
    }
}
