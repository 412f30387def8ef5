use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::time::{SystemTime, UNIX_EPOCH};
use anyhow::anyhow;

use bytes::{Buf, BufMut};

/// Identity of a grid member as exchanged during the connection handshake.
///
/// A member that leaves the grid can never rejoin under the same identity - the
///  membership layer tracks departures terminally. To allow a restarted process to
///  rejoin from the same network address, a u32 (initialized with the seconds since
///  epoch) disambiguates incarnations.
///
/// NB: The unique part is not a security feature; it only needs to differ between
///      incarnations of the same address, and seconds-since-epoch is a convenient way
///      of ensuring that in typical environments.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct MemberId {
    pub unique: u32,
    pub socket_addr: SocketAddr,
}
impl Hash for MemberId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.unique.hash(state);
        match self.socket_addr {
            SocketAddr::V4(s) => s.ip().to_bits().hash(state),
            SocketAddr::V6(s) => s.ip().to_bits().hash(state),
        };
        self.socket_addr.port().hash(state);
    }
}

impl Debug for MemberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}@{}]", self.socket_addr, self.unique)
    }
}

impl MemberId {
    pub fn new(unique: u32, socket_addr: SocketAddr) -> MemberId {
        MemberId { unique, socket_addr }
    }

    #[cfg(test)]
    pub fn localhost(unique: u32) -> MemberId {
        let addr: SocketAddr = std::str::FromStr::from_str("127.0.0.1:16385").unwrap();

        MemberId {
            unique,
            socket_addr: addr,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.unique);
        match &self.socket_addr {
            SocketAddr::V4(data) => {
                buf.put_u8(4);
                buf.put_u32(data.ip().to_bits());
                buf.put_u16(data.port());
            }
            SocketAddr::V6(data) => {
                buf.put_u8(6);
                buf.put_u128(data.ip().to_bits());
                buf.put_u16(data.port());
            }
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<MemberId> {
        let unique = buf.try_get_u32()?;

        let addr = match buf.try_get_u8()? {
            4 => {
                let ip = buf.try_get_u32()?;
                let port = buf.try_get_u16()?;
                SocketAddr::V4(SocketAddrV4::new(ip.into(), port))
            }
            6 => {
                let ip = buf.try_get_u128()?;
                let port = buf.try_get_u16()?;
                SocketAddr::V6(SocketAddrV6::new(ip.into(), port, 0, 0))
            }
            n => {
                return Err(anyhow!("invalid socket address discriminator: {}", n));
            }
        };
        Ok(MemberId {
            unique,
            socket_addr: addr,
        })
    }
}

impl From<SocketAddr> for MemberId {
    fn from(addr: SocketAddr) -> Self {
        let unique = SystemTime::now().duration_since(UNIX_EPOCH)
            .expect("system time is before UNIX epoch")
            .as_secs() as u32;

        MemberId {
            unique,
            socket_addr: addr,
        }
    }
}
