// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::AppError::InvalidAddress;
use crate::AppResult;

const AF_INET: u16 = 2;
pub const SOCKADDR_LEN: usize = 16;

/// A peer address as carried in a Hello reply: the 16 byte `sockaddr_in` layout.
///
/// family (host order) | port (network order) | 4 address bytes | 8 zero bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockAddrBytes(pub [u8; SOCKADDR_LEN]);

impl SockAddrBytes {
    pub const LEN: usize = SOCKADDR_LEN;

    pub fn from_socket_addr(addr: &SocketAddr) -> AppResult<SockAddrBytes> {
        let SocketAddr::V4(v4) = addr else {
            return Err(InvalidAddress(format!(
                "{} does not fit a 16 byte sockaddr",
                addr
            )));
        };
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u16_ne(AF_INET);
        buf.put_u16(v4.port());
        buf.put_slice(&v4.ip().octets());
        buf.put_bytes(0, 8);
        let mut raw = [0u8; Self::LEN];
        raw.copy_from_slice(&buf);
        Ok(SockAddrBytes(raw))
    }

    pub fn parse(payload: &[u8]) -> AppResult<SockAddrBytes> {
        if payload.len() < Self::LEN {
            return Err(InvalidAddress(format!(
                "sockaddr of {} bytes, expected {}",
                payload.len(),
                Self::LEN
            )));
        }
        let mut raw = [0u8; Self::LEN];
        raw.copy_from_slice(&payload[..Self::LEN]);
        Ok(SockAddrBytes(raw))
    }

    pub fn to_socket_addr(&self) -> AppResult<SocketAddr> {
        let mut buf = &self.0[..];
        let family = buf.get_u16_ne();
        if family != AF_INET {
            return Err(InvalidAddress(format!("unknown address family {}", family)));
        }
        let port = buf.get_u16();
        let ip = Ipv4Addr::new(buf.get_u8(), buf.get_u8(), buf.get_u8(), buf.get_u8());
        Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() -> AppResult<()> {
        let addr: SocketAddr = "192.168.1.20:8000".parse().unwrap();
        let raw = SockAddrBytes::from_socket_addr(&addr)?;
        assert_eq!(&raw.0[..2], &AF_INET.to_ne_bytes());
        assert_eq!(&raw.0[2..4], &8000u16.to_be_bytes());
        assert_eq!(&raw.0[4..8], &[192, 168, 1, 20]);
        assert_eq!(&raw.0[8..], &[0u8; 8]);
        assert_eq!(SockAddrBytes::parse(&raw.to_bytes())?.to_socket_addr()?, addr);
        Ok(())
    }

    #[test]
    fn test_rejects_ipv6_and_short_input() {
        let addr: SocketAddr = "[::1]:8000".parse().unwrap();
        assert!(SockAddrBytes::from_socket_addr(&addr).is_err());
        assert!(SockAddrBytes::parse(&[2, 0, 31]).is_err());
        assert!(SockAddrBytes([0u8; 16]).to_socket_addr().is_err());
    }
}
