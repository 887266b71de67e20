// Copyright 2024, The Cluster Messaging Authors
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met: see LICENSE.

//! The advertised-address segment written immediately after the magic + packed header preamble:
//! the connecting node's own reachable endpoint, so the accepting side learns where to route
//! replies instead of the connection's ephemeral source port.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FrameError;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

/// Writes `addr` as a one-byte family tag, the raw IP bytes, then a big-endian port.
pub async fn write_advertised_addr<W: AsyncWrite + Unpin>(writer: &mut W, addr: SocketAddr) -> Result<(), FrameError> {
    match addr.ip() {
        IpAddr::V4(ip) => {
            writer.write_u8(FAMILY_V4).await?;
            writer.write_all(&ip.octets()).await?;
        },
        IpAddr::V6(ip) => {
            writer.write_u8(FAMILY_V6).await?;
            writer.write_all(&ip.octets()).await?;
        },
    }
    writer.write_u16(addr.port()).await?;
    Ok(())
}

pub async fn read_advertised_addr<R: AsyncRead + Unpin>(reader: &mut R) -> Result<SocketAddr, FrameError> {
    let family = reader.read_u8().await.map_err(|_| FrameError::Truncated("address family"))?;
    let ip = match family {
        FAMILY_V4 => {
            let mut buf = [0u8; 4];
            reader.read_exact(&mut buf).await.map_err(|_| FrameError::Truncated("ipv4 address"))?;
            IpAddr::V4(Ipv4Addr::from(buf))
        },
        FAMILY_V6 => {
            let mut buf = [0u8; 16];
            reader.read_exact(&mut buf).await.map_err(|_| FrameError::Truncated("ipv6 address"))?;
            IpAddr::V6(Ipv6Addr::from(buf))
        },
        other => return Err(FrameError::BadAddressFamily(other)),
    };
    let port = reader.read_u16().await.map_err(|_| FrameError::Truncated("advertised port"))?;
    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[tokio::test]
    async fn v4_address_round_trips() {
        let addr: SocketAddr = "10.0.0.5:7000".parse().unwrap();
        let mut buf = Vec::new();
        write_advertised_addr(&mut buf, addr).await.unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_advertised_addr(&mut cursor).await.unwrap(), addr);
    }

    #[tokio::test]
    async fn v6_address_round_trips() {
        let addr: SocketAddr = "[::1]:7000".parse().unwrap();
        let mut buf = Vec::new();
        write_advertised_addr(&mut buf, addr).await.unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_advertised_addr(&mut cursor).await.unwrap(), addr);
    }

    #[tokio::test]
    async fn unknown_family_is_rejected() {
        let buf = vec![9u8];
        let mut cursor = Cursor::new(buf);
        let err = read_advertised_addr(&mut cursor).await.unwrap_err();
        assert!(matches!(err, FrameError::BadAddressFamily(9)));
    }
}
