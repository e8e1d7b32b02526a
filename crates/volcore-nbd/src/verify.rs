//! Export verification: a partial NBD client handshake against the
//! loopback listener. The goal isn't to fetch data, only to prove the
//! server accepts a negotiation naming this export — "negotiation
//! succeeded, device-target refused" already counts as success per the
//! export-manager contract.
//!
//! Reuses the wire constants the server side negotiates against
//! (`NBD_MAGIC`, `NBD_IHAVEOPT`, `NBD_OPT_GO`, `NBD_REP_*`), here from the
//! client's perspective.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{NbdError, NbdResult};

const NBD_MAGIC: u64 = 0x4e42_444d_4147_4943;
const NBD_IHAVEOPT: u64 = 0x4948_4156_454f_5054;
const NBD_OPTION_REPLY_MAGIC: u64 = 0x0003_e889_0455_65a9;

const NBD_FLAG_FIXED_NEWSTYLE: u16 = 0x0001;
const NBD_FLAG_NO_ZEROES: u16 = 0x0002;

const NBD_OPT_GO: u32 = 7;

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_secs(2);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

async fn negotiate_once(port: u16, export_name: &str) -> std::io::Result<()> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;

    let magic = stream.read_u64().await?;
    let ihaveopt = stream.read_u64().await?;
    if magic != NBD_MAGIC || ihaveopt != NBD_IHAVEOPT {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "bad server preamble"));
    }
    let _handshake_flags = stream.read_u16().await?;

    stream
        .write_u32(u32::from(NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES))
        .await?;

    let name_bytes = export_name.as_bytes();
    stream.write_u64(NBD_IHAVEOPT).await?;
    stream.write_u32(NBD_OPT_GO).await?;
    stream.write_u32(4 + name_bytes.len() as u32 + 2).await?;
    stream.write_u32(name_bytes.len() as u32).await?;
    stream.write_all(name_bytes).await?;
    stream.write_u16(0).await?; // no information requests
    stream.flush().await?;

    let reply_magic = stream.read_u64().await?;
    if reply_magic != NBD_OPTION_REPLY_MAGIC {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "bad reply magic"));
    }
    let _option = stream.read_u32().await?;
    let _reply_type = stream.read_u32().await?;
    let length = stream.read_u32().await?;
    let mut discard = vec![0u8; length as usize];
    stream.read_exact(&mut discard).await?;

    // Any well-formed reply — ack, info, or an error rejecting the
    // export — proves the server negotiated with us.
    Ok(())
}

/// Verify `export_name` is reachable on `port`, retrying up to 3 times
/// with a 2 s back-off per §4.5.
pub async fn verify(port: u16, export_name: &str) -> NbdResult<()> {
    let mut last_err = None;
    for attempt in 1..=MAX_ATTEMPTS {
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, negotiate_once(port, export_name)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => last_err = Some(e.to_string()),
            Err(_) => last_err = Some("handshake timed out".to_string()),
        }
        if attempt < MAX_ATTEMPTS {
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
    }
    Err(NbdError::VerificationFailed(
        last_err.unwrap_or_else(|| "unknown failure".to_string()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn fails_fast_when_nothing_is_listening() {
        let err = verify(1, "nonexistent").await.unwrap_err();
        assert!(matches!(err, NbdError::VerificationFailed(_)));
    }

    #[tokio::test]
    async fn succeeds_against_a_minimal_fake_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_u64(NBD_MAGIC).await.unwrap();
            stream.write_u64(NBD_IHAVEOPT).await.unwrap();
            stream.write_u16(1).await.unwrap();
            let _client_flags = stream.read_u32().await.unwrap();
            let _opt_magic = stream.read_u64().await.unwrap();
            let _opt = stream.read_u32().await.unwrap();
            let len = stream.read_u32().await.unwrap();
            let mut buf = vec![0u8; len as usize];
            stream.read_exact(&mut buf).await.unwrap();

            stream.write_u64(NBD_OPTION_REPLY_MAGIC).await.unwrap();
            stream.write_u32(7).await.unwrap();
            stream.write_u32(1).await.unwrap(); // NBD_REP_ACK
            stream.write_u32(0).await.unwrap();
        });

        verify(port, "test-export").await.unwrap();
    }
}
