//! Bidirectional byte relay between two streams

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Per-direction relay buffer (16KB).
const DIRECTION_BUFFER: usize = 16 * 1024;

/// Copy bytes in both directions until both directions have ended.
///
/// A direction ends on EOF or on the first read/write error; either
/// way the peer's write half is shut down so the far end observes the
/// close, while the opposite direction keeps flowing. Errors are not
/// surfaced: the caller only learns how many bytes moved each way.
///
/// Both directions are driven from a single task: at most one chunk
/// is in flight at a time, and a stalled writer pauses the relay
/// until it drains.
pub async fn splice<A, B>(a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let mut up_buf = vec![0u8; DIRECTION_BUFFER];
    let mut down_buf = vec![0u8; DIRECTION_BUFFER];
    let (mut up, mut down) = (0u64, 0u64);
    let mut uploading = true;
    let mut downloading = true;

    while uploading || downloading {
        tokio::select! {
            read = a_read.read(&mut up_buf), if uploading => {
                uploading = match read {
                    Ok(n) if n > 0 => {
                        let ok = forward(&mut b_write, &up_buf[..n]).await;
                        if ok {
                            up += n as u64;
                        }
                        ok
                    }
                    _ => false,
                };
                if !uploading {
                    let _ = b_write.shutdown().await;
                }
            }
            read = b_read.read(&mut down_buf), if downloading => {
                downloading = match read {
                    Ok(n) if n > 0 => {
                        let ok = forward(&mut a_write, &down_buf[..n]).await;
                        if ok {
                            down += n as u64;
                        }
                        ok
                    }
                    _ => false,
                };
                if !downloading {
                    let _ = a_write.shutdown().await;
                }
            }
        }
    }

    (up, down)
}

/// Push one chunk through, flushing so it leaves immediately.
async fn forward<W: AsyncWrite + Unpin>(writer: &mut W, chunk: &[u8]) -> bool {
    if writer.write_all(chunk).await.is_err() {
        return false;
    }
    writer.flush().await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_splice_both_directions() {
        let (client_a, mut far_a) = tokio::io::duplex(1024);
        let (client_b, mut far_b) = tokio::io::duplex(1024);

        let task = tokio::spawn(splice(client_a, client_b));

        far_a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        far_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        far_b.write_all(b"pong").await.unwrap();
        far_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(far_a);
        drop(far_b);
        let (up, down) = task.await.unwrap();
        assert_eq!(up, 4);
        assert_eq!(down, 4);
    }

    #[tokio::test]
    async fn test_one_sided_close_propagates() {
        let (client_a, mut far_a) = tokio::io::duplex(4096);
        let (client_b, mut far_b) = tokio::io::duplex(4096);

        let task = tokio::spawn(splice(client_a, client_b));

        far_a.write_all(&[7u8; 1000]).await.unwrap();
        drop(far_a);

        // The upload EOF shuts down the far side, so read_to_end
        // terminates.
        let mut got = Vec::new();
        far_b.read_to_end(&mut got).await.unwrap();
        assert_eq!(got.len(), 1000);
        drop(far_b);

        let (up, down) = task.await.unwrap();
        assert_eq!(up, 1000);
        assert_eq!(down, 0);
    }
}
