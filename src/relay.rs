use std::io;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::buffer_pool::lease_buffer;
use crate::sniffer::Direction;
use crate::state::{ChaosSettings, HavocState};

/// Bytes and chunks seen by one relay direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub forwarded_bytes: u64,
    pub forwarded_chunks: u64,
    pub dropped_bytes: u64,
    pub dropped_chunks: u64,
}

/// Build the random source for one relay direction.
///
/// With a seed every (connection, direction) pair gets its own
/// reproducible stream; without one the OS provides entropy.
pub fn direction_rng(seed: Option<u64>, conn_id: u64, direction: Direction) -> StdRng {
    match seed {
        Some(seed) => {
            let salt = match direction {
                Direction::Request => 0xA5A5_A5A5_A5A5_A5A5,
                Direction::Response => 0x5A5A_5A5A_5A5A_5A5A,
            };
            StdRng::seed_from_u64(seed ^ conn_id.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ salt)
        }
        None => StdRng::from_os_rng(),
    }
}

/// What to do with a chunk under the given settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Drop,
    Forward(Duration),
}

fn decide<R: Rng>(chaos: &ChaosSettings, rng: &mut R) -> Verdict {
    if chaos.drop_rate > 0.0 && rng.random::<f64>() < chaos.drop_rate {
        return Verdict::Drop;
    }

    let mut delay = chaos.latency;
    if !chaos.jitter.is_zero() {
        delay += chaos.jitter.mul_f64(rng.random::<f64>());
    }
    Verdict::Forward(delay)
}

/// Copy `src` into `dst` one chunk at a time, applying the chaos settings
/// that are current when each chunk arrives.
///
/// Dropped chunks are discarded silently. Returns the stats on clean
/// end-of-stream; any read or write error ends the relay with that error.
/// Either way the write side of `dst` is shut down before returning so the
/// peer sees the close.
pub async fn relay<R, W, G>(
    state: &HavocState,
    src: &mut R,
    dst: &mut W,
    rng: &mut G,
) -> io::Result<RelayStats>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    G: Rng,
{
    let mut stats = RelayStats::default();
    let result = pump(state, src, dst, rng, &mut stats).await;

    if let Err(e) = dst.shutdown().await {
        debug!("shutdown of relay destination failed: {}", e);
    }

    result.map(|()| stats)
}

async fn pump<R, W, G>(
    state: &HavocState,
    src: &mut R,
    dst: &mut W,
    rng: &mut G,
    stats: &mut RelayStats,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    G: Rng,
{
    let mut buf = lease_buffer();

    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }

        // Re-read settings per chunk so live changes apply mid-connection
        let chaos = state.chaos();
        match decide(&chaos, rng) {
            Verdict::Drop => {
                stats.dropped_bytes += n as u64;
                stats.dropped_chunks += 1;
                state.traffic().add_dropped(n as u64);
                continue;
            }
            Verdict::Forward(delay) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }

        dst.write_all(&buf[..n]).await?;
        stats.forwarded_bytes += n as u64;
        stats.forwarded_chunks += 1;
        state.traffic().add_forwarded(n as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sniffer::Sniffer;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncWriteExt, ReadBuf};
    use tokio::time::Instant;

    /// Hands out one byte per read so every byte is its own chunk
    struct OneByteReader {
        data: Vec<u8>,
        pos: usize,
    }

    impl AsyncRead for OneByteReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.pos < self.data.len() {
                let byte = self.data[self.pos];
                buf.put_slice(&[byte]);
                self.pos += 1;
            }
            Poll::Ready(Ok(()))
        }
    }

    struct ResetReader;

    impl AsyncRead for ResetReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::ConnectionReset)))
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_forwards_everything_without_chaos() {
        let state = HavocState::new();
        let input = payload(200_000);
        let mut src = &input[..];
        let mut dst = Vec::new();
        let mut rng = direction_rng(Some(1), 1, Direction::Request);

        let started = std::time::Instant::now();
        let stats = relay(&state, &mut src, &mut dst, &mut rng).await.unwrap();

        assert_eq!(dst, input);
        assert_eq!(stats.forwarded_bytes, input.len() as u64);
        assert_eq!(stats.dropped_chunks, 0);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_full_drop_rate_forwards_nothing() {
        let state = HavocState::new();
        state.set_drop_rate(1.0);
        let input = payload(100_000);
        let mut src = &input[..];
        let mut dst = Vec::new();
        let mut rng = direction_rng(None, 1, Direction::Request);

        let stats = relay(&state, &mut src, &mut dst, &mut rng).await.unwrap();

        assert!(dst.is_empty());
        assert_eq!(stats.forwarded_bytes, 0);
        assert_eq!(stats.dropped_bytes, input.len() as u64);
        assert!(stats.dropped_chunks >= 1);
        assert_eq!(state.traffic().snapshot().dropped_bytes, input.len() as u64);
    }

    #[tokio::test]
    async fn test_partial_drop_keeps_chunk_order() {
        let state = HavocState::new();
        state.set_drop_rate(0.5);

        let mut src = OneByteReader {
            data: (0..200u8).collect(),
            pos: 0,
        };
        let mut dst = Vec::new();
        let mut rng = direction_rng(Some(7), 3, Direction::Response);

        let stats = relay(&state, &mut src, &mut dst, &mut rng).await.unwrap();

        assert_eq!(stats.forwarded_chunks + stats.dropped_chunks, 200);
        assert!(stats.dropped_chunks > 50);
        assert!(stats.forwarded_chunks > 50);
        assert_eq!(dst.len() as u64, stats.forwarded_bytes);
        assert!(dst.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_read_error_ends_relay_and_closes_destination() {
        let state = HavocState::new();
        let (out_writer, mut out_reader) = tokio::io::duplex(64);
        let mut dst = out_writer;
        let mut rng = direction_rng(Some(1), 1, Direction::Request);

        let err = relay(&state, &mut ResetReader, &mut dst, &mut rng)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);

        // The destination was shut down, so its reader sees EOF
        let mut out = Vec::new();
        out_reader.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_delays_each_chunk() {
        let state = HavocState::new();
        let latency = Duration::from_millis(250);
        state.set_latency(latency);

        let mut src = OneByteReader {
            data: b"abc".to_vec(),
            pos: 0,
        };
        let mut dst = Vec::new();
        let mut rng = direction_rng(Some(1), 1, Direction::Request);

        let started = Instant::now();
        let stats = relay(&state, &mut src, &mut dst, &mut rng).await.unwrap();

        assert_eq!(dst, b"abc");
        assert_eq!(stats.forwarded_chunks, 3);
        assert!(started.elapsed() >= latency * 3);
        assert!(started.elapsed() < latency * 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settings_change_mid_stream() {
        let state = std::sync::Arc::new(HavocState::new());
        let (mut writer, reader) = tokio::io::duplex(1024);
        let (out_writer, mut out_reader) = tokio::io::duplex(1024);

        let relay_state = std::sync::Arc::clone(&state);
        let task = tokio::spawn(async move {
            let mut src = reader;
            let mut dst = out_writer;
            let mut rng = direction_rng(Some(9), 1, Direction::Request);
            relay(&relay_state, &mut src, &mut dst, &mut rng).await
        });

        let mut byte = [0u8; 1];

        writer.write_all(b"a").await.unwrap();
        let started = Instant::now();
        out_reader.read_exact(&mut byte).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(10));

        state.set_latency(Duration::from_secs(2));
        writer.write_all(b"b").await.unwrap();
        let started = Instant::now();
        out_reader.read_exact(&mut byte).await.unwrap();
        assert_eq!(&byte, b"b");
        assert!(started.elapsed() >= Duration::from_secs(2));

        drop(writer);
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.forwarded_bytes, 2);
    }

    #[test]
    fn test_decide_without_chaos_forwards_immediately() {
        let mut rng = direction_rng(None, 1, Direction::Request);
        assert_eq!(
            decide(&ChaosSettings::default(), &mut rng),
            Verdict::Forward(Duration::ZERO)
        );
    }

    #[test]
    fn test_decide_jitter_is_bounded() {
        let chaos = ChaosSettings {
            latency: Duration::from_millis(100),
            jitter: Duration::from_millis(50),
            drop_rate: 0.0,
        };
        let mut rng = direction_rng(Some(42), 1, Direction::Request);
        for _ in 0..1_000 {
            match decide(&chaos, &mut rng) {
                Verdict::Forward(delay) => {
                    assert!(delay >= Duration::from_millis(100));
                    assert!(delay <= Duration::from_millis(150));
                }
                Verdict::Drop => panic!("nothing should be dropped"),
            }
        }
    }

    #[test]
    fn test_seeded_rng_is_reproducible() {
        let chaos = ChaosSettings {
            latency: Duration::ZERO,
            jitter: Duration::from_millis(10),
            drop_rate: 0.3,
        };
        let run = |seed| {
            let mut rng = direction_rng(Some(seed), 5, Direction::Response);
            (0..64).map(|_| decide(&chaos, &mut rng)).collect::<Vec<_>>()
        };
        assert_eq!(run(11), run(11));
        assert_ne!(run(11), run(12));
    }

    #[tokio::test]
    async fn test_round_trip_through_sniffer() {
        let state = HavocState::new();
        let mut input = b"GET /round/trip HTTP/1.1\r\nHost: x\r\n\r\n".to_vec();
        input.extend(payload(100_000));

        let mut src = Sniffer::new(&input[..], Direction::Request);
        let (out_writer, mut out_reader) = tokio::io::duplex(4096);
        let mut dst = Sniffer::new(out_writer, Direction::Response);
        let mut rng = direction_rng(Some(3), 1, Direction::Request);

        let reader = tokio::spawn(async move {
            let mut out = Vec::new();
            out_reader.read_to_end(&mut out).await.unwrap();
            out
        });

        relay(&state, &mut src, &mut dst, &mut rng).await.unwrap();
        drop(dst);
        let out = reader.await.unwrap();

        assert_eq!(out, input);
        assert_eq!(src.result().method.as_deref(), Some("GET"));
        assert_eq!(src.result().path.as_deref(), Some("/round/trip"));
    }
}
