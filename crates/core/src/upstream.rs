//! The link to the single physical dongle, via its own `rtl_tcp` (§3
//! "Upstream Link", §4.4).
//!
//! One task owns this connection for the whole process lifetime, looping
//! connect → stream → (error or forced reset) → delay → reconnect. Because
//! there is exactly one such task, the original's `rtl_tcp_resetting` flag
//! — whose job was to stop two reconnect attempts from racing — collapses
//! into a `Notify` the watchdog uses to interrupt whatever delay this task
//! is currently sleeping through.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::command::CommandFrame;
use crate::engine::{Chunk, Engine};

/// Bytes captured once per connection as the opaque dongle descriptor
/// (§6: magic + tuner type + gain count, all big-endian, 12 bytes total).
pub const DONGLE_DESCRIPTOR_LEN: usize = 12;

/// Upper bound on one upstream read (§4.4).
pub const UPSTREAM_READ_CHUNK: usize = 16_384;

/// Where raw upstream sample bytes go once received. §4.5: when DSP is
/// enabled the Upstream Link feeds its stdin exclusively and must not
/// broadcast directly.
pub enum SampleSink {
    Broadcast(Arc<Engine>),
    Dsp(mpsc::Sender<Chunk>),
}

impl SampleSink {
    async fn send(&self, chunk: Chunk) -> bool {
        match self {
            Self::Broadcast(engine) => {
                engine.broadcast(chunk);
                true
            }
            Self::Dsp(tx) => tx.send(chunk).await.is_ok(),
        }
    }
}

enum StreamOutcome {
    ConnectRefused,
    Io(io::Error),
    ForcedReset,
}

/// Drives the upstream connection until the process exits, reconnecting on
/// every failure (§4.4 "Failure semantics").
pub async fn run(engine: Arc<Engine>, sink: SampleSink) {
    let mut suppress_refused_log = false;
    loop {
        let outcome = connect_and_stream(&engine, &sink, &mut suppress_refused_log).await;
        engine.set_connected(false);

        let delay = match outcome {
            StreamOutcome::ConnectRefused => Duration::from_secs(engine.config.reconnect_interval),
            StreamOutcome::Io(err) => {
                tracing::error!(%err, "upstream connection lost, reconnecting");
                Duration::from_secs(2)
            }
            StreamOutcome::ForcedReset => Duration::ZERO,
        };

        if !delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = engine.reset_requested.notified() => {
                    tracing::info!("reconnect wait interrupted by forced reset");
                }
            }
        }
    }
}

fn is_connection_refused(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::ConnectionRefused
}

async fn connect_and_stream(
    engine: &Arc<Engine>,
    sink: &SampleSink,
    suppress_refused_log: &mut bool,
) -> StreamOutcome {
    let mut stream = match TcpStream::connect((engine.config.rtl_tcp_host.as_str(), engine.config.rtl_tcp_port)).await
    {
        Ok(stream) => stream,
        Err(err) if is_connection_refused(&err) => {
            if !*suppress_refused_log {
                tracing::error!(
                    host = %engine.config.rtl_tcp_host,
                    port = engine.config.rtl_tcp_port,
                    "upstream connection refused"
                );
                *suppress_refused_log = true;
            }
            return StreamOutcome::ConnectRefused;
        }
        Err(err) => return StreamOutcome::Io(err),
    };
    *suppress_refused_log = false;

    let mut descriptor = [0u8; DONGLE_DESCRIPTOR_LEN];
    if let Err(err) = stream.read_exact(&mut descriptor).await {
        return StreamOutcome::Io(err);
    }
    engine.set_dongle_identifier(Chunk::from(descriptor.to_vec()));
    engine.set_connected(true);
    tracing::info!(
        host = %engine.config.rtl_tcp_host,
        port = engine.config.rtl_tcp_port,
        "connected to upstream"
    );

    let (mut read_half, mut write_half) = stream.into_split();
    let mut commands_rx = engine.commands_rx.lock().await;

    // §4.4 "Connect policy": push an initial sample-rate frame so the
    // dongle starts producing at the configured rate. Written straight to
    // the socket rather than through `commands_tx`: that channel is bounded
    // on client traffic, and pending commands can fill it to capacity while
    // upstream is down, so routing the initial frame through it would block
    // this task on drain capacity before the drain loop below ever starts.
    let initial = CommandFrame {
        opcode: 2,
        param: engine.sample_rate(),
    }
    .to_bytes();
    if let Err(err) = write_half.write_all(&initial).await {
        return StreamOutcome::Io(err);
    }

    let mut read_buf = vec![0u8; UPSTREAM_READ_CHUNK];

    loop {
        tokio::select! {
            result = read_half.read(&mut read_buf) => {
                match result {
                    Ok(0) => {
                        return StreamOutcome::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "upstream closed"));
                    }
                    Ok(n) => {
                        engine.record_upstream_bytes(n);
                        if !sink.send(Chunk::from(read_buf[..n].to_vec())).await {
                            return StreamOutcome::Io(io::Error::other("sample sink closed"));
                        }
                    }
                    Err(err) => return StreamOutcome::Io(err),
                }
            }
            frame = commands_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(err) = write_half.write_all(&frame).await {
                            return StreamOutcome::Io(err);
                        }
                    }
                    None => return StreamOutcome::Io(io::Error::other("command queue closed")),
                }
            }
            () = engine.reset_requested.notified() => {
                return StreamOutcome::ForcedReset;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_refused_is_detected_by_kind() {
        let err = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(is_connection_refused(&err));
        let err = io::Error::from(io::ErrorKind::TimedOut);
        assert!(!is_connection_refused(&err));
    }
}
