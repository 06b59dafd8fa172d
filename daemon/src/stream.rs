//! Line-oriented forwarding of a child's stdout/stderr to its client.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, warn};

use crate::protocol::{ServerMessage, StreamKind};
use crate::state::ClientSender;

/// Drain both pipes concurrently until each hits end-of-stream.
///
/// Every line (newline included) is forwarded as a `stream` event in the
/// order it was read from its pipe. Stdout lines are also accumulated and the
/// concatenation is returned. A closed client does not stop draining, so the
/// child never blocks on a full pipe.
pub async fn drain_streams<O, E>(
    stdout: O,
    stderr: E,
    conversation_id: &str,
    sink: &ClientSender,
) -> String
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut captured = String::new();
    tokio::join!(
        drain_lines(stdout, StreamKind::Stdout, conversation_id, sink, Some(&mut captured)),
        drain_lines(stderr, StreamKind::Stderr, conversation_id, sink, None),
    );
    captured
}

async fn drain_lines<R>(
    reader: R,
    stream: StreamKind,
    conversation_id: &str,
    sink: &ClientSender,
    mut capture: Option<&mut String>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut lines = 0u64;
    let mut send_failures = 0u64;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                lines += 1;
                let data = String::from_utf8_lossy(&buf).into_owned();
                if let Some(captured) = capture.as_deref_mut() {
                    captured.push_str(&data);
                }

                let event = ServerMessage::Stream {
                    stream,
                    data,
                    conversation_id: conversation_id.to_string(),
                };
                if sink.send(event).is_err() {
                    send_failures += 1;
                    if send_failures == 1 {
                        warn!(
                            conversation_id,
                            stream = stream.as_str(),
                            "client gone; still draining output"
                        );
                    }
                }
            }
            Err(e) => {
                warn!(conversation_id, stream = stream.as_str(), error = %e, "pipe read failed");
                break;
            }
        }
    }

    debug!(
        conversation_id,
        stream = stream.as_str(),
        lines,
        send_failures,
        "stream drained"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn collect(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<(StreamKind, String)> {
        let mut events = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let ServerMessage::Stream { stream, data, .. } = message {
                events.push((stream, data));
            }
        }
        events
    }

    #[tokio::test]
    async fn forwards_lines_in_per_stream_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stdout: &[u8] = b"one\ntwo\nthree";
        let stderr: &[u8] = b"warn a\nwarn b\n";

        let captured = drain_streams(stdout, stderr, "c1", &tx).await;
        assert_eq!(captured, "one\ntwo\nthree");

        let events = collect(&mut rx);
        let out: Vec<_> = events
            .iter()
            .filter(|(s, _)| *s == StreamKind::Stdout)
            .map(|(_, d)| d.as_str())
            .collect();
        let err: Vec<_> = events
            .iter()
            .filter(|(s, _)| *s == StreamKind::Stderr)
            .map(|(_, d)| d.as_str())
            .collect();
        assert_eq!(out, vec!["one\n", "two\n", "three"]);
        assert_eq!(err, vec!["warn a\n", "warn b\n"]);
        assert_eq!(out.concat(), captured);
    }

    #[tokio::test]
    async fn stderr_is_never_captured() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let stdout: &[u8] = b"";
        let stderr: &[u8] = b"noise\n";
        assert_eq!(drain_streams(stdout, stderr, "c1", &tx).await, "");
    }

    #[tokio::test]
    async fn closed_client_does_not_stop_draining() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let stdout: &[u8] = b"a\nb\nc\n";
        let stderr: &[u8] = b"e\n";

        let captured = drain_streams(stdout, stderr, "c1", &tx).await;
        assert_eq!(captured, "a\nb\nc\n");
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced_not_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let stdout: &[u8] = b"ok \xff\n";
        let stderr: &[u8] = b"";

        let captured = drain_streams(stdout, stderr, "c1", &tx).await;
        assert_eq!(captured, "ok \u{fffd}\n");
        assert_eq!(collect(&mut rx).len(), 1);
    }
}
