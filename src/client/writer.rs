/// Single-writer serialisation over the transport.
///
/// All outbound text funnels through one task owning the write half of
/// the socket, so at most one write is in flight and bytes reach the
/// wire in submission order. Each packet may carry a completion
/// callback; on a write failure the queue is drained with `ok=false`
/// and the connection moves to Error.
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::ConnectionError;

use super::Client;

pub type WriteCallback = Box<dyn FnOnce(bool) + Send + 'static>;

pub struct WirePacket {
    pub xml: String,
    pub done: Option<WriteCallback>,
}

impl WirePacket {
    pub fn plain(xml: String) -> Self {
        Self { xml, done: None }
    }
}

fn complete(done: Option<WriteCallback>, ok: bool) {
    if let Some(callback) = done {
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(ok))).is_err() {
            error!("write completion callback panicked");
        }
    }
}

pub async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<WirePacket>,
    client: Client,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(packet) = rx.recv().await {
        debug!("XMPP >>> {}", packet.xml);
        match writer.write_all(packet.xml.as_bytes()).await {
            Ok(()) => complete(packet.done, true),
            Err(e) => {
                complete(packet.done, false);
                while let Ok(stale) = rx.try_recv() {
                    complete(stale.done, false);
                }
                client.connection_failed(ConnectionError::Io(e.to_string()));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};

    fn client() -> Client {
        let config: ClientConfig =
            toml::from_str("host = \"example.org\"\nuser = \"a\"\npassword = \"p\"\n").unwrap();
        Client::new(config).0
    }

    /// Collects written bytes, optionally failing every write.
    struct FakeTransport {
        written: Arc<Mutex<Vec<u8>>>,
        fail: bool,
    }

    impl AsyncWrite for FakeTransport {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.fail {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")));
            }
            self.written.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_packets_written_in_submission_order() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let transport = FakeTransport {
            written: written.clone(),
            fail: false,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(WirePacket::plain("<a/>".into())).unwrap();
        tx.send(WirePacket::plain("<b/>".into())).unwrap();
        tx.send(WirePacket::plain("<c/>".into())).unwrap();
        drop(tx);

        write_loop(transport, rx, client()).await;
        assert_eq!(written.lock().unwrap().as_slice(), b"<a/><b/><c/>");
    }

    #[tokio::test]
    async fn test_completion_callback_fires_true() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let transport = FakeTransport {
            written,
            fail: false,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        tx.send(WirePacket {
            xml: "<presence/>".into(),
            done: Some(Box::new(move |ok| flag.store(ok, Ordering::SeqCst))),
        })
        .unwrap();
        drop(tx);

        write_loop(transport, rx, client()).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_failure_drains_queue_with_false() {
        let transport = FakeTransport {
            written: Arc::new(Mutex::new(Vec::new())),
            fail: true,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let results = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..3 {
            let results = results.clone();
            tx.send(WirePacket {
                xml: "<x/>".into(),
                done: Some(Box::new(move |ok| results.lock().unwrap().push(ok))),
            })
            .unwrap();
        }
        drop(tx);

        let client = client();
        client.set_state(super::super::ConnectionState::Connected);
        write_loop(transport, rx, client.clone()).await;
        assert_eq!(results.lock().unwrap().as_slice(), &[false, false, false]);
        assert_eq!(client.state(), super::super::ConnectionState::Error);
    }
}
