use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bytes::Bytes;
use vision::{
    ChannelSet, CompressedBuffer, EncodeFormat, MAIN_VIEW, Point, Quadrilateral, ROI_VIEW,
    RoiStore,
    server::{ServerState, spawn_preview_server},
};

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    fn wait_for(&self, needle: &str) -> String {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let text = self.text();
            if text.contains(needle) || Instant::now() > deadline {
                return text;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn open_stream(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
        .write_all(b"GET /stream/main HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let mut received = 0;
    let mut chunk = [0u8; 256];
    while received < 200 {
        let read = stream.read(&mut chunk).unwrap();
        assert!(read > 0, "stream closed early");
        received += read;
    }
    stream
}

#[test]
fn reader_connect_and_disconnect_are_logged_from_http_workers() {
    let captured = Captured::default();
    let writer = captured.clone();
    tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish(),
    )
    .unwrap();

    let roi = Quadrilateral::new([
        Point::new(0, 0),
        Point::new(63, 0),
        Point::new(63, 31),
        Point::new(0, 31),
    ])
    .unwrap();
    let state = ServerState::new(
        ChannelSet::new([MAIN_VIEW, ROI_VIEW], EncodeFormat::Jpeg),
        Arc::new(RoiStore::new(roi)),
        Duration::from_millis(20),
    );
    state.channels.get(MAIN_VIEW).unwrap().publish(CompressedBuffer {
        data: Bytes::from_static(b"\xFF\xD8fake-jpeg\xFF\xD9"),
        sequence: 1,
        format: EncodeFormat::Jpeg,
    });
    let server = spawn_preview_server("127.0.0.1:0".parse().unwrap(), state).unwrap();
    let addr = server.local_addr().unwrap();

    drop(open_stream(addr));
    let disconnected = "stream reader on channel \"main\" disconnected";
    let logs = captured.wait_for(disconnected);
    assert!(logs.contains("Stream reader connected"), "{logs}");
    assert!(logs.contains(disconnected), "{logs}");

    // Readers still attached when the server stops are not transport failures.
    let _open = open_stream(addr);
    let started = Instant::now();
    server.stop();
    assert!(started.elapsed() < Duration::from_secs(5));
    let logs = captured.wait_for("closed by server shutdown");
    assert!(logs.contains("closed by server shutdown"), "{logs}");
    assert_eq!(logs.matches(disconnected).count(), 1, "{logs}");
}
