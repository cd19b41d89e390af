#![allow(dead_code)]

use async_trait::async_trait;
use cubelink::{
    BoxStream, Connector, CubeError, Device, DeviceStatusListener, GatewayConfig, HubInfo,
    LineFramer, ListenerError, ListenerResult,
};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};

pub const HELLO: &str = "H:serial=KEQ0523864,rf=097f2c,firmware=0113,duty=0,slots=50";

pub fn default_dump() -> Vec<String> {
    vec![
        HELLO.to_string(),
        "M:00,02,room_id=1,room_name=Living".to_string(),
        "M:01,02,serial=KEQ1,rf=0a1b2c,type=thermostat,name=Radiator,room=1,serial=KEQ2,rf=0d0e0f,type=shutter_contact,name=Window,room=1".to_string(),
        "C:serial=KEQ1,rf=0a1b2c,type=thermostat,room=1,comfort=21.0".to_string(),
        "L:rf=0a1b2c,mode=AUTOMATIC,setpoint=20.0,valve=10,rf=0d0e0f,open=0".to_string(),
    ]
}

pub fn config(exclusive: bool) -> GatewayConfig {
    GatewayConfig::builder()
        .host("fake-cube")
        .exclusive(exclusive)
        .io_timeout_ms(1000)
        .build()
        .unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Scripted gateway reached through in-memory pipes.
///
/// Every connection starts with the state dump; commands get canned
/// answers. All lines the hub sends are recorded, as is every single write
/// call on the hub side of the pipe.
#[derive(Default)]
pub struct FakeCube {
    pub dump: Mutex<Vec<String>>,
    pub received: Arc<Mutex<Vec<String>>>,
    pub writes: Arc<Mutex<Vec<Vec<u8>>>>,
    pub connects: AtomicUsize,
    pub open: Arc<AtomicUsize>,
    pub max_open: Arc<AtomicUsize>,
    pub refuse: AtomicBool,
    pub hang_up_on_command: Arc<AtomicBool>,
}

impl FakeCube {
    pub fn new() -> Arc<Self> {
        let cube = Self::default();
        *cube.dump.lock().unwrap() = default_dump();
        Arc::new(cube)
    }

    pub fn with_dump(dump: Vec<String>) -> Arc<Self> {
        let cube = Self::default();
        *cube.dump.lock().unwrap() = dump;
        Arc::new(cube)
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.received()
            .into_iter()
            .filter(|l| l.starts_with(prefix))
            .collect()
    }
}

#[async_trait]
impl Connector for FakeCube {
    async fn connect(&self) -> cubelink::Result<BoxStream> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(CubeError::Connect {
                addr: self.address(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
            });
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let now_open = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open.fetch_max(now_open, Ordering::SeqCst);

        let (hub, gateway) = tokio::io::duplex(16 * 1024);
        let dump = self.dump.lock().unwrap().clone();
        tokio::spawn(serve(
            gateway,
            dump,
            Arc::clone(&self.received),
            Arc::clone(&self.hang_up_on_command),
        ));
        Ok(Box::new(TrackedStream {
            inner: hub,
            open: Arc::clone(&self.open),
            writes: Arc::clone(&self.writes),
        }))
    }

    fn address(&self) -> String {
        "fake-cube:62910".into()
    }
}

async fn serve(
    stream: DuplexStream,
    dump: Vec<String>,
    received: Arc<Mutex<Vec<String>>>,
    hang_up: Arc<AtomicBool>,
) {
    let (rd, mut wr) = tokio::io::split(stream);
    for line in &dump {
        if wr.write_all(format!("{}\r\n", line).as_bytes()).await.is_err() {
            return;
        }
    }
    let device_list = dump
        .iter()
        .rev()
        .find(|l| l.starts_with("L:"))
        .cloned()
        .unwrap_or_else(|| "L:".to_string());

    let mut framer = LineFramer::new(rd);
    while let Ok(Some(line)) = framer.read_next().await {
        received.lock().unwrap().push(line.clone());
        if hang_up.load(Ordering::SeqCst) {
            return;
        }
        let reply = match line.get(..2) {
            Some("l:") => device_list.clone(),
            Some("s:") => "S:duty=3,slots=49,discarded=0".to_string(),
            Some("f:") => "F:ntp=ntp.homematic.com,ntp=pool.ntp.org".to_string(),
            Some("c:") => format!("C:serial=NEW1,rf={},type=thermostat,room=0", &line[2..]),
            Some("n:") => "N:serial=NEW1,rf=0c0c0c,type=thermostat".to_string(),
            Some("q:") => return,
            _ => "A:".to_string(),
        };
        if wr.write_all(format!("{}\r\n", reply).as_bytes()).await.is_err() {
            return;
        }
    }
}

/// Hub side of the pipe; counts open connections and records writes.
pub struct TrackedStream {
    inner: DuplexStream,
    open: Arc<AtomicUsize>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            self.writes.lock().unwrap().push(buf[..*n].to_vec());
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Listener that records every callback as `event:serial`.
#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<String>>,
    pub fail_changes: AtomicBool,
}

impl Recorder {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.split(':').next() == Some(event))
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl DeviceStatusListener for Recorder {
    fn on_device_changed(&self, _hub_id: &str, device: &Device) -> ListenerResult {
        if self.fail_changes.load(Ordering::SeqCst) {
            return Err(ListenerError("rejecting updates".into()));
        }
        self.push(format!("changed:{}", device.serial()));
        Ok(())
    }

    fn on_device_discovered(&self, _hub: &HubInfo, device: &Device) -> ListenerResult {
        self.push(format!("discovered:{}", device.serial()));
        Ok(())
    }

    fn on_device_removed(&self, _hub: &HubInfo, device: &Device) -> ListenerResult {
        self.push(format!("removed:{}", device.serial()));
        Ok(())
    }

    fn on_device_config_updated(&self, _hub: &HubInfo, device: &Device) -> ListenerResult {
        self.push(format!("config:{}", device.serial()));
        Ok(())
    }

    fn on_connection(&self, _hub: &HubInfo) {
        self.push("connection".into());
    }

    fn on_connection_lost(&self, _hub: &HubInfo) {
        self.push("lost".into());
    }
}

/// Polls `cond` until it holds or five seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
