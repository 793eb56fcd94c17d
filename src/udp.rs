//! The UDP transport driver and the process-wide surface.
//!
//! The protocol core is sans-IO; this module is the backend that owns the
//! datagram socket, a progress worker per endpoint, and the locks. The lock
//! order is process registry → endpoint → (connection state lives inside the
//! endpoint lock); no application callback runs under any of them. Events
//! are handed out by value and their payloads copied out under a short
//! critical section.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use std::{env, io};

use slog::{Discard, Logger};

use config::{self, ConfigError, DeviceSpec};
use connection::ConnectionHandle;
use endpoint::{
    AcceptError, Config, ConnectError, Endpoint, Event, EventError, Io, RmaError, RmaFlags,
    SendError, SendFlags,
};
use rma::{Access, RmaHandle};
use {Attribute, Status};

/// ABI generation of the public surface.
pub const ABI_VERSION: u32 = 1;

/// How often the progress worker ticks when the wire is quiet.
const PROG_TICK: Duration = Duration::from_millis(2);
/// Datagrams drained from the socket per progress pass.
const RX_BATCH: usize = 64;

/// Capabilities granted by `init`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Caps {
    /// All calls may be made concurrently from multiple threads.
    pub thread_safe: bool,
}

/// One configured network, in `get_devices` priority order.
#[derive(Debug, Clone)]
pub struct Device {
    pub name: String,
    pub transport: String,
    pub priority: u8,
    pub is_default: bool,
    /// Address endpoints on this device bind to.
    pub addr: IpAddr,
    pub max_send_size: u32,
}

impl Device {
    fn from_spec(spec: DeviceSpec) -> Self {
        Self {
            name: spec.name,
            transport: spec.transport,
            priority: spec.priority,
            is_default: spec.default,
            addr: spec
                .ip
                .unwrap_or_else(|| IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))),
            max_send_size: Config::default().max_send_size() as u32,
        }
    }
}

struct Globals {
    refs: u32,
    abi: u32,
    flags: u32,
    devices: Vec<Device>,
}

lazy_static! {
    static ref GLOBALS: Mutex<Option<Globals>> = Mutex::new(None);
}

#[derive(Debug, Fail)]
pub enum InitError {
    #[fail(display = "unsupported abi version {}", _0)]
    AbiMismatch(u32),
    #[fail(display = "init arguments differ from the first initialization")]
    ArgMismatch,
    #[fail(display = "not initialized")]
    NotInitialized,
    #[fail(display = "configuration: {}", _0)]
    Config(#[cause] ConfigError),
}

/// Process-wide initialization. Idempotent when repeated with identical
/// arguments; every `init` must be balanced by a `finalize`.
pub fn init(abi_version: u32, flags: u32) -> Result<Caps, InitError> {
    if abi_version != ABI_VERSION {
        return Err(InitError::AbiMismatch(abi_version));
    }
    let mut globals = GLOBALS.lock().unwrap();
    if let Some(ref mut g) = *globals {
        if g.abi != abi_version || g.flags != flags {
            return Err(InitError::ArgMismatch);
        }
        g.refs += 1;
        return Ok(Caps { thread_safe: true });
    }
    let mut specs = match env::var_os("CCI_CONFIG") {
        Some(path) => config::load(Path::new(&path)).map_err(InitError::Config)?,
        None => config::default_devices(),
    };
    if specs.is_empty() {
        specs = config::default_devices();
    }
    *globals = Some(Globals {
        refs: 1,
        abi: abi_version,
        flags,
        devices: specs.into_iter().map(Device::from_spec).collect(),
    });
    Ok(Caps { thread_safe: true })
}

/// Tear down the registry on the last balanced call.
pub fn finalize() -> Result<(), InitError> {
    let mut globals = GLOBALS.lock().unwrap();
    match *globals {
        Some(ref mut g) if g.refs > 1 => {
            g.refs -= 1;
            return Ok(());
        }
        Some(_) => {}
        None => {
            return Err(InitError::NotInitialized);
        }
    }
    *globals = None;
    Ok(())
}

/// The configured devices, highest priority first. The returned descriptors
/// are snapshots; treat them as read-only.
pub fn get_devices() -> Result<Vec<Device>, InitError> {
    let globals = GLOBALS.lock().unwrap();
    match *globals {
        Some(ref g) => Ok(g.devices.clone()),
        None => Err(InitError::NotInitialized),
    }
}

fn default_device() -> Result<Device, InitError> {
    let globals = GLOBALS.lock().unwrap();
    match *globals {
        Some(ref g) => Ok(g
            .devices
            .iter()
            .find(|d| d.is_default)
            .or_else(|| g.devices.first())
            .cloned()
            .expect("device list is never empty")),
        None => Err(InitError::NotInitialized),
    }
}

#[derive(Debug, Fail)]
pub enum EndpointError {
    #[fail(display = "{}", _0)]
    Init(#[cause] InitError),
    #[fail(display = "transport `{}` is not provided by this driver", _0)]
    UnsupportedTransport(String),
    #[fail(display = "{}", _0)]
    Io(#[cause] io::Error),
}

impl From<io::Error> for EndpointError {
    fn from(x: io::Error) -> Self {
        EndpointError::Io(x)
    }
}

/// Recognized endpoint and connection options.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Opt {
    /// Default send timeout, µs.
    EndptSendTimeout(u32),
    /// Receive slot count; refused while any slot is borrowed.
    EndptRecvBufCount(u32),
    /// Send slot count; refused while any slot is borrowed.
    EndptSendBufCount(u32),
    /// Keepalive interval, µs; 0 disables.
    EndptKeepaliveTimeout(u32),
    /// Per-connection send timeout, µs.
    ConnSendTimeout(ConnectionHandle, u32),
    /// Per-connection keepalive interval, µs; 0 disables.
    ConnKeepaliveTimeout(ConnectionHandle, u32),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum OptValue {
    U32(u32),
    Uri(String),
    RmaAlign(RmaAlign),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OptName {
    EndptSendTimeout,
    EndptRecvBufCount,
    EndptSendBufCount,
    EndptKeepaliveTimeout,
    EndptUri,
    EndptRmaAlign,
    ConnSendTimeout(ConnectionHandle),
    ConnKeepaliveTimeout(ConnectionHandle),
}

#[derive(Debug, Fail, Clone, Copy, Eq, PartialEq)]
pub enum OptError {
    #[fail(display = "buffers are in use")]
    Busy,
    #[fail(display = "unknown connection")]
    UnknownConnection,
}

/// Required alignments for RMA operands. The user-space emulation has no
/// alignment requirements, so every field reads 1.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RmaAlign {
    pub rma_write_local_addr: u32,
    pub rma_write_remote_addr: u32,
    pub rma_read_local_addr: u32,
    pub rma_read_remote_addr: u32,
    pub rma_write_length: u32,
    pub rma_read_length: u32,
}

impl Default for RmaAlign {
    fn default() -> Self {
        RmaAlign {
            rma_write_local_addr: 1,
            rma_write_remote_addr: 1,
            rma_read_local_addr: 1,
            rma_read_remote_addr: 1,
            rma_write_length: 1,
            rma_read_length: 1,
        }
    }
}

struct Shared {
    core: Mutex<Endpoint>,
    cv: Condvar,
    socket: UdpSocket,
    shutdown: AtomicBool,
    epoch: Instant,
    log: Logger,
}

impl Shared {
    fn now(&self) -> u64 {
        let dt = self.epoch.elapsed();
        dt.as_secs() * 1_000_000 + u64::from(dt.subsec_micros())
    }

    /// Run a progress pass and push everything it produced onto the wire.
    fn kick(&self, core: &mut Endpoint) {
        core.progress(self.now());
        self.flush_io(core);
        self.cv.notify_all();
    }

    fn flush_io(&self, core: &mut Endpoint) {
        while let Some(op) = core.poll_io() {
            let Io::Transmit {
                destination,
                packet,
            } = op;
            match self.socket.send_to(&packet, destination) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    core.requeue_io(Io::Transmit {
                        destination,
                        packet,
                    });
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // transient shortage: retry on the next pass
                    core.requeue_io(Io::Transmit {
                        destination,
                        packet,
                    });
                    break;
                }
                Err(e) => {
                    debug!(self.log, "send_to failed; dropping datagram"; "error" => %e);
                }
            }
        }
    }
}

/// An endpoint bound to one UDP socket, with a dedicated progress worker.
///
/// All methods are safe to call from any thread.
pub struct UdpEndpoint {
    shared: Arc<Shared>,
    worker: Option<thread::JoinHandle<()>>,
    uri: String,
}

/// Create an endpoint on `device` (or the default device) with an ephemeral
/// service.
pub fn create_endpoint(device: Option<&Device>, log: Logger) -> Result<UdpEndpoint, EndpointError> {
    create_endpoint_at(device, 0, log)
}

/// Create an endpoint bound to an explicit service (UDP port).
pub fn create_endpoint_at(
    device: Option<&Device>,
    service: u16,
    log: Logger,
) -> Result<UdpEndpoint, EndpointError> {
    let device = match device {
        Some(d) => d.clone(),
        None => default_device().map_err(EndpointError::Init)?,
    };
    if device.transport != "ip" {
        return Err(EndpointError::UnsupportedTransport(device.transport));
    }
    let socket = UdpSocket::bind(SocketAddr::new(device.addr, service))?;
    socket.set_nonblocking(true)?;
    let uri = format!("ip://{}", socket.local_addr()?);
    let log = log.new(o!("endpoint" => uri.clone()));
    let core = Endpoint::new(log.clone(), Config::default());
    let shared = Arc::new(Shared {
        core: Mutex::new(core),
        cv: Condvar::new(),
        socket,
        shutdown: AtomicBool::new(false),
        epoch: Instant::now(),
        log,
    });
    let worker = {
        let shared = shared.clone();
        thread::Builder::new()
            .name("cci-progress".into())
            .spawn(move || progress_worker(shared))
            .map_err(EndpointError::Io)?
    };
    Ok(UdpEndpoint {
        shared,
        worker: Some(worker),
        uri,
    })
}

fn progress_worker(shared: Arc<Shared>) {
    let mut buf = vec![0u8; 64 * 1024];
    while !shared.shutdown.load(Ordering::Acquire) {
        let mut drained = 0;
        {
            let mut core = shared.core.lock().unwrap();
            while drained < RX_BATCH {
                match shared.socket.recv_from(&mut buf) {
                    Ok((len, from)) => {
                        let now = shared.now();
                        core.handle(now, from, &buf[..len]);
                        drained += 1;
                    }
                    Err(ref e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::TimedOut =>
                    {
                        break;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                        continue;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                        // ICMP unreachable bleeding through; reliability
                        // handles the real outcome
                        continue;
                    }
                    Err(e) => {
                        warn!(shared.log, "socket failed"; "error" => %e);
                        let now = shared.now();
                        core.device_failed(now);
                        break;
                    }
                }
            }
            shared.kick(&mut core);
        }
        thread::sleep(PROG_TICK);
    }
}

impl UdpEndpoint {
    /// The endpoint's bound URI, `ip://host:port`.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// OS handle that becomes readable when an event may be ready. An
    /// edge-triggered hint only: a concurrent drainer may win the race.
    #[cfg(unix)]
    pub fn os_handle(&self) -> RawFd {
        self.shared.socket.as_raw_fd()
    }

    fn lock(&self) -> MutexGuard<Endpoint> {
        self.shared.core.lock().unwrap()
    }

    /// Initiate a connection to a peer endpoint's URI.
    pub fn connect(
        &self,
        server_uri: &str,
        payload: &[u8],
        attribute: Attribute,
        context: u64,
        timeout: Option<Duration>,
    ) -> Result<ConnectionHandle, ConnectError> {
        let remote = parse_uri(server_uri).ok_or(ConnectError::InvalidUri)?;
        let timeout = timeout.map(|t| t.as_secs() * 1_000_000 + u64::from(t.subsec_micros()));
        let mut core = self.lock();
        let now = self.shared.now();
        let ch = core.connect(now, remote, payload, attribute, context, timeout)?;
        self.shared.kick(&mut core);
        Ok(ch)
    }

    /// Accept a connection request event.
    pub fn accept(&self, event: &Event, context: u64) -> Result<ConnectionHandle, AcceptError> {
        let ch = match *event {
            Event::ConnectRequest { conn, .. } => conn,
            _ => {
                return Err(AcceptError::NotPending);
            }
        };
        let mut core = self.lock();
        let now = self.shared.now();
        core.accept(now, ch, context)?;
        self.shared.kick(&mut core);
        Ok(ch)
    }

    /// Reject a connection request event.
    pub fn reject(&self, event: &Event) -> Result<(), AcceptError> {
        let ch = match *event {
            Event::ConnectRequest { conn, .. } => conn,
            _ => {
                return Err(AcceptError::NotPending);
            }
        };
        let mut core = self.lock();
        core.reject(ch)?;
        self.shared.kick(&mut core);
        Ok(())
    }

    pub fn disconnect(&self, ch: ConnectionHandle) {
        let mut core = self.lock();
        let now = self.shared.now();
        core.disconnect(now, ch);
        self.shared.kick(&mut core);
    }

    /// Send a message. With `flags.blocking` the call returns the final
    /// completion status; otherwise completion arrives as a SEND event.
    pub fn send(
        &self,
        ch: ConnectionHandle,
        data: &[u8],
        context: u64,
        flags: SendFlags,
    ) -> Result<Option<Status>, SendError> {
        let mut core = self.lock();
        let now = self.shared.now();
        let id = core.send(now, ch, data, context, flags)?;
        self.shared.kick(&mut core);
        if !flags.blocking {
            return Ok(None);
        }
        loop {
            if let Some(status) = core.take_blocking_status(id) {
                return Ok(Some(status));
            }
            let (guard, _) = self
                .shared
                .cv
                .wait_timeout(core, PROG_TICK)
                .unwrap();
            core = guard;
        }
    }

    /// Gather variant of `send`.
    pub fn sendv(
        &self,
        ch: ConnectionHandle,
        segments: &[&[u8]],
        context: u64,
        flags: SendFlags,
    ) -> Result<Option<Status>, SendError> {
        let mut core = self.lock();
        let now = self.shared.now();
        let id = core.sendv(now, ch, segments, context, flags)?;
        self.shared.kick(&mut core);
        if !flags.blocking {
            return Ok(None);
        }
        loop {
            if let Some(status) = core.take_blocking_status(id) {
                return Ok(Some(status));
            }
            let (guard, _) = self
                .shared
                .cv
                .wait_timeout(core, PROG_TICK)
                .unwrap();
            core = guard;
        }
    }

    /// Register a region for remote access. The endpoint owns the bytes
    /// until deregistration hands them back.
    pub fn rma_register(&self, mem: Vec<u8>, access: Access) -> RmaHandle {
        self.lock().rma_register(mem, access)
    }

    /// Deregister a region, recovering its bytes. Refused with `Busy` while
    /// operations are in flight on it.
    pub fn rma_deregister(&self, handle: &RmaHandle) -> Result<Vec<u8>, RmaError> {
        self.lock().rma_deregister(handle)
    }

    /// Copy of a registered region's bytes.
    pub fn read_region(&self, handle: &RmaHandle) -> Option<Vec<u8>> {
        self.lock().region_bytes(handle).map(|b| b.to_vec())
    }

    /// Overwrite part of a registered region.
    pub fn write_region(&self, handle: &RmaHandle, offset: usize, data: &[u8]) -> bool {
        let mut core = self.lock();
        match core.region_bytes_mut(handle) {
            Some(mem) if offset + data.len() <= mem.len() => {
                mem[offset..offset + data.len()].copy_from_slice(data);
                true
            }
            _ => false,
        }
    }

    /// One-sided transfer. With `flags.blocking` the call returns the final
    /// status; otherwise completion arrives as a SEND event carrying
    /// `context`.
    pub fn rma(
        &self,
        ch: ConnectionHandle,
        completion_msg: Option<&[u8]>,
        local: &RmaHandle,
        local_offset: u64,
        remote: &RmaHandle,
        remote_offset: u64,
        length: u64,
        context: u64,
        flags: RmaFlags,
    ) -> Result<Option<Status>, RmaError> {
        let mut core = self.lock();
        let now = self.shared.now();
        let id = core.rma(
            now,
            ch,
            completion_msg,
            local,
            local_offset,
            remote,
            remote_offset,
            length,
            context,
            flags,
        )?;
        self.shared.kick(&mut core);
        if !flags.blocking {
            return Ok(None);
        }
        loop {
            if let Some(status) = core.take_rma_blocking_status(ch, id) {
                return Ok(Some(status));
            }
            let (guard, _) = self
                .shared
                .cv
                .wait_timeout(core, PROG_TICK)
                .unwrap();
            core = guard;
        }
    }

    /// Pop the next event. Never blocks; use `os_handle` with the host's
    /// native wait primitive to sleep for one.
    pub fn get_event(&self) -> Result<Event, EventError> {
        self.lock().get_event()
    }

    /// Return an event, releasing the buffer slot backing it.
    pub fn return_event(&self, event: Event) {
        self.lock().return_event(event)
    }

    /// Copy out the payload of a RECV or CONNECT_REQUEST event.
    pub fn event_payload(&self, event: &Event) -> Vec<u8> {
        self.lock().event_payload(event).to_vec()
    }

    pub fn set_opt(&self, opt: Opt) -> Result<(), OptError> {
        let mut core = self.lock();
        match opt {
            Opt::EndptSendTimeout(us) => {
                core.set_tx_timeout(u64::from(us));
                Ok(())
            }
            Opt::EndptRecvBufCount(n) => core
                .set_rx_count(n as u16)
                .map_err(|()| OptError::Busy),
            Opt::EndptSendBufCount(n) => core
                .set_tx_count(n as u16)
                .map_err(|()| OptError::Busy),
            Opt::EndptKeepaliveTimeout(us) => {
                core.set_keepalive(u64::from(us));
                Ok(())
            }
            Opt::ConnSendTimeout(ch, us) => {
                if core.connection_state(ch).is_none() {
                    return Err(OptError::UnknownConnection);
                }
                core.set_conn_tx_timeout(ch, Some(u64::from(us)));
                Ok(())
            }
            Opt::ConnKeepaliveTimeout(ch, us) => {
                if core.connection_state(ch).is_none() {
                    return Err(OptError::UnknownConnection);
                }
                core.set_conn_keepalive(ch, Some(u64::from(us)));
                Ok(())
            }
        }
    }

    pub fn get_opt(&self, name: OptName) -> Result<OptValue, OptError> {
        let core = self.lock();
        Ok(match name {
            OptName::EndptSendTimeout => OptValue::U32(core.config().tx_timeout as u32),
            OptName::EndptRecvBufCount => OptValue::U32(u32::from(core.config().rx_buf_count)),
            OptName::EndptSendBufCount => OptValue::U32(u32::from(core.config().tx_buf_count)),
            OptName::EndptKeepaliveTimeout => OptValue::U32(core.config().keepalive as u32),
            OptName::EndptUri => OptValue::Uri(self.uri.clone()),
            OptName::EndptRmaAlign => OptValue::RmaAlign(RmaAlign::default()),
            OptName::ConnSendTimeout(ch) | OptName::ConnKeepaliveTimeout(ch) => {
                if core.connection_state(ch).is_none() {
                    return Err(OptError::UnknownConnection);
                }
                // overrides default to the endpoint-wide values
                match name {
                    OptName::ConnSendTimeout(_) => {
                        OptValue::U32(core.config().tx_timeout as u32)
                    }
                    _ => OptValue::U32(core.config().keepalive as u32),
                }
            }
        })
    }
}

impl UdpEndpoint {
    /// Tear the endpoint down: stops the progress worker and closes the
    /// socket, implicitly disconnecting every connection on it.
    pub fn destroy(self) {}
}

impl Drop for UdpEndpoint {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Parse `ip://host[:service]`.
fn parse_uri(uri: &str) -> Option<SocketAddr> {
    let rest = if uri.starts_with("ip://") {
        &uri[5..]
    } else {
        return None;
    };
    let with_port: ::std::borrow::Cow<str> = if rest.contains(':') {
        rest.into()
    } else {
        format!("{}:0", rest).into()
    };
    with_port.to_socket_addrs().ok()?.next()
}

/// A root logger for callers that do not care: discards everything.
pub fn null_logger() -> Logger {
    Logger::root(Discard, o!())
}
