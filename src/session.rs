//! Per-client session engine.
//!
//! One session task per accepted TCP client. The session exclusively owns
//! its socket and its UART channel, pumps bytes both ways through bounded
//! staging buffers, runs the telnet/COM-port-control machinery when the
//! port is in telnet mode, enforces the idle timeout, and retires itself
//! from the session table on every exit path.
//!
//! Lifecycle: `Opening → Negotiating → Running → Draining → Closed`.
//! Raw and rawlp ports skip `Negotiating`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, Duration, Instant, MissedTickBehavior};

use portgate_serial::{PurgeDirection, SerialParams, UartDriver, UartPort};
use portgate_telnet::telnet::comport::{self, ComPortRequest};
use portgate_telnet::telnet::protocol::escape_iac;
use portgate_telnet::{NegotiationManager, TelnetCodec, TelnetCommand, TelnetFrame, TelnetOption};

use crate::config::{PortConfig, PortMode};

/// One pump iteration's I/O bound.
const PUMP_TICK: Duration = Duration::from_millis(50);
/// Bound on a single socket write attempt.
const WRITE_WAIT: Duration = Duration::from_millis(50);
/// Total budget for flushing egress buffers at teardown.
const DRAIN_WAIT: Duration = Duration::from_millis(500);
/// Modem/line status poll cadence.
const STATUS_POLL: Duration = Duration::from_millis(250);
/// Per-read chunk sizes.
const TCP_CHUNK: usize = 1024;
const UART_CHUNK: usize = 1024;
/// Egress staging watermarks. At the high mark the session stops reading
/// the opposite side; reading resumes below the low mark.
const HIGH_WATERMARK: usize = 4096;
const LOW_WATERMARK: usize = 1024;
/// Break pulse width for the telnet BREAK command.
const BREAK_PULSE_MS: u32 = 250;

// ── Mailbox messages ────────────────────────────────────────────────────

/// Messages delivered to a running session.
#[derive(Debug, Clone)]
pub enum SessionMsg {
    /// Terminate at the next pump iteration.
    Cancel,
    /// The port was disabled; terminate.
    Disable,
    /// Reapply framing live, without tearing the session down.
    Reconfig(SerialParams),
}

// ── Session table ───────────────────────────────────────────────────────

/// Read-only snapshot of a live session for observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveSessionView {
    pub session_id: String,
    pub port_id: u16,
    pub tcp_port: u16,
    pub peer: String,
    pub bytes_rx: u64,
    pub bytes_tx: u64,
    pub connected_at: DateTime<Utc>,
    pub age_ms: u64,
}

struct SessionEntry {
    session_id: String,
    port_id: u16,
    tcp_port: u16,
    peer: SocketAddr,
    connected_at: DateTime<Utc>,
    started: Instant,
    bytes_rx: Arc<AtomicU64>,
    bytes_tx: Arc<AtomicU64>,
    cancel: Arc<AtomicBool>,
    mailbox: mpsc::Sender<SessionMsg>,
}

/// The live-session index. Sessions insert themselves on accept and
/// retire on close; the registry reads snapshots and posts messages. No
/// lock is ever held across an await.
#[derive(Default)]
pub struct SessionTable {
    inner: StdMutex<HashMap<String, SessionEntry>>,
}

impl SessionTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn insert(&self, entry: SessionEntry) {
        let mut inner = self.inner.lock().unwrap();
        inner.insert(entry.session_id.clone(), entry);
    }

    fn remove(&self, session_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.remove(session_id);
    }

    /// Number of live sessions on a TCP port (admission control).
    pub fn count_for_port(&self, tcp_port: u16) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.values().filter(|e| e.tcp_port == tcp_port).count()
    }

    /// Snapshot views of all live sessions.
    pub fn views(&self) -> Vec<ActiveSessionView> {
        let inner = self.inner.lock().unwrap();
        inner
            .values()
            .map(|e| ActiveSessionView {
                session_id: e.session_id.clone(),
                port_id: e.port_id,
                tcp_port: e.tcp_port,
                peer: e.peer.to_string(),
                bytes_rx: e.bytes_rx.load(Ordering::Relaxed),
                bytes_tx: e.bytes_tx.load(Ordering::Relaxed),
                connected_at: e.connected_at,
                age_ms: e.started.elapsed().as_millis() as u64,
            })
            .collect()
    }

    fn signal_port(&self, tcp_port: u16, msg: SessionMsg) -> bool {
        let inner = self.inner.lock().unwrap();
        let mut any = false;
        for e in inner.values().filter(|e| e.tcp_port == tcp_port) {
            if matches!(msg, SessionMsg::Cancel | SessionMsg::Disable) {
                e.cancel.store(true, Ordering::Relaxed);
            }
            if let Err(err) = e.mailbox.try_send(msg.clone()) {
                log::warn!("[session:{}] mailbox full, dropping {:?}", e.session_id, err);
            }
            any = true;
        }
        any
    }

    /// Cancel every session on the port. Idempotent; returns whether any
    /// session existed.
    pub fn cancel_port(&self, tcp_port: u16) -> bool {
        self.signal_port(tcp_port, SessionMsg::Cancel)
    }

    /// Cancel sessions on a port that was disabled.
    pub fn disable_port(&self, tcp_port: u16) -> bool {
        self.signal_port(tcp_port, SessionMsg::Disable)
    }

    /// Post a live reconfig to every session on the port.
    pub fn reconfig_port(&self, tcp_port: u16, params: SerialParams) -> bool {
        self.signal_port(tcp_port, SessionMsg::Reconfig(params))
    }

    /// Cancel everything (shutdown path).
    pub fn cancel_all(&self) {
        let inner = self.inner.lock().unwrap();
        for e in inner.values() {
            e.cancel.store(true, Ordering::Relaxed);
            let _ = e.mailbox.try_send(SessionMsg::Cancel);
        }
    }
}

/// Removes the table entry when the session task unwinds, however it
/// exits.
struct TableGuard {
    table: Arc<SessionTable>,
    session_id: String,
}

impl Drop for TableGuard {
    fn drop(&mut self) {
        self.table.remove(&self.session_id);
    }
}

/// Releases the UART channel on every exit path.
struct UartGuard(Arc<dyn UartPort>);

impl Drop for UartGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}

// ── Session spawn ───────────────────────────────────────────────────────

/// Register a table entry for an accepted client and spawn its session
/// task. Returns the session id.
pub(crate) fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    cfg: PortConfig,
    driver: Arc<dyn UartDriver>,
    table: Arc<SessionTable>,
) -> String {
    let session_id = uuid::Uuid::new_v4().to_string();
    let (mailbox_tx, mailbox_rx) = mpsc::channel::<SessionMsg>(8);
    let cancel = Arc::new(AtomicBool::new(false));
    let bytes_rx = Arc::new(AtomicU64::new(0));
    let bytes_tx = Arc::new(AtomicU64::new(0));

    table.insert(SessionEntry {
        session_id: session_id.clone(),
        port_id: cfg.port_id,
        tcp_port: cfg.tcp_port,
        peer,
        connected_at: Utc::now(),
        started: Instant::now(),
        bytes_rx: bytes_rx.clone(),
        bytes_tx: bytes_tx.clone(),
        cancel: cancel.clone(),
        mailbox: mailbox_tx,
    });

    let id = session_id.clone();
    tokio::spawn(async move {
        run_session(
            id, stream, peer, cfg, driver, table, mailbox_rx, cancel, bytes_rx, bytes_tx,
        )
        .await;
    });
    session_id
}

// ── Session task ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Opening,
    Negotiating,
    Running,
    Draining,
    Closed,
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    session_id: String,
    stream: TcpStream,
    peer: SocketAddr,
    cfg: PortConfig,
    driver: Arc<dyn UartDriver>,
    table: Arc<SessionTable>,
    mut mailbox: mpsc::Receiver<SessionMsg>,
    cancel: Arc<AtomicBool>,
    bytes_rx: Arc<AtomicU64>,
    bytes_tx: Arc<AtomicU64>,
) {
    let _table_guard = TableGuard {
        table,
        session_id: session_id.clone(),
    };

    log::info!(
        "[session:{}] accepted {} on tcp {} ({} mode, UART{})",
        session_id,
        peer,
        cfg.tcp_port,
        cfg.mode.label(),
        cfg.uart.uart_num
    );

    // Opening: acquire the UART with the configured framing.
    let uart = match driver.open(&cfg.uart, &cfg.params).await {
        Ok(u) => u,
        Err(e) => {
            log::error!("[session:{}] UART{} open failed: {}", session_id, cfg.uart.uart_num, e);
            return;
        }
    };
    let _uart_guard = UartGuard(uart.clone());

    let (mut rd, mut wr) = stream.into_split();
    let mut runner = SessionRunner::new(session_id.clone(), cfg, uart, cancel, bytes_rx, bytes_tx);

    if runner.cfg.mode == PortMode::Telnet {
        runner.set_state(SessionState::Negotiating);
        let volley = runner.negotiation.initial_negotiation();
        runner.tcp_egress.extend_from_slice(&volley);
    }
    runner.set_state(SessionState::Running);

    runner.pump(&mut rd, &mut wr, &mut mailbox).await;
    runner.drain_and_close(&mut wr).await;

    log::info!(
        "[session:{}] closed (rx {} tx {})",
        runner.session_id,
        runner.bytes_rx.load(Ordering::Relaxed),
        runner.bytes_tx.load(Ordering::Relaxed)
    );
}

enum Step {
    Tick,
    Tcp(std::io::Result<usize>),
    Uart(Result<usize, portgate_serial::UartError>),
    Msg(Option<SessionMsg>),
}

struct SessionRunner {
    session_id: String,
    cfg: PortConfig,
    /// Framing currently programmed into the channel; diverges from
    /// `cfg.params` after live reconfiguration.
    params: SerialParams,
    uart: Arc<dyn UartPort>,
    codec: TelnetCodec,
    negotiation: NegotiationManager,
    state: SessionState,

    /// Client → UART staging.
    uart_egress: Vec<u8>,
    /// UART → client staging (also carries protocol replies).
    tcp_egress: Vec<u8>,
    tcp_read_paused: bool,
    uart_read_paused: bool,

    linestate_mask: u8,
    modemstate_mask: u8,
    last_modemstate: u8,
    break_on: bool,
    flow_suspended: bool,

    last_activity: Instant,
    last_status_poll: Instant,
    cancel: Arc<AtomicBool>,
    bytes_rx: Arc<AtomicU64>,
    bytes_tx: Arc<AtomicU64>,
}

impl SessionRunner {
    fn new(
        session_id: String,
        cfg: PortConfig,
        uart: Arc<dyn UartPort>,
        cancel: Arc<AtomicBool>,
        bytes_rx: Arc<AtomicU64>,
        bytes_tx: Arc<AtomicU64>,
    ) -> Self {
        let mut negotiation = NegotiationManager::new();
        if cfg.mode == PortMode::Telnet {
            let binary = TelnetOption::BinaryTransmission.code();
            let sga = TelnetOption::SuppressGoAhead.code();
            negotiation.offer_local(binary);
            negotiation.request_remote(binary);
            negotiation.offer_local(sga);
            negotiation.request_remote(sga);
            negotiation.offer_local(TelnetOption::ComPortControl.code());
            negotiation.allow_local(TelnetOption::Echo.code());
        }
        let params = cfg.params;
        let now = Instant::now();
        Self {
            session_id,
            cfg,
            params,
            uart,
            codec: TelnetCodec::new(),
            negotiation,
            state: SessionState::Opening,
            uart_egress: Vec::with_capacity(HIGH_WATERMARK),
            tcp_egress: Vec::with_capacity(HIGH_WATERMARK),
            tcp_read_paused: false,
            uart_read_paused: false,
            linestate_mask: 0,
            modemstate_mask: 0,
            last_modemstate: 0,
            break_on: false,
            flow_suspended: false,
            last_activity: now,
            last_status_poll: now,
            cancel,
            bytes_rx,
            bytes_tx,
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            log::debug!("[session:{}] {:?} -> {:?}", self.session_id, self.state, state);
            self.state = state;
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn comport_active(&self) -> bool {
        self.cfg.mode == PortMode::Telnet
            && self
                .negotiation
                .is_local_enabled(TelnetOption::ComPortControl.code())
    }

    /// Watermark hysteresis: pause reading a side when its egress staging
    /// fills; resume once drained below the low mark.
    fn update_pause_flags(&mut self) {
        if self.uart_egress.len() >= HIGH_WATERMARK {
            self.tcp_read_paused = true;
        } else if self.tcp_read_paused && self.uart_egress.len() <= LOW_WATERMARK {
            self.tcp_read_paused = false;
        }
        if self.tcp_egress.len() >= HIGH_WATERMARK {
            self.uart_read_paused = true;
        } else if self.uart_read_paused && self.tcp_egress.len() <= LOW_WATERMARK {
            self.uart_read_paused = false;
        }
    }

    fn idle_expired(&self) -> bool {
        self.cfg.idle_timeout_ms > 0
            && self.last_activity.elapsed() >= Duration::from_millis(self.cfg.idle_timeout_ms as u64)
    }

    // ── Pump loop ───────────────────────────────────────────────────

    async fn pump(
        &mut self,
        rd: &mut OwnedReadHalf,
        wr: &mut OwnedWriteHalf,
        mailbox: &mut mpsc::Receiver<SessionMsg>,
    ) {
        let mut tick = interval(PUMP_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tcp_buf = [0u8; TCP_CHUNK];
        let mut uart_buf = [0u8; UART_CHUNK];

        loop {
            if !self.flush_uart_egress().await {
                break;
            }
            if !self.flush_tcp_egress(wr).await {
                break;
            }
            if self.cfg.mode == PortMode::Telnet
                && self.last_status_poll.elapsed() >= STATUS_POLL
            {
                self.last_status_poll = Instant::now();
                self.poll_status().await;
            }
            self.update_pause_flags();

            if self.cancel.load(Ordering::Relaxed) {
                log::debug!("[session:{}] cancellation observed", self.session_id);
                break;
            }
            if self.idle_expired() {
                log::info!(
                    "[session:{}] idle for {} ms, closing",
                    self.session_id,
                    self.cfg.idle_timeout_ms
                );
                break;
            }

            let may_tcp = !self.tcp_read_paused;
            let may_uart = !self.uart_read_paused && !self.flow_suspended;
            let uart = self.uart.clone();

            let step = tokio::select! {
                _ = tick.tick() => Step::Tick,
                r = rd.read(&mut tcp_buf), if may_tcp => Step::Tcp(r),
                r = uart.read(&mut uart_buf), if may_uart => Step::Uart(r),
                m = mailbox.recv() => Step::Msg(m),
            };

            match step {
                Step::Tick => {}
                Step::Tcp(Ok(0)) => {
                    log::info!("[session:{}] peer closed", self.session_id);
                    break;
                }
                Step::Tcp(Ok(n)) => {
                    self.bytes_rx.fetch_add(n as u64, Ordering::Relaxed);
                    self.touch();
                    self.ingest_tcp(&tcp_buf[..n]).await;
                }
                Step::Tcp(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Step::Tcp(Err(e)) => {
                    log::warn!("[session:{}] socket read error: {}", self.session_id, e);
                    break;
                }
                Step::Uart(Ok(0)) => {}
                Step::Uart(Ok(n)) => {
                    self.touch();
                    self.ingest_uart(&uart_buf[..n]);
                }
                Step::Uart(Err(e)) => {
                    log::error!("[session:{}] UART read error: {}", self.session_id, e);
                    break;
                }
                Step::Msg(Some(msg)) => {
                    if self.handle_msg(msg).await {
                        break;
                    }
                }
                Step::Msg(None) => {}
            }
        }
    }

    // ── Ingest paths ────────────────────────────────────────────────

    async fn ingest_tcp(&mut self, bytes: &[u8]) {
        match self.cfg.mode {
            PortMode::Raw => self.uart_egress.extend_from_slice(bytes),
            // Line-printer style: the client→UART path is inactive.
            PortMode::RawLp => {}
            PortMode::Telnet => {
                let frames = self.codec.decode(bytes);
                for frame in frames {
                    self.handle_frame(frame).await;
                }
            }
        }
    }

    fn ingest_uart(&mut self, bytes: &[u8]) {
        match self.cfg.mode {
            PortMode::Raw | PortMode::RawLp => self.tcp_egress.extend_from_slice(bytes),
            PortMode::Telnet => self.tcp_egress.extend_from_slice(&escape_iac(bytes)),
        }
    }

    async fn handle_frame(&mut self, frame: TelnetFrame) {
        match frame {
            TelnetFrame::Data(data) => self.uart_egress.extend_from_slice(&data),
            TelnetFrame::Negotiation { command, option } => {
                log::debug!(
                    "[session:{}] recv {} option {}",
                    self.session_id,
                    command,
                    option
                );
                let response = self.negotiation.handle(command, option);
                self.tcp_egress.extend_from_slice(&response);
            }
            TelnetFrame::SubNegotiation { option, data } => {
                if option == TelnetOption::ComPortControl.code() {
                    match ComPortRequest::parse(&data) {
                        Some(req) => self.handle_comport(req).await,
                        None => log::debug!(
                            "[session:{}] dropping unknown COM-port subnegotiation {:?}",
                            self.session_id,
                            data.first()
                        ),
                    }
                } else {
                    log::debug!(
                        "[session:{}] dropping subnegotiation for option {}",
                        self.session_id,
                        option
                    );
                }
            }
            TelnetFrame::Command(TelnetCommand::Break) => {
                let uart = self.uart.clone();
                let id = self.session_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = uart.send_break(BREAK_PULSE_MS).await {
                        log::warn!("[session:{}] break failed: {}", id, e);
                    }
                });
            }
            TelnetFrame::Command(cmd) => {
                log::debug!("[session:{}] ignoring command {}", self.session_id, cmd);
            }
        }
    }

    // ── COM-port control ────────────────────────────────────────────

    async fn handle_comport(&mut self, req: ComPortRequest) {
        match req {
            ComPortRequest::SetBaudRate(0) => {
                let reply = comport::reply_baud(self.params.baud);
                self.tcp_egress.extend_from_slice(&reply);
            }
            ComPortRequest::SetBaudRate(baud) => {
                let mut next = self.params;
                next.baud = baud;
                self.apply_framing(next).await;
                let reply = comport::reply_baud(self.params.baud);
                self.tcp_egress.extend_from_slice(&reply);
            }
            ComPortRequest::SetDataSize(v) => {
                if let Some(bits) = comport::data_bits_from_wire(v) {
                    let mut next = self.params;
                    next.data_bits = bits;
                    self.apply_framing(next).await;
                }
                let reply = comport::reply_byte(
                    comport::SET_DATASIZE,
                    comport::data_bits_to_wire(self.params.data_bits),
                );
                self.tcp_egress.extend_from_slice(&reply);
            }
            ComPortRequest::SetParity(v) => {
                if let Some(parity) = comport::parity_from_wire(v) {
                    let mut next = self.params;
                    next.parity = parity;
                    self.apply_framing(next).await;
                }
                let reply = comport::reply_byte(
                    comport::SET_PARITY,
                    comport::parity_to_wire(self.params.parity),
                );
                self.tcp_egress.extend_from_slice(&reply);
            }
            ComPortRequest::SetStopSize(v) => {
                if let Some(stop) = comport::stop_bits_from_wire(v) {
                    let mut next = self.params;
                    next.stop_bits = stop;
                    self.apply_framing(next).await;
                }
                let reply = comport::reply_byte(
                    comport::SET_STOPSIZE,
                    comport::stop_bits_to_wire(self.params.stop_bits),
                );
                self.tcp_egress.extend_from_slice(&reply);
            }
            ComPortRequest::SetControl(v) => self.handle_set_control(v).await,
            ComPortRequest::SetLineStateMask(mask) => {
                self.linestate_mask = mask;
                let reply = comport::reply_byte(comport::SET_LINESTATE_MASK, mask);
                self.tcp_egress.extend_from_slice(&reply);
            }
            ComPortRequest::SetModemStateMask(mask) => {
                self.modemstate_mask = mask;
                let reply = comport::reply_byte(comport::SET_MODEMSTATE_MASK, mask);
                self.tcp_egress.extend_from_slice(&reply);
            }
            ComPortRequest::PurgeData(v) => {
                let dir = match v {
                    comport::PURGE_RECEIVE => Some(PurgeDirection::Receive),
                    comport::PURGE_TRANSMIT => Some(PurgeDirection::Transmit),
                    comport::PURGE_BOTH => Some(PurgeDirection::Both),
                    _ => None,
                };
                if let Some(dir) = dir {
                    if matches!(dir, PurgeDirection::Transmit | PurgeDirection::Both) {
                        self.uart_egress.clear();
                    }
                    if let Err(e) = self.uart.purge(dir).await {
                        log::warn!("[session:{}] purge failed: {}", self.session_id, e);
                    }
                    let reply = comport::reply_byte(comport::PURGE_DATA, v);
                    self.tcp_egress.extend_from_slice(&reply);
                } else {
                    log::debug!("[session:{}] dropping purge value {}", self.session_id, v);
                }
            }
            ComPortRequest::FlowSuspend => self.flow_suspended = true,
            ComPortRequest::FlowResume => self.flow_suspended = false,
            ComPortRequest::NotifyLineState(v) | ComPortRequest::NotifyModemState(v) => {
                log::debug!("[session:{}] peer state notify {:#04x}", self.session_id, v);
            }
        }
    }

    async fn handle_set_control(&mut self, v: u8) {
        use portgate_telnet::telnet::comport::*;
        let reply_value = match v {
            CONTROL_FLOW_REQUEST => flow_to_wire(self.params.flow_control),
            CONTROL_FLOW_NONE | CONTROL_FLOW_RTSCTS => {
                if let Some(flow) = flow_from_wire(v) {
                    let mut next = self.params;
                    next.flow_control = flow;
                    self.apply_framing(next).await;
                }
                flow_to_wire(self.params.flow_control)
            }
            CONTROL_BREAK_REQUEST => self.break_reply(),
            CONTROL_BREAK_ON | CONTROL_BREAK_OFF => {
                let on = v == CONTROL_BREAK_ON;
                match self.uart.set_break(on).await {
                    Ok(()) => self.break_on = on,
                    Err(e) => log::warn!("[session:{}] set break failed: {}", self.session_id, e),
                }
                self.break_reply()
            }
            CONTROL_DTR_REQUEST => self.dtr_reply().await,
            CONTROL_DTR_ON | CONTROL_DTR_OFF => {
                let on = v == CONTROL_DTR_ON;
                if let Err(e) = self.uart.set_dtr(on).await {
                    log::warn!("[session:{}] set DTR failed: {}", self.session_id, e);
                }
                self.dtr_reply().await
            }
            CONTROL_RTS_REQUEST => self.rts_reply().await,
            CONTROL_RTS_ON | CONTROL_RTS_OFF => {
                let on = v == CONTROL_RTS_ON;
                if let Err(e) = self.uart.set_rts(on).await {
                    log::warn!("[session:{}] set RTS failed: {}", self.session_id, e);
                }
                self.rts_reply().await
            }
            // Unknown subvalue (including XON/XOFF, which the UART layer
            // does not support): echo the current flow setting.
            _ => flow_to_wire(self.params.flow_control),
        };
        let reply = comport::reply_byte(comport::SET_CONTROL, reply_value);
        self.tcp_egress.extend_from_slice(&reply);
    }

    fn break_reply(&self) -> u8 {
        if self.break_on {
            comport::CONTROL_BREAK_ON
        } else {
            comport::CONTROL_BREAK_OFF
        }
    }

    async fn dtr_reply(&self) -> u8 {
        let dtr = self
            .uart
            .control_lines()
            .await
            .map(|cl| cl.dtr)
            .unwrap_or(false);
        if dtr {
            comport::CONTROL_DTR_ON
        } else {
            comport::CONTROL_DTR_OFF
        }
    }

    async fn rts_reply(&self) -> u8 {
        let rts = self
            .uart
            .control_lines()
            .await
            .map(|cl| cl.rts)
            .unwrap_or(false);
        if rts {
            comport::CONTROL_RTS_ON
        } else {
            comport::CONTROL_RTS_OFF
        }
    }

    /// Reprogram the channel framing. On failure the session keeps the
    /// previous parameters; replies echo whatever is actually in effect.
    async fn apply_framing(&mut self, next: SerialParams) {
        match self.uart.apply_params(&next).await {
            Ok(()) => {
                log::debug!(
                    "[session:{}] framing now {}",
                    self.session_id,
                    next.shorthand()
                );
                self.params = next;
            }
            Err(e) => {
                log::warn!(
                    "[session:{}] reparametrise to {} failed: {}",
                    self.session_id,
                    next.shorthand(),
                    e
                );
            }
        }
    }

    // ── Mailbox ─────────────────────────────────────────────────────

    /// Returns true when the session should stop.
    async fn handle_msg(&mut self, msg: SessionMsg) -> bool {
        match msg {
            SessionMsg::Cancel => {
                log::debug!("[session:{}] cancel requested", self.session_id);
                true
            }
            SessionMsg::Disable => {
                log::info!("[session:{}] port disabled, closing", self.session_id);
                true
            }
            SessionMsg::Reconfig(params) => {
                log::info!(
                    "[session:{}] live reconfig to {}",
                    self.session_id,
                    params.shorthand()
                );
                let before = self.params;
                self.apply_framing(params).await;
                if self.params != before && self.comport_active() {
                    // Tell the peer what the line is running now. Peers
                    // that never enabled COM-port control get nothing.
                    self.tcp_egress
                        .extend_from_slice(&comport::reply_baud(self.params.baud));
                    self.tcp_egress.extend_from_slice(&comport::reply_byte(
                        comport::SET_DATASIZE,
                        comport::data_bits_to_wire(self.params.data_bits),
                    ));
                    self.tcp_egress.extend_from_slice(&comport::reply_byte(
                        comport::SET_PARITY,
                        comport::parity_to_wire(self.params.parity),
                    ));
                    self.tcp_egress.extend_from_slice(&comport::reply_byte(
                        comport::SET_STOPSIZE,
                        comport::stop_bits_to_wire(self.params.stop_bits),
                    ));
                }
                false
            }
        }
    }

    // ── Status notifications ────────────────────────────────────────

    async fn poll_status(&mut self) {
        if !self.comport_active() {
            return;
        }
        if let Ok(lines) = self.uart.control_lines().await {
            let state = comport::modemstate_byte(&lines, self.last_modemstate);
            if (state ^ self.last_modemstate) & 0xF0 != 0 {
                if self.modemstate_mask != 0 {
                    let masked = state & self.modemstate_mask;
                    if masked != 0 {
                        self.tcp_egress
                            .extend_from_slice(&comport::notify_modemstate(masked));
                    }
                }
                self.last_modemstate = state & 0xF0;
            }
        }
        if self.linestate_mask != 0 {
            if let Ok(status) = self.uart.take_line_status().await {
                let byte = comport::linestate_byte(&status) & self.linestate_mask;
                if byte != 0 {
                    self.tcp_egress
                        .extend_from_slice(&comport::notify_linestate(byte));
                }
            }
        }
    }

    // ── Egress flushing ─────────────────────────────────────────────

    /// Partial-progress write toward the UART. Returns false when the
    /// channel is dead.
    async fn flush_uart_egress(&mut self) -> bool {
        if self.uart_egress.is_empty() {
            return true;
        }
        match self.uart.write(&self.uart_egress).await {
            Ok(0) => true,
            Ok(n) => {
                self.uart_egress.drain(..n);
                self.touch();
                true
            }
            Err(e) => {
                log::error!("[session:{}] UART write error: {}", self.session_id, e);
                false
            }
        }
    }

    /// Bounded write toward the client. Returns false when the socket is
    /// dead.
    async fn flush_tcp_egress(&mut self, wr: &mut OwnedWriteHalf) -> bool {
        if self.tcp_egress.is_empty() {
            return true;
        }
        match timeout(WRITE_WAIT, wr.write(&self.tcp_egress)).await {
            // No progress this round; the peer is slow.
            Err(_) => true,
            Ok(Ok(0)) => {
                log::warn!("[session:{}] socket write returned 0", self.session_id);
                false
            }
            Ok(Ok(n)) => {
                self.tcp_egress.drain(..n);
                self.bytes_tx.fetch_add(n as u64, Ordering::Relaxed);
                self.touch();
                true
            }
            Ok(Err(e)) => {
                log::warn!("[session:{}] socket write error: {}", self.session_id, e);
                false
            }
        }
    }

    // ── Teardown ────────────────────────────────────────────────────

    async fn drain_and_close(&mut self, wr: &mut OwnedWriteHalf) {
        self.set_state(SessionState::Draining);
        let deadline = Instant::now() + DRAIN_WAIT;
        while (!self.uart_egress.is_empty() || !self.tcp_egress.is_empty())
            && Instant::now() < deadline
        {
            if !self.flush_uart_egress().await {
                self.uart_egress.clear();
            }
            if !self.flush_tcp_egress(wr).await {
                self.tcp_egress.clear();
            }
            if !self.uart_egress.is_empty() || !self.tcp_egress.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
        let _ = wr.shutdown().await;
        self.set_state(SessionState::Closed);
    }
}
