//! UART transport abstraction.
//!
//! Platform-agnostic traits for a UART channel and the driver that hands
//! them out. A real back-end programs hardware; the simulated variant here
//! keeps everything in memory so the gateway can be exercised on a host
//! without any serial silicon attached.

use crate::uart::types::*;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, Notify};
use tokio::time::Duration;

/// Bound on a single blocking read attempt. The caller's pump loop decides
/// how often to come back; the transport never parks longer than this.
const READ_WAIT: Duration = Duration::from_millis(50);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Transport traits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An open UART channel.
///
/// Implementations must be `Send + Sync` so a channel can be held behind an
/// `Arc` and polled from the session task while observers read line state.
#[async_trait::async_trait]
pub trait UartPort: Send + Sync + std::fmt::Debug {
    /// Reprogram the framing. Pending TX is drained first; bytes written
    /// after this returns use the new parameters.
    async fn apply_params(&self, params: &SerialParams) -> Result<(), UartError>;

    /// Read up to `buf.len()` bytes. Waits a short bounded interval for
    /// data; `Ok(0)` means the interval elapsed with nothing to deliver.
    async fn read(&self, buf: &mut [u8]) -> Result<usize, UartError>;

    /// Write bytes, returning how many were accepted. Partial writes are
    /// legitimate when the transmit path is congested.
    async fn write(&self, buf: &[u8]) -> Result<usize, UartError>;

    /// Push any buffered output toward the wire.
    async fn flush(&self) -> Result<(), UartError>;

    /// Wait until all accepted output has physically left the device.
    async fn drain(&self) -> Result<(), UartError>;

    /// Assert break for `duration_ms`, then release it.
    async fn send_break(&self, duration_ms: u32) -> Result<(), UartError>;

    /// Assert or release the break condition.
    async fn set_break(&self, on: bool) -> Result<(), UartError>;

    /// Set DTR. Authoritative only while hardware flow control is off.
    async fn set_dtr(&self, state: bool) -> Result<(), UartError>;

    /// Set RTS. Authoritative only while hardware flow control is off.
    async fn set_rts(&self, state: bool) -> Result<(), UartError>;

    /// Current modem line state.
    async fn control_lines(&self) -> Result<ControlLines, UartError>;

    /// Latched receive error flags, cleared by this read.
    async fn take_line_status(&self) -> Result<LineStatus, UartError>;

    /// Discard buffered data in the given direction.
    async fn purge(&self, dir: PurgeDirection) -> Result<(), UartError>;

    /// Release the channel. Idempotent.
    fn close(&self);

    /// Whether the channel is open.
    fn is_open(&self) -> bool;

    /// The peripheral this channel is bound to.
    fn uart_num(&self) -> u8;
}

/// Factory for UART channels. One driver instance serves the whole
/// gateway; peripherals are exclusive, so a second `open` of the same
/// `uart_num` fails with [`UartErrorKind::Busy`].
#[async_trait::async_trait]
pub trait UartDriver: Send + Sync {
    async fn open(
        &self,
        binding: &UartBinding,
        params: &SerialParams,
    ) -> Result<Arc<dyn UartPort>, UartError>;

    /// Highest valid GPIO number on this platform.
    fn max_pin(&self) -> i16;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Simulated port (tests & host builds)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A fully in-memory UART.
///
/// Bytes written by the channel owner land in the TX buffer where a test
/// can collect them; a test injects RX bytes that the owner then reads.
/// Control lines and line-status flags can be flipped from the outside to
/// exercise the notification paths.
#[derive(Debug)]
pub struct SimulatedUart {
    uart_num: u8,
    open: AtomicBool,
    break_asserted: AtomicBool,
    params: Mutex<SerialParams>,
    rx_buf: Mutex<VecDeque<u8>>,
    tx_buf: Mutex<VecDeque<u8>>,
    control_lines: StdMutex<ControlLines>,
    line_status: StdMutex<LineStatus>,
    rx_notify: Notify,
    loopback: AtomicBool,
}

impl SimulatedUart {
    pub fn new(uart_num: u8) -> Arc<Self> {
        Arc::new(Self {
            uart_num,
            open: AtomicBool::new(false),
            break_asserted: AtomicBool::new(false),
            params: Mutex::new(SerialParams::default()),
            rx_buf: Mutex::new(VecDeque::with_capacity(4096)),
            tx_buf: Mutex::new(VecDeque::with_capacity(4096)),
            control_lines: StdMutex::new(ControlLines::default()),
            line_status: StdMutex::new(LineStatus::default()),
            rx_notify: Notify::new(),
            loopback: AtomicBool::new(false),
        })
    }

    /// Enable loopback mode (TX data is immediately available in RX).
    pub fn set_loopback(&self, enabled: bool) {
        self.loopback.store(enabled, Ordering::SeqCst);
    }

    /// Inject bytes into the receive buffer (simulate the wire).
    pub async fn inject_rx(&self, data: &[u8]) {
        let mut buf = self.rx_buf.lock().await;
        buf.extend(data);
        self.rx_notify.notify_waiters();
    }

    /// Drain all bytes from the transmit buffer (for test assertions).
    pub async fn drain_tx(&self) -> Vec<u8> {
        let mut buf = self.tx_buf.lock().await;
        buf.drain(..).collect()
    }

    /// Peek at the transmit buffer contents without draining.
    pub async fn peek_tx(&self) -> Vec<u8> {
        let buf = self.tx_buf.lock().await;
        buf.iter().copied().collect()
    }

    /// Flip the peer-driven modem inputs (CTS/DSR/RI/DCD).
    pub fn set_inputs(&self, cts: bool, dsr: bool, ri: bool, dcd: bool) {
        let mut cl = self.control_lines.lock().unwrap();
        cl.cts = cts;
        cl.dsr = dsr;
        cl.ri = ri;
        cl.dcd = dcd;
    }

    /// Latch a line-status condition, as the receiver hardware would.
    pub fn raise_line_status(&self, status: LineStatus) {
        let mut ls = self.line_status.lock().unwrap();
        ls.break_detected |= status.break_detected;
        ls.overrun |= status.overrun;
        ls.parity_error |= status.parity_error;
        ls.framing_error |= status.framing_error;
    }

    /// Framing currently programmed into the port.
    pub async fn current_params(&self) -> SerialParams {
        *self.params.lock().await
    }

    /// Whether break is currently asserted.
    pub fn break_asserted(&self) -> bool {
        self.break_asserted.load(Ordering::SeqCst)
    }

    fn mark_open(&self, params: &SerialParams) -> Result<(), UartError> {
        if self.open.swap(true, Ordering::SeqCst) {
            return Err(UartError::busy(self.uart_num));
        }
        // Leave RX/TX from an earlier life cleared.
        if let Ok(mut cl) = self.control_lines.lock() {
            cl.dtr = true;
            cl.rts = params.flow_control == FlowControl::None;
            cl.cts = true;
            cl.dsr = true;
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), UartError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(UartError::not_open())
        }
    }
}

#[async_trait::async_trait]
impl UartPort for SimulatedUart {
    async fn apply_params(&self, params: &SerialParams) -> Result<(), UartError> {
        self.ensure_open()?;
        if params.baud == 0 {
            return Err(UartError::invalid("baud rate must be nonzero"));
        }
        let mut cur = self.params.lock().await;
        *cur = *params;
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, UartError> {
        self.ensure_open()?;
        let mut rx = self.rx_buf.lock().await;
        if rx.is_empty() {
            drop(rx);
            tokio::select! {
                _ = self.rx_notify.notified() => {},
                _ = tokio::time::sleep(READ_WAIT) => {},
            }
            rx = self.rx_buf.lock().await;
        }
        let count = buf.len().min(rx.len());
        for b in buf.iter_mut().take(count) {
            *b = rx.pop_front().unwrap();
        }
        Ok(count)
    }

    async fn write(&self, buf: &[u8]) -> Result<usize, UartError> {
        self.ensure_open()?;
        let mut tx = self.tx_buf.lock().await;
        tx.extend(buf);
        drop(tx);

        if self.loopback.load(Ordering::SeqCst) {
            self.inject_rx(buf).await;
        }
        Ok(buf.len())
    }

    async fn flush(&self) -> Result<(), UartError> {
        self.ensure_open()
    }

    async fn drain(&self) -> Result<(), UartError> {
        self.ensure_open()
    }

    async fn send_break(&self, duration_ms: u32) -> Result<(), UartError> {
        self.ensure_open()?;
        self.break_asserted.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(duration_ms.min(1000) as u64)).await;
        self.break_asserted.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn set_break(&self, on: bool) -> Result<(), UartError> {
        self.ensure_open()?;
        self.break_asserted.store(on, Ordering::SeqCst);
        Ok(())
    }

    async fn set_dtr(&self, state: bool) -> Result<(), UartError> {
        self.ensure_open()?;
        let mut cl = self.control_lines.lock().unwrap();
        cl.dtr = state;
        Ok(())
    }

    async fn set_rts(&self, state: bool) -> Result<(), UartError> {
        self.ensure_open()?;
        let params = self.params.lock().await;
        if params.flow_control == FlowControl::RtsCts {
            // RTS belongs to the hardware while flow control is on.
            return Ok(());
        }
        drop(params);
        let mut cl = self.control_lines.lock().unwrap();
        cl.rts = state;
        Ok(())
    }

    async fn control_lines(&self) -> Result<ControlLines, UartError> {
        self.ensure_open()?;
        Ok(*self.control_lines.lock().unwrap())
    }

    async fn take_line_status(&self) -> Result<LineStatus, UartError> {
        self.ensure_open()?;
        let mut ls = self.line_status.lock().unwrap();
        Ok(std::mem::take(&mut *ls))
    }

    async fn purge(&self, dir: PurgeDirection) -> Result<(), UartError> {
        self.ensure_open()?;
        if matches!(dir, PurgeDirection::Receive | PurgeDirection::Both) {
            self.rx_buf.lock().await.clear();
        }
        if matches!(dir, PurgeDirection::Transmit | PurgeDirection::Both) {
            self.tx_buf.lock().await.clear();
        }
        Ok(())
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            if let Ok(mut cl) = self.control_lines.lock() {
                *cl = ControlLines::default();
            }
            self.rx_notify.notify_waiters();
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn uart_num(&self) -> u8 {
        self.uart_num
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Simulated driver
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Driver handing out [`SimulatedUart`] channels.
///
/// One instance per peripheral number lives for the driver's lifetime, so
/// a test can [`attach`](Self::attach) to the same buffers the gateway's
/// session is pumping.
pub struct SimulatedUartDriver {
    ports: StdMutex<HashMap<u8, Arc<SimulatedUart>>>,
    max_pin: i16,
}

impl SimulatedUartDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ports: StdMutex::new(HashMap::new()),
            max_pin: 48,
        })
    }

    /// Fetch (creating if needed) the simulated peripheral, without
    /// opening it. Tests use this to inject and drain bytes.
    pub fn attach(&self, uart_num: u8) -> Arc<SimulatedUart> {
        let mut ports = self.ports.lock().unwrap();
        ports
            .entry(uart_num)
            .or_insert_with(|| SimulatedUart::new(uart_num))
            .clone()
    }
}

#[async_trait::async_trait]
impl UartDriver for SimulatedUartDriver {
    async fn open(
        &self,
        binding: &UartBinding,
        params: &SerialParams,
    ) -> Result<Arc<dyn UartPort>, UartError> {
        if !binding.pins_valid(self.max_pin) {
            return Err(UartError::invalid(format!(
                "pin assignment out of range for UART{}",
                binding.uart_num
            )));
        }
        let port = self.attach(binding.uart_num);
        port.mark_open(params)?;
        if let Err(e) = port.apply_params(params).await {
            port.close();
            return Err(e);
        }
        log::debug!(
            "[uart:{}] opened at {}",
            binding.uart_num,
            params.shorthand()
        );
        Ok(port)
    }

    fn max_pin(&self) -> i16 {
        self.max_pin
    }
}
