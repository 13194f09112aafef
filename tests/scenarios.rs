//! End-to-end gateway scenarios over loopback TCP and simulated UARTs.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

use portgate::persist::{spawn_snapshot_writer, ConfigStore, MemoryKv};
use portgate::{PortConfig, PortMode, Registry};
use portgate_serial::{SerialParams, SimulatedUartDriver, UartBinding, UartPort, PIN_UNUSED};

const IAC: u8 = 255;
const SB: u8 = 250;
const SE: u8 = 240;
const WILL: u8 = 251;
const DO: u8 = 253;

fn binding(uart_num: u8) -> UartBinding {
    UartBinding {
        uart_num,
        tx_pin: 17,
        rx_pin: 16,
        rts_pin: PIN_UNUSED,
        cts_pin: PIN_UNUSED,
    }
}

fn port_cfg(port_id: u16, uart_num: u8, mode: PortMode) -> PortConfig {
    PortConfig {
        port_id,
        tcp_port: 0,
        tcp_backlog: 4,
        uart: binding(uart_num),
        params: SerialParams::default(),
        mode,
        idle_timeout_ms: 0,
        enabled: true,
        max_sessions: 1,
    }
}

async fn read_exact(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    timeout(Duration::from_secs(2), stream.read_exact(&mut buf))
        .await
        .expect("timed out waiting for server bytes")
        .expect("read failed");
    buf
}

/// Consume the server's opening option volley and send the accepting
/// client reply, enabling COM-port control.
async fn complete_handshake(client: &mut TcpStream) {
    let volley = read_exact(client, 15).await;
    assert_eq!(
        volley,
        [
            IAC, WILL, 0,
            IAC, DO, 0,
            IAC, WILL, 3,
            IAC, DO, 3,
            IAC, WILL, 44,
        ]
    );
    client
        .write_all(&[IAC, DO, 0, IAC, WILL, 0, IAC, DO, 3, IAC, WILL, 3, IAC, DO, 44])
        .await
        .unwrap();
    // Let the server absorb the acks before anything else happens.
    sleep(Duration::from_millis(150)).await;
}

// ── Telnet handshake and COM-port control ───────────────────────────────

#[tokio::test]
async fn telnet_handshake_then_baud_change() {
    let driver = SimulatedUartDriver::new();
    let registry = Registry::new(driver.clone());
    let port = registry
        .add_port(port_cfg(1, 1, PortMode::Telnet))
        .await
        .unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    complete_handshake(&mut client).await;

    // SET-BAUDRATE 38400.
    client
        .write_all(&[IAC, SB, 44, 1, 0x00, 0x00, 0x96, 0x00, IAC, SE])
        .await
        .unwrap();
    let reply = read_exact(&mut client, 10).await;
    assert_eq!(reply, [IAC, SB, 44, 101, 0x00, 0x00, 0x96, 0x00, IAC, SE]);
    assert_eq!(driver.attach(1).current_params().await.baud, 38400);

    registry.shutdown().await;
}

#[tokio::test]
async fn telnet_baud_query_reports_current() {
    let driver = SimulatedUartDriver::new();
    let registry = Registry::new(driver.clone());
    let port = registry
        .add_port(port_cfg(1, 1, PortMode::Telnet))
        .await
        .unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    complete_handshake(&mut client).await;

    client
        .write_all(&[IAC, SB, 44, 1, 0, 0, 0, 0, IAC, SE])
        .await
        .unwrap();
    let reply = read_exact(&mut client, 10).await;
    // 115200 = 0x0001C200.
    assert_eq!(reply, [IAC, SB, 44, 101, 0x00, 0x01, 0xC2, 0x00, IAC, SE]);

    registry.shutdown().await;
}

#[tokio::test]
async fn telnet_data_keeps_iac_transparency() {
    let driver = SimulatedUartDriver::new();
    let registry = Registry::new(driver.clone());
    let port = registry
        .add_port(port_cfg(1, 1, PortMode::Telnet))
        .await
        .unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    complete_handshake(&mut client).await;

    // Client → UART: doubled 0xFF collapses to one data byte.
    client
        .write_all(&[0x41, IAC, IAC, 0x42])
        .await
        .unwrap();
    sleep(Duration::from_millis(300)).await;
    assert_eq!(driver.attach(1).drain_tx().await, vec![0x41, 0xFF, 0x42]);

    // UART → client: a data 0xFF goes out doubled.
    driver.attach(1).inject_rx(&[0x10, 0xFF, 0x20]).await;
    let out = read_exact(&mut client, 4).await;
    assert_eq!(out, [0x10, IAC, IAC, 0x20]);

    registry.shutdown().await;
}

#[tokio::test]
async fn telnet_set_control_dtr_and_purge() {
    let driver = SimulatedUartDriver::new();
    let registry = Registry::new(driver.clone());
    let port = registry
        .add_port(port_cfg(1, 1, PortMode::Telnet))
        .await
        .unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    complete_handshake(&mut client).await;

    // SET-CONTROL: DTR off (9) → server echoes the effective state.
    client.write_all(&[IAC, SB, 44, 5, 9, IAC, SE]).await.unwrap();
    let reply = read_exact(&mut client, 7).await;
    assert_eq!(reply, [IAC, SB, 44, 105, 9, IAC, SE]);
    let lines = driver.attach(1).control_lines().await.unwrap();
    assert!(!lines.dtr);

    // PURGE-DATA both directions.
    client.write_all(&[IAC, SB, 44, 12, 3, IAC, SE]).await.unwrap();
    let reply = read_exact(&mut client, 7).await;
    assert_eq!(reply, [IAC, SB, 44, 112, 3, IAC, SE]);

    registry.shutdown().await;
}

#[tokio::test]
async fn telnet_modemstate_notify_after_mask() {
    let driver = SimulatedUartDriver::new();
    let registry = Registry::new(driver.clone());
    let port = registry
        .add_port(port_cfg(1, 1, PortMode::Telnet))
        .await
        .unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    complete_handshake(&mut client).await;

    // Enable all modem-state notifications. The 0xFF mask byte is IAC,
    // so it travels doubled inside the subnegotiation both ways.
    client
        .write_all(&[IAC, SB, 44, 11, IAC, IAC, IAC, SE])
        .await
        .unwrap();
    let reply = read_exact(&mut client, 8).await;
    assert_eq!(reply, [IAC, SB, 44, 111, IAC, IAC, IAC, SE]);

    // The first poll reports the baseline: CTS and DSR up, with their
    // delta bits set (0x33).
    let notify = read_exact(&mut client, 7).await;
    assert_eq!(notify, [IAC, SB, 44, 107, 0x33, IAC, SE]);

    // Drop CTS; the transition is pushed.
    sleep(Duration::from_millis(100)).await;
    driver.attach(1).set_inputs(false, true, false, false);
    let notify = read_exact(&mut client, 7).await;
    // DSR still up (0x20) plus delta-CTS (0x01).
    assert_eq!(notify, [IAC, SB, 44, 107, 0x21, IAC, SE]);

    registry.shutdown().await;
}

// ── Raw modes ───────────────────────────────────────────────────────────

#[tokio::test]
async fn raw_mode_is_byte_transparent() {
    let driver = SimulatedUartDriver::new();
    let registry = Registry::new(driver.clone());
    let port = registry
        .add_port(port_cfg(1, 1, PortMode::Raw))
        .await
        .unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(&[0xFF, 0xFF, 0xAA]).await.unwrap();
    sleep(Duration::from_millis(300)).await;
    assert_eq!(driver.attach(1).drain_tx().await, vec![0xFF, 0xFF, 0xAA]);

    driver.attach(1).inject_rx(&[0xFF, 0x01]).await;
    let out = read_exact(&mut client, 2).await;
    assert_eq!(out, [0xFF, 0x01]);

    registry.shutdown().await;
}

#[tokio::test]
async fn rawlp_mode_discards_client_bytes() {
    let driver = SimulatedUartDriver::new();
    let registry = Registry::new(driver.clone());
    let port = registry
        .add_port(port_cfg(1, 1, PortMode::RawLp))
        .await
        .unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(b"ignored").await.unwrap();
    sleep(Duration::from_millis(300)).await;
    assert!(driver.attach(1).drain_tx().await.is_empty());

    // The UART→client path still works.
    driver.attach(1).inject_rx(b"out").await;
    let out = read_exact(&mut client, 3).await;
    assert_eq!(out, b"out");

    registry.shutdown().await;
}

// ── Idle timeout ────────────────────────────────────────────────────────

#[tokio::test]
async fn idle_session_closes_with_fin() {
    let driver = SimulatedUartDriver::new();
    let registry = Registry::new(driver.clone());
    let mut cfg = port_cfg(1, 1, PortMode::Telnet);
    cfg.idle_timeout_ms = 500;
    let port = registry.add_port(cfg).await.unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    complete_handshake(&mut client).await;

    // Exchange one byte, then go quiet.
    client.write_all(b"A").await.unwrap();
    sleep(Duration::from_millis(150)).await;
    assert_eq!(driver.attach(1).drain_tx().await, b"A");
    assert_eq!(registry.list_sessions().len(), 1);

    // The server closes cleanly once the timeout elapses.
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("expected FIN before the timeout")
        .expect("expected orderly close");
    assert_eq!(n, 0);

    sleep(Duration::from_millis(100)).await;
    assert!(registry.list_sessions().is_empty());

    registry.shutdown().await;
}

// ── Registry interplay ──────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_tcp_port_is_rejected() {
    let registry = Registry::new(SimulatedUartDriver::new());
    let port = registry
        .add_port(port_cfg(1, 1, PortMode::Telnet))
        .await
        .unwrap();

    let mut dup = port_cfg(2, 2, PortMode::Raw);
    dup.tcp_port = port;
    let err = registry.add_port(dup).await.unwrap_err();
    assert_eq!(err.kind, portgate::ErrorKind::AlreadyExists);
    assert_eq!(registry.copy_ports().len(), 1);

    registry.shutdown().await;
}

#[tokio::test]
async fn live_reconfig_notifies_and_keeps_session() {
    let driver = SimulatedUartDriver::new();
    let registry = Registry::new(driver.clone());
    let port = registry
        .add_port(port_cfg(1, 1, PortMode::Telnet))
        .await
        .unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    complete_handshake(&mut client).await;

    let params = SerialParams {
        baud: 9600,
        ..Default::default()
    };
    registry
        .update_serial_config(port, params, None, true, None)
        .await
        .unwrap();

    // The session reports the new framing: baud, then data size, parity,
    // stop size. 9600 = 0x00002580.
    let notify = read_exact(&mut client, 10).await;
    assert_eq!(notify, [IAC, SB, 44, 101, 0x00, 0x00, 0x25, 0x80, IAC, SE]);
    let notify = read_exact(&mut client, 7).await;
    assert_eq!(notify, [IAC, SB, 44, 102, 8, IAC, SE]);
    let notify = read_exact(&mut client, 7).await;
    assert_eq!(notify, [IAC, SB, 44, 103, 1, IAC, SE]);
    let notify = read_exact(&mut client, 7).await;
    assert_eq!(notify, [IAC, SB, 44, 104, 1, IAC, SE]);

    assert_eq!(driver.attach(1).current_params().await.baud, 9600);

    // The session survived and still pumps data.
    assert_eq!(registry.list_sessions().len(), 1);
    client.write_all(b"x").await.unwrap();
    sleep(Duration::from_millis(300)).await;
    assert_eq!(driver.attach(1).drain_tx().await, b"x");

    registry.shutdown().await;
}

#[tokio::test]
async fn pin_override_requires_quiescent_port() {
    let driver = SimulatedUartDriver::new();
    let registry = Registry::new(driver.clone());
    let port = registry
        .add_port(port_cfg(1, 1, PortMode::Raw))
        .await
        .unwrap();

    let _client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(registry.list_sessions().len(), 1);

    let mut pins = binding(1);
    pins.tx_pin = 21;
    let err = registry
        .update_serial_config(port, SerialParams::default(), None, false, Some(pins))
        .await
        .unwrap_err();
    assert_eq!(err.kind, portgate::ErrorKind::Conflict);

    // After the session is gone the override applies.
    registry.disconnect_tcp_port(port);
    sleep(Duration::from_millis(300)).await;
    registry
        .update_serial_config(port, SerialParams::default(), None, false, Some(pins))
        .await
        .unwrap();
    assert_eq!(registry.find_port(port).unwrap().uart.tx_pin, 21);

    registry.shutdown().await;
}

#[tokio::test]
async fn admission_control_refuses_second_client() {
    let driver = SimulatedUartDriver::new();
    let registry = Registry::new(driver.clone());
    let port = registry
        .add_port(port_cfg(1, 1, PortMode::Raw))
        .await
        .unwrap();

    let mut first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(registry.list_sessions().len(), 1);

    // The second client is closed immediately.
    let mut second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut buf = [0u8; 8];
    let closed = timeout(Duration::from_secs(2), second.read(&mut buf)).await;
    match closed {
        Ok(Ok(0)) | Ok(Err(_)) => {}
        other => panic!("expected immediate close, got {:?}", other),
    }
    assert_eq!(registry.list_sessions().len(), 1);

    // The first client still owns the line.
    first.write_all(b"still here").await.unwrap();
    sleep(Duration::from_millis(300)).await;
    assert_eq!(driver.attach(1).drain_tx().await, b"still here");

    registry.shutdown().await;
}

#[tokio::test]
async fn disconnect_cancels_live_session() {
    let driver = SimulatedUartDriver::new();
    let registry = Registry::new(driver.clone());
    let port = registry
        .add_port(port_cfg(1, 1, PortMode::Raw))
        .await
        .unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    sleep(Duration::from_millis(200)).await;

    assert!(registry.disconnect_tcp_port(port));
    let mut buf = [0u8; 8];
    let n = timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("expected close after disconnect")
        .unwrap_or(0);
    assert_eq!(n, 0);

    sleep(Duration::from_millis(100)).await;
    assert!(registry.list_sessions().is_empty());
    assert!(!registry.disconnect_tcp_port(port));

    registry.shutdown().await;
}

#[tokio::test]
async fn remove_port_stops_accepting() {
    let registry = Registry::new(SimulatedUartDriver::new());
    let port = registry
        .add_port(port_cfg(1, 1, PortMode::Raw))
        .await
        .unwrap();

    registry.remove_port(port).await.unwrap();
    assert!(registry.copy_ports().is_empty());
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

// ── Persistence ─────────────────────────────────────────────────────────

#[tokio::test]
async fn ports_survive_a_reboot() {
    let store = ConfigStore::new(MemoryKv::new());

    // First life: configure two ports; the writer persists each change.
    let registry = Registry::new(SimulatedUartDriver::new());
    let (tx, rx) = mpsc::unbounded_channel();
    registry.set_change_listener(tx);
    let writer = spawn_snapshot_writer(store.clone(), rx);

    registry
        .add_port(port_cfg(1, 1, PortMode::Telnet))
        .await
        .unwrap();
    let mut second = port_cfg(2, 2, PortMode::Raw);
    second.idle_timeout_ms = 30_000;
    registry.add_port(second).await.unwrap();

    sleep(Duration::from_millis(200)).await;
    let before = registry.copy_ports();
    registry.shutdown().await;

    assert_eq!(store.load_ports().unwrap(), before);

    // Second life: reload from the store.
    let reborn = Registry::new(SimulatedUartDriver::new());
    for cfg in store.load_ports().unwrap() {
        reborn.add_port(cfg).await.unwrap();
    }
    assert_eq!(reborn.copy_ports(), before);

    reborn.shutdown().await;
    writer.abort();
}
