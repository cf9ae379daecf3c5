//! Integration tests for the Modbus station.
//!
//! TCP scenarios run against a real listener on an ephemeral port; RTU
//! scenarios drive the frame assembler and router directly, since the CRC,
//! length-oracle and timer-flush behavior is what matters and needs no
//! serial hardware.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use modbus_station::transport::{build_rtu_response, crc16, parse_rtu_frame, RtuFrameAssembler};
use modbus_station::{
    ConfigFormat, FileAddressStore, ModbusDataStore, ModbusFileStore, ModbusServer, ModbusStation,
    PduRouter, ServerMetrics,
};

const IO_TIMEOUT: Duration = Duration::from_secs(2);

async fn start_station() -> (ModbusStation, std::net::SocketAddr) {
    let mut station = ModbusStation::new();
    station.start_tcp(0).await.expect("bind failed");
    let addr = station.tcp_local_addr().expect("no local addr");
    (station, addr)
}

async fn exchange(stream: &mut TcpStream, request: &[u8], response_len: usize) -> Vec<u8> {
    timeout(IO_TIMEOUT, stream.write_all(request))
        .await
        .expect("write timeout")
        .expect("write failed");
    let mut response = vec![0u8; response_len];
    timeout(IO_TIMEOUT, stream.read_exact(&mut response))
        .await
        .expect("read timeout")
        .expect("read failed");
    response
}

/// FC 3 against seeded registers returns the stored words big-endian, with
/// the transaction id echoed.
#[tokio::test]
async fn test_tcp_read_holding_registers() {
    let (station, addr) = start_station().await;
    station
        .data_store()
        .write_holding_registers(0, &[0x000A, 0x000B, 0x000C, 0x000D])
        .unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = hex::decode("000100000006010300000004").unwrap();
    let response = exchange(&mut stream, &request, 17).await;
    assert_eq!(
        response,
        hex::decode("00010000000b010308000a000b000c000d").unwrap()
    );
}

/// FC 6 echoes the request and the write is visible to a following FC 3.
#[tokio::test]
async fn test_tcp_write_single_register_and_read_back() {
    let (_station, addr) = start_station().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let request = hex::decode("000200000006010600101234").unwrap();
    let response = exchange(&mut stream, &request, 12).await;
    assert_eq!(response, request);

    let request = hex::decode("000300000006010300100001").unwrap();
    let response = exchange(&mut stream, &request, 11).await;
    assert_eq!(response, hex::decode("0003000000050103021234").unwrap());
}

/// FC 5 with a register value other than 0x0000/0xFF00 is an
/// IllegalDataValue exception.
#[tokio::test]
async fn test_tcp_write_coil_illegal_value() {
    let (_station, addr) = start_station().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let request = hex::decode("000300000006010500001234").unwrap();
    let response = exchange(&mut stream, &request, 9).await;
    assert_eq!(response, hex::decode("000300000003018503").unwrap());
}

/// FC 16 answers `{start, quantity}` and both registers land in the store.
#[tokio::test]
async fn test_tcp_write_multiple_registers() {
    let (station, addr) = start_station().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let request = hex::decode("00040000000b0110000000020400aa00bb").unwrap();
    let response = exchange(&mut stream, &request, 12).await;
    assert_eq!(response, hex::decode("000400000006011000000002").unwrap());

    let store = station.data_store();
    assert_eq!(store.read_holding_register(0), 0x00AA);
    assert_eq!(store.read_holding_register(1), 0x00BB);
}

/// Any unsupported function code is answered `{FC | 0x80, 0x01}`.
#[tokio::test]
async fn test_tcp_unsupported_function() {
    let (_station, addr) = start_station().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let request = hex::decode("00aa00000006016300000001").unwrap();
    let response = exchange(&mut stream, &request, 9).await;
    assert_eq!(response, hex::decode("00aa0000000301e301").unwrap());
}

/// A request split across several TCP segments is reassembled, and two
/// requests in one segment are answered separately.
#[tokio::test]
async fn test_tcp_split_and_pipelined_delivery() {
    let (station, addr) = start_station().await;
    station.data_store().write_holding_register(5, 0xBEEF);

    let mut stream = TcpStream::connect(addr).await.unwrap();

    // split: header in one segment, body in another
    let request = hex::decode("001000000006010300050001").unwrap();
    stream.write_all(&request[..6]).await.unwrap();
    sleep(Duration::from_millis(50)).await;
    stream.write_all(&request[6..]).await.unwrap();

    let mut response = vec![0u8; 11];
    timeout(IO_TIMEOUT, stream.read_exact(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, hex::decode("001000000005010302beef").unwrap());

    // pipelined: two complete requests in one write
    let first = hex::decode("002000000006010300050001").unwrap();
    let second = hex::decode("002100000006010100000008").unwrap();
    let mut both = first;
    both.extend_from_slice(&second);
    stream.write_all(&both).await.unwrap();

    let mut responses = vec![0u8; 11 + 10];
    timeout(IO_TIMEOUT, stream.read_exact(&mut responses))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        &responses[..11],
        &hex::decode("002000000005010302beef").unwrap()[..]
    );
    assert_eq!(
        &responses[11..],
        &hex::decode("00210000000401010100").unwrap()[..]
    );
}

/// Concurrent connections get their own framing and all are served.
#[tokio::test]
async fn test_tcp_concurrent_connections() {
    let (station, addr) = start_station().await;
    station.data_store().write_holding_register(0, 0x0042);

    let mut tasks = Vec::new();
    for txid in 1u16..=4 {
        let task = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            let mut request = txid.to_be_bytes().to_vec();
            request.extend_from_slice(&hex::decode("00000006010300000001").unwrap());
            let response = exchange(&mut stream, &request, 11).await;
            assert_eq!(&response[..2], &txid.to_be_bytes());
            assert_eq!(&response[9..], &[0x00, 0x42]);
        });
        tasks.push(task);
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(station.request_count(), 4);
    assert_eq!(station.last_function_code(), 0x03);
}

/// File-record write then read over TCP: the write echoes the request PDU,
/// the read's sub-response layout counts the SubRespLen byte inside
/// ByteCount.
#[tokio::test]
async fn test_tcp_file_record_round_trip() {
    let (_station, addr) = start_station().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // write records 0..2 of file 1 (auto-created)
    let request = hex::decode("00050000000e01150b0600010000000200112233").unwrap();
    let response = exchange(&mut stream, &request, request.len()).await;
    assert_eq!(response, request);

    // read them back: PDU 14 06 05 06 00 11 22 33
    let request = hex::decode("00060000000a01140706000100000002").unwrap();
    let response = exchange(&mut stream, &request, 15).await;
    assert_eq!(
        response,
        hex::decode("000600000009011406050600112233").unwrap()
    );
}

/// Non-zero MBAP protocol id frames are dropped without closing the
/// connection.
#[tokio::test]
async fn test_tcp_bad_protocol_id_dropped() {
    let (_station, addr) = start_station().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let bad = hex::decode("000100010006010300000001").unwrap();
    stream.write_all(&bad).await.unwrap();

    // no response for the dropped frame; a valid follow-up still works
    let good = hex::decode("000200000006010300000001").unwrap();
    let response = exchange(&mut stream, &good, 11).await;
    assert_eq!(&response[..2], &[0x00, 0x02]);
}

/// After `stop`, clients get no further responses.
#[tokio::test]
async fn test_tcp_stop_silences_clients() {
    let (mut station, addr) = start_station().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // sanity: the connection works before the stop
    let request = hex::decode("000100000006010300000001").unwrap();
    let _ = exchange(&mut stream, &request, 11).await;

    station.stop().await.unwrap();
    assert!(!station.is_running());
    sleep(Duration::from_millis(100)).await;

    let _ = stream.write_all(&request).await;
    let mut buf = [0u8; 16];
    let n = timeout(IO_TIMEOUT, stream.read(&mut buf))
        .await
        .expect("expected EOF, not silence")
        .unwrap_or(0);
    assert_eq!(n, 0, "server answered after stop");
}

/// Starting TCP a second time replaces the first listener.
#[tokio::test]
async fn test_restart_switches_listener() {
    let (mut station, first_addr) = start_station().await;
    station.start_tcp(0).await.unwrap();
    let second_addr = station.tcp_local_addr().unwrap();
    assert_ne!(first_addr, second_addr);

    sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect(first_addr).await.is_err());

    let mut stream = TcpStream::connect(second_addr).await.unwrap();
    let request = hex::decode("000100000006010300000001").unwrap();
    let response = exchange(&mut stream, &request, 11).await;
    assert_eq!(&response[..2], &[0x00, 0x01]);
}

/// Seeding from a parsed configuration is visible over the wire.
#[tokio::test]
async fn test_seed_config_visible_over_tcp() {
    let (station, addr) = start_station().await;
    let points = modbus_station::config::parse_content(
        "16\tflow\tholding\t305419896\t\t\t\t\t\tuint32\n",
        ConfigFormat::Tsv,
    )
    .unwrap();
    station.apply_seed_points(&points).unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = hex::decode("000100000006010300100002").unwrap();
    let response = exchange(&mut stream, &request, 13).await;
    assert_eq!(&response[9..], &hex::decode("12345678").unwrap()[..]);
}

// ---- RTU framing against the router ----

fn rtu_router(store: Arc<ModbusDataStore>) -> PduRouter {
    PduRouter::new(
        store,
        Arc::new(ModbusFileStore::new()),
        Arc::new(FileAddressStore::new()),
        Arc::new(ServerMetrics::new()),
    )
}

fn rtu_frame(body: &[u8]) -> Vec<u8> {
    let mut frame = body.to_vec();
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// RTU round trip: request framed with CRC, response framed with CRC, with
/// the slave address echoed.
#[test]
fn test_rtu_round_trip() {
    let store = Arc::new(ModbusDataStore::new());
    store.write_holding_register(0, 0x1234);
    let router = rtu_router(store);

    let frame = rtu_frame(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]);
    let (address, pdu) = parse_rtu_frame(&frame).unwrap();
    assert_eq!(address, 0x01);

    let response_pdu = router.route(pdu);
    let response = build_rtu_response(address, &response_pdu);
    assert_eq!(response, rtu_frame(&[0x01, 0x03, 0x02, 0x12, 0x34]));
}

/// A frame delivered in two chunks completes exactly when the length
/// oracle is satisfied, never earlier.
#[test]
fn test_rtu_split_delivery() {
    let frame = rtu_frame(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]);
    let mut assembler = RtuFrameAssembler::new();

    assembler.extend(&frame[..3]);
    assert!(assembler.try_complete().is_none());

    assembler.extend(&frame[3..]);
    assert_eq!(assembler.try_complete().unwrap(), frame);
}

/// A truncated frame is never completed by the length oracle; it only
/// comes out through the idle-timer flush, where CRC validation rejects
/// it.
#[test]
fn test_rtu_truncated_frame_waits_for_timer() {
    let frame = rtu_frame(&[0x01, 0x10, 0x00, 0x00, 0x00, 0x02, 0x04, 0x00, 0xAA, 0x00, 0xBB]);
    let mut assembler = RtuFrameAssembler::new();

    // everything but the last data byte and the CRC
    assembler.extend(&frame[..10]);
    assert!(assembler.try_complete().is_none());

    let flushed = assembler.flush().unwrap();
    assert!(parse_rtu_frame(&flushed).is_none());
}

/// Corrupted CRC drops the frame with no response.
#[test]
fn test_rtu_crc_failure_dropped() {
    let mut frame = rtu_frame(&[0x01, 0x06, 0x00, 0x01, 0x00, 0x03]);
    let last = frame.len() - 1;
    frame[last] ^= 0x55;
    assert!(parse_rtu_frame(&frame).is_none());
}

/// Write-multiple frames are sized by the embedded byte count.
#[test]
fn test_rtu_write_multiple_length_oracle() {
    let store = Arc::new(ModbusDataStore::new());
    let router = rtu_router(store.clone());

    let frame = rtu_frame(&[0x01, 0x10, 0x00, 0x00, 0x00, 0x02, 0x04, 0x00, 0xAA, 0x00, 0xBB]);
    let mut assembler = RtuFrameAssembler::new();

    // byte count not yet readable
    assembler.extend(&frame[..6]);
    assert!(assembler.try_complete().is_none());

    assembler.extend(&frame[6..]);
    let complete = assembler.try_complete().unwrap();
    let (address, pdu) = parse_rtu_frame(&complete).unwrap();
    let response_pdu = router.route(pdu);
    let response = build_rtu_response(address, &response_pdu);

    assert_eq!(response, rtu_frame(&[0x01, 0x10, 0x00, 0x00, 0x00, 0x02]));
    assert_eq!(store.read_holding_register(0), 0x00AA);
    assert_eq!(store.read_holding_register(1), 0x00BB);
}
