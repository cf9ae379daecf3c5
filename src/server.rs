//! Station facade: owns the stores and the transports.
//!
//! One `ModbusStation` serves a single transport at a time. Starting TCP
//! while RTU runs (or vice versa) stops the running transport first;
//! `stop` tears down the listener or serial port, closes client
//! connections, and drops their reassembly buffers. Transport tasks hold
//! only `Arc` handles, so the facade can be dropped or restarted without
//! tearing state out from under in-flight requests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::sleep;
use tokio_serial::SerialStream;

use crate::config::{self, SeedPoint};
use crate::data_store::{ChangeSink, DataStoreStats, ModbusDataStore};
use crate::error::{ModbusError, ModbusResult};
use crate::file_store::{FileAddressStore, ModbusFileStore};
use crate::logging::CallbackLogger;
use crate::router::{PduRouter, ServerMetrics};
use crate::transport::{
    build_rtu_response, build_tcp_response, parse_rtu_frame, rtu_idle_interval, MbapHeader,
    RtuFrameAssembler, TcpFrameBuffer,
};
use crate::MAX_RTU_FRAME_SIZE;

/// Which transport the station is serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Tcp,
    Rtu,
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportMode::Tcp => f.write_str("TCP"),
            TransportMode::Rtu => f.write_str("RTU"),
        }
    }
}

/// Observability snapshot for an embedding application.
#[derive(Debug, Clone)]
pub struct StationStats {
    pub running: bool,
    pub mode: Option<TransportMode>,
    pub status_message: String,
    pub request_count: u64,
    pub last_function_code: u8,
    pub data_store: DataStoreStats,
}

/// Control surface the excluded presentation layer talks to.
#[async_trait]
pub trait ModbusServer: Send + Sync {
    /// Stop whichever transport is running.
    async fn stop(&mut self) -> ModbusResult<()>;

    /// Whether a transport is currently serving.
    fn is_running(&self) -> bool;

    /// Snapshot of the observability surface.
    fn stats(&self) -> StationStats;
}

/// The Modbus slave station.
pub struct ModbusStation {
    data_store: Arc<ModbusDataStore>,
    file_store: Arc<ModbusFileStore>,
    address_store: Arc<FileAddressStore>,
    router: Arc<PduRouter>,
    metrics: Arc<ServerMetrics>,
    trace: CallbackLogger,
    running: Arc<AtomicBool>,
    mode: Arc<Mutex<Option<TransportMode>>>,
    status: Arc<Mutex<String>>,
    tcp_local_addr: Arc<Mutex<Option<SocketAddr>>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
}

impl ModbusStation {
    pub fn new() -> Self {
        let data_store = Arc::new(ModbusDataStore::new());
        let file_store = Arc::new(ModbusFileStore::new());
        let address_store = Arc::new(FileAddressStore::new());
        let metrics = Arc::new(ServerMetrics::new());
        let router = Arc::new(PduRouter::new(
            data_store.clone(),
            file_store.clone(),
            address_store.clone(),
            metrics.clone(),
        ));

        Self {
            data_store,
            file_store,
            address_store,
            router,
            metrics,
            trace: CallbackLogger::disabled(),
            running: Arc::new(AtomicBool::new(false)),
            mode: Arc::new(Mutex::new(None)),
            status: Arc::new(Mutex::new(String::new())),
            tcp_local_addr: Arc::new(Mutex::new(None)),
            shutdown_tx: None,
        }
    }

    /// Install the packet-trace logger. Takes effect for transports started
    /// afterwards.
    pub fn set_trace_logger(&mut self, logger: CallbackLogger) {
        self.trace = logger;
    }

    /// The process image, for application-side reads, writes and seeding.
    pub fn data_store(&self) -> Arc<ModbusDataStore> {
        self.data_store.clone()
    }

    /// The record file store.
    pub fn file_store(&self) -> Arc<ModbusFileStore> {
        self.file_store.clone()
    }

    /// The flat file-address store.
    pub fn address_store(&self) -> Arc<FileAddressStore> {
        self.address_store.clone()
    }

    /// Register a change sink on the process image.
    pub fn subscribe_changes(&self, sink: ChangeSink) {
        self.data_store.subscribe(sink);
    }

    /// Seed the default process image: the first hundred addresses of each
    /// region, two record files, and a flat file-address window.
    pub fn initialize_data(&self) {
        self.data_store.initialize_coils(0, 100, false);
        self.data_store.initialize_discrete_inputs(0, 100, false);
        self.data_store.initialize_holding_registers(0, 100, 0);
        self.data_store.initialize_input_registers(0, 100, 0);

        self.file_store.create_file(1, "temperature log", 256);
        self.file_store.create_file(2, "status log", 128);

        self.address_store.initialize_region(1000, 200);

        info!("data stores initialized");
    }

    /// Seed the process image from parsed configuration points.
    pub fn apply_seed_points(&self, points: &[SeedPoint]) -> ModbusResult<()> {
        config::apply_seed_points(&self.data_store, points)
    }

    /// Address the TCP listener actually bound (useful with port 0).
    pub fn tcp_local_addr(&self) -> Option<SocketAddr> {
        *self.tcp_local_addr.lock().unwrap()
    }

    pub fn status_message(&self) -> String {
        self.status.lock().unwrap().clone()
    }

    pub fn mode(&self) -> Option<TransportMode> {
        *self.mode.lock().unwrap()
    }

    pub fn request_count(&self) -> u64 {
        self.metrics.request_count()
    }

    pub fn last_function_code(&self) -> u8 {
        self.metrics.last_function_code()
    }

    /// Record-file directory summaries, for display.
    pub fn file_list(&self) -> Vec<String> {
        self.file_store.file_list()
    }

    pub fn file_info(&self, number: u16) -> String {
        self.file_store.file_info(number)
    }

    fn set_status(&self, message: &str) {
        debug!("status: {}", message);
        *self.status.lock().unwrap() = message.to_string();
    }

    /// Start serving Modbus/TCP on `0.0.0.0:port`. A running transport is
    /// stopped first. On bind failure the station is left not running and
    /// the failure is visible in the status message.
    pub async fn start_tcp(&mut self, port: u16) -> ModbusResult<()> {
        if self.running.load(Ordering::SeqCst) {
            self.stop().await?;
        }

        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                let message = format!("TCP start failed: {}", e);
                error!("{}", message);
                self.set_status(&message);
                return Err(ModbusError::connection(message));
            }
        };
        let local_addr = listener.local_addr().ok();
        *self.tcp_local_addr.lock().unwrap() = local_addr;

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());

        self.metrics.reset();
        self.running.store(true, Ordering::SeqCst);
        *self.mode.lock().unwrap() = Some(TransportMode::Tcp);
        let shown_port = local_addr.map(|a| a.port()).unwrap_or(port);
        self.set_status(&format!("TCP server running (port {})", shown_port));
        info!("Modbus/TCP station listening on port {}", shown_port);

        let router = self.router.clone();
        let trace = self.trace.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => match result {
                        Ok((stream, peer)) => {
                            debug!("client connected: {}", peer);
                            let router = router.clone();
                            let trace = trace.clone();
                            let shutdown_rx = shutdown_tx.subscribe();
                            tokio::spawn(async move {
                                Self::serve_connection(stream, peer, router, trace, shutdown_rx)
                                    .await;
                            });
                        }
                        Err(e) => {
                            error!("accept failed: {}", e);
                        }
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("TCP accept loop stopped");
        });

        Ok(())
    }

    /// One connection: reassemble ADUs, route, reply. The buffer lives and
    /// dies with the connection.
    async fn serve_connection(
        mut stream: TcpStream,
        peer: SocketAddr,
        router: Arc<PduRouter>,
        trace: CallbackLogger,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut frames = TcpFrameBuffer::new();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                result = stream.read_buf(frames.buffer_mut()) => {
                    match result {
                        Ok(0) => break,
                        Ok(_) => {
                            while let Some(adu) = frames.next_frame() {
                                trace.trace_frame("RX", &adu);
                                let response = match Self::process_tcp_adu(&adu, &router) {
                                    Some(response) => response,
                                    None => continue,
                                };
                                trace.trace_frame("TX", &response);
                                if let Err(e) = stream.write_all(&response).await {
                                    error!("write to {} failed: {}", peer, e);
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            debug!("read from {} failed: {}", peer, e);
                            break;
                        }
                    }
                }
            }
        }
        debug!("client disconnected: {}", peer);
    }

    /// Unwrap one TCP ADU and route its PDU. `None` means the frame is
    /// dropped without a response (bad protocol id, empty PDU, or a handler
    /// that declined to answer).
    fn process_tcp_adu(adu: &[u8], router: &PduRouter) -> Option<Vec<u8>> {
        let header = MbapHeader::parse(adu)?;
        if header.protocol_id != 0 {
            warn!("dropping frame with protocol id {}", header.protocol_id);
            return None;
        }

        let pdu = adu.get(7..)?;
        if pdu.is_empty() {
            return None;
        }

        let response_pdu = router.route(pdu);
        if response_pdu.is_empty() {
            return None;
        }
        Some(build_tcp_response(
            header.transaction_id,
            header.unit_id,
            &response_pdu,
        ))
    }

    /// Start serving Modbus/RTU on a serial port (8 data bits, no parity,
    /// one stop bit, no flow control). A running transport is stopped
    /// first.
    pub async fn start_rtu(&mut self, port_name: &str, baud_rate: u32) -> ModbusResult<()> {
        if self.running.load(Ordering::SeqCst) {
            self.stop().await?;
        }

        let builder = tokio_serial::new(port_name, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None);

        let port = match SerialStream::open(&builder) {
            Ok(port) => port,
            Err(e) => {
                let message = format!("RTU start failed: {}", e);
                error!("{}", message);
                self.set_status(&message);
                return Err(ModbusError::serial(message));
            }
        };

        let idle = rtu_idle_interval(baud_rate);
        debug!("RTU idle interval {:?} at {} baud", idle, baud_rate);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx);

        self.metrics.reset();
        self.running.store(true, Ordering::SeqCst);
        *self.mode.lock().unwrap() = Some(TransportMode::Rtu);
        self.set_status(&format!("RTU server running ({}, {})", port_name, baud_rate));
        info!("Modbus/RTU station on {} at {} baud", port_name, baud_rate);

        let router = self.router.clone();
        let trace = self.trace.clone();
        let status = self.status.clone();
        tokio::spawn(async move {
            Self::serve_serial(port, idle, router, trace, status, shutdown_rx).await;
            debug!("RTU loop stopped");
        });

        Ok(())
    }

    /// Serial read loop: reassemble with the length oracle, falling back to
    /// the idle timer for frames the oracle cannot size.
    async fn serve_serial(
        mut port: SerialStream,
        idle: Duration,
        router: Arc<PduRouter>,
        trace: CallbackLogger,
        status: Arc<Mutex<String>>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut assembler = RtuFrameAssembler::new();
        let mut chunk = [0u8; MAX_RTU_FRAME_SIZE];

        loop {
            if assembler.is_empty() {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    result = port.read(&mut chunk) => {
                        match result {
                            Ok(0) => break,
                            Ok(n) => {
                                assembler.extend(&chunk[..n]);
                                if let Some(frame) = assembler.try_complete() {
                                    Self::process_rtu_frame(&frame, &mut port, &router, &trace)
                                        .await;
                                }
                            }
                            Err(e) => {
                                let message = format!("RTU error: {}", e);
                                error!("{}", message);
                                *status.lock().unwrap() = message;
                                break;
                            }
                        }
                    }
                }
            } else {
                // partial frame buffered: each new read re-arms the timer
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    result = port.read(&mut chunk) => {
                        match result {
                            Ok(0) => break,
                            Ok(n) => {
                                assembler.extend(&chunk[..n]);
                                if let Some(frame) = assembler.try_complete() {
                                    Self::process_rtu_frame(&frame, &mut port, &router, &trace)
                                        .await;
                                }
                            }
                            Err(e) => {
                                let message = format!("RTU error: {}", e);
                                error!("{}", message);
                                *status.lock().unwrap() = message;
                                break;
                            }
                        }
                    }
                    _ = sleep(idle) => {
                        if let Some(frame) = assembler.flush() {
                            debug!("idle timer flushed {} byte frame", frame.len());
                            Self::process_rtu_frame(&frame, &mut port, &router, &trace).await;
                        }
                    }
                }
            }
        }
    }

    /// Validate and answer one RTU frame. CRC or length failures drop the
    /// frame silently; the slave address is echoed without filtering.
    async fn process_rtu_frame(
        frame: &[u8],
        port: &mut SerialStream,
        router: &PduRouter,
        trace: &CallbackLogger,
    ) {
        trace.trace_frame("RX", frame);

        let (address, pdu) = match parse_rtu_frame(frame) {
            Some(parsed) => parsed,
            None => {
                warn!("dropping invalid RTU frame ({} bytes)", frame.len());
                return;
            }
        };

        let response_pdu = router.route(pdu);
        if response_pdu.is_empty() {
            return;
        }

        let response = build_rtu_response(address, &response_pdu);
        trace.trace_frame("TX", &response);
        if let Err(e) = port.write_all(&response).await {
            error!("serial write failed: {}", e);
        }
    }
}

impl Default for ModbusStation {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModbusServer for ModbusStation {
    async fn stop(&mut self) -> ModbusResult<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        self.running.store(false, Ordering::SeqCst);
        *self.tcp_local_addr.lock().unwrap() = None;
        self.set_status("server stopped");
        info!("station stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stats(&self) -> StationStats {
        StationStats {
            running: self.is_running(),
            mode: self.mode(),
            status_message: self.status_message(),
            request_count: self.metrics.request_count(),
            last_function_code: self.metrics.last_function_code(),
            data_store: self.data_store.stats(),
        }
    }
}
