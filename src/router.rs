//! Function-code routing.
//!
//! A PDU entering the station goes through exactly one of three handlers:
//! the process-image dispatcher (0x01-0x10), the record file store
//! (0x14/0x15), or the flat file-address store (0xCB/0xCC). Anything else
//! is answered with an IllegalFunction exception. An empty response from a
//! handler means "send nothing" and is passed through for the transport to
//! drop.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use log::{debug, warn};

use crate::data_store::ModbusDataStore;
use crate::file_store::{FileAddressStore, ModbusFileStore};
use crate::function_handler::ModbusFunctionHandler;
use crate::protocol::{exception_pdu, ModbusException, ModbusFunction};

/// Dispatch bookkeeping shared between the router and the server facade.
///
/// The request counter tracks process-image requests (FC 0x01-0x10) only;
/// the last function code tracks every routed PDU.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    request_count: AtomicU64,
    last_function_code: AtomicU8,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn last_function_code(&self) -> u8 {
        self.last_function_code.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.request_count.store(0, Ordering::Relaxed);
        self.last_function_code.store(0, Ordering::Relaxed);
    }

    fn record(&self, function_code: u8, counted: bool) {
        self.last_function_code.store(function_code, Ordering::Relaxed);
        if counted {
            self.request_count.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Fans a request PDU out to the matching handler.
pub struct PduRouter {
    handler: ModbusFunctionHandler,
    file_store: Arc<ModbusFileStore>,
    address_store: Arc<FileAddressStore>,
    metrics: Arc<ServerMetrics>,
}

impl PduRouter {
    pub fn new(
        data_store: Arc<ModbusDataStore>,
        file_store: Arc<ModbusFileStore>,
        address_store: Arc<FileAddressStore>,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            handler: ModbusFunctionHandler::new(data_store),
            file_store,
            address_store,
            metrics,
        }
    }

    /// Route one PDU and return the response PDU. An empty input or an
    /// empty handler response yields an empty vector, which the transport
    /// treats as "no response".
    pub fn route(&self, pdu: &[u8]) -> Vec<u8> {
        let function_code = match pdu.first() {
            Some(&fc) => fc,
            None => return Vec::new(),
        };

        debug!("routing PDU: fc=0x{:02X}, len={}", function_code, pdu.len());

        let counted = ModbusFunction::from_u8(function_code)
            .map(|f| f.is_process_image())
            .unwrap_or(false);

        let response = match function_code {
            0x01..=0x06 | 0x0F | 0x10 => self.handler.process_request(pdu),
            0x14 => self.file_store.handle_read_file_record(pdu),
            0x15 => self.file_store.handle_write_file_record(pdu),
            0xCB => self.address_store.handle_read_file(pdu),
            0xCC => self.address_store.handle_write_file(pdu),
            _ => exception_pdu(function_code, ModbusException::IllegalFunction),
        };

        self.metrics.record(function_code, counted);

        if response.is_empty() {
            warn!("handler for fc=0x{:02X} produced no response", function_code);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> PduRouter {
        PduRouter::new(
            Arc::new(ModbusDataStore::new()),
            Arc::new(ModbusFileStore::new()),
            Arc::new(FileAddressStore::new()),
            Arc::new(ServerMetrics::new()),
        )
    }

    #[test]
    fn test_routes_process_image() {
        let r = router();
        let resp = r.route(&[0x03, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(resp, vec![0x03, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn test_routes_file_record() {
        let r = router();
        // write auto-creates file 1, response echoes the request
        let req = vec![0x15, 0x09, 0x06, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0xBE, 0xEF];
        assert_eq!(r.route(&req), req);

        let resp = r.route(&[0x14, 0x07, 0x06, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(resp, vec![0x14, 0x04, 0x03, 0x06, 0xBE, 0xEF]);
    }

    #[test]
    fn test_routes_file_area() {
        let r = router();
        let resp = r.route(&[0xCB, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(resp, vec![0xCB, 0x02, 0x00, 0x00]);
    }

    #[test]
    fn test_unknown_function_code() {
        let r = router();
        for fc in [0x07u8, 0x2B, 0x64, 0xFF] {
            assert_eq!(r.route(&[fc, 0x00, 0x01]), vec![fc | 0x80, 0x01]);
        }
    }

    #[test]
    fn test_empty_pdu_is_dropped() {
        let r = router();
        assert!(r.route(&[]).is_empty());
    }

    #[test]
    fn test_metrics() {
        let metrics = Arc::new(ServerMetrics::new());
        let r = PduRouter::new(
            Arc::new(ModbusDataStore::new()),
            Arc::new(ModbusFileStore::new()),
            Arc::new(FileAddressStore::new()),
            metrics.clone(),
        );

        r.route(&[0x03, 0x00, 0x00, 0x00, 0x01]);
        r.route(&[0x06, 0x00, 0x00, 0x12, 0x34]);
        assert_eq!(metrics.request_count(), 2);
        assert_eq!(metrics.last_function_code(), 0x06);

        // file operations update the last code but not the counter
        r.route(&[0xCB, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(metrics.request_count(), 2);
        assert_eq!(metrics.last_function_code(), 0xCB);
    }
}
