//! Stateless request dispatcher for the process-image function codes
//! (0x01-0x06, 0x0F, 0x10).
//!
//! Each handler takes the raw request PDU (function byte included) and
//! returns the raw response PDU. Validation failures become exception PDUs:
//! short or malformed requests and out-of-range quantities map to
//! IllegalDataValue, requests the data store rejects map to
//! IllegalDataAddress, and failed bulk writes map to SlaveDeviceFailure.

use std::sync::Arc;

use log::debug;

use crate::data_store::ModbusDataStore;
use crate::protocol::data_utils::{pack_bits, registers_to_bytes, unpack_bits};
use crate::protocol::{exception_pdu, ModbusException, ModbusFunction};
use crate::{MAX_READ_BITS, MAX_READ_REGISTERS, MAX_WRITE_BITS, MAX_WRITE_REGISTERS};

/// Translates process-image request PDUs into response PDUs against a
/// shared data store.
pub struct ModbusFunctionHandler {
    store: Arc<ModbusDataStore>,
}

impl ModbusFunctionHandler {
    pub fn new(store: Arc<ModbusDataStore>) -> Self {
        Self { store }
    }

    /// Dispatch one request PDU. Always returns a response PDU (success or
    /// exception); never panics on malformed input.
    pub fn process_request(&self, pdu: &[u8]) -> Vec<u8> {
        if pdu.is_empty() {
            return exception_pdu(0x00, ModbusException::IllegalFunction);
        }

        let function_code = pdu[0];
        match ModbusFunction::from_u8(function_code) {
            Ok(ModbusFunction::ReadCoils) => self.handle_read_coils(pdu),
            Ok(ModbusFunction::ReadDiscreteInputs) => self.handle_read_discrete_inputs(pdu),
            Ok(ModbusFunction::ReadHoldingRegisters) => self.handle_read_holding_registers(pdu),
            Ok(ModbusFunction::ReadInputRegisters) => self.handle_read_input_registers(pdu),
            Ok(ModbusFunction::WriteSingleCoil) => self.handle_write_single_coil(pdu),
            Ok(ModbusFunction::WriteSingleRegister) => self.handle_write_single_register(pdu),
            Ok(ModbusFunction::WriteMultipleCoils) => self.handle_write_multiple_coils(pdu),
            Ok(ModbusFunction::WriteMultipleRegisters) => self.handle_write_multiple_registers(pdu),
            _ => exception_pdu(function_code, ModbusException::IllegalFunction),
        }
    }

    /// FC 0x01.
    fn handle_read_coils(&self, pdu: &[u8]) -> Vec<u8> {
        if pdu.len() < 5 {
            return exception_pdu(0x01, ModbusException::IllegalDataValue);
        }
        let start = u16::from_be_bytes([pdu[1], pdu[2]]);
        let quantity = u16::from_be_bytes([pdu[3], pdu[4]]);

        if quantity == 0 || quantity > MAX_READ_BITS {
            return exception_pdu(0x01, ModbusException::IllegalDataValue);
        }

        let bits = match self.store.read_coils(start, quantity) {
            Ok(bits) => bits,
            Err(_) => return exception_pdu(0x01, ModbusException::IllegalDataAddress),
        };

        let data = pack_bits(&bits);
        let mut response = Vec::with_capacity(2 + data.len());
        response.push(0x01);
        response.push(data.len() as u8);
        response.extend_from_slice(&data);
        response
    }

    /// FC 0x02.
    fn handle_read_discrete_inputs(&self, pdu: &[u8]) -> Vec<u8> {
        if pdu.len() < 5 {
            return exception_pdu(0x02, ModbusException::IllegalDataValue);
        }
        let start = u16::from_be_bytes([pdu[1], pdu[2]]);
        let quantity = u16::from_be_bytes([pdu[3], pdu[4]]);

        if quantity == 0 || quantity > MAX_READ_BITS {
            return exception_pdu(0x02, ModbusException::IllegalDataValue);
        }

        let bits = match self.store.read_discrete_inputs(start, quantity) {
            Ok(bits) => bits,
            Err(_) => return exception_pdu(0x02, ModbusException::IllegalDataAddress),
        };

        let data = pack_bits(&bits);
        let mut response = Vec::with_capacity(2 + data.len());
        response.push(0x02);
        response.push(data.len() as u8);
        response.extend_from_slice(&data);
        response
    }

    /// FC 0x03.
    fn handle_read_holding_registers(&self, pdu: &[u8]) -> Vec<u8> {
        if pdu.len() < 5 {
            return exception_pdu(0x03, ModbusException::IllegalDataValue);
        }
        let start = u16::from_be_bytes([pdu[1], pdu[2]]);
        let quantity = u16::from_be_bytes([pdu[3], pdu[4]]);

        if quantity == 0 || quantity > MAX_READ_REGISTERS {
            return exception_pdu(0x03, ModbusException::IllegalDataValue);
        }

        let words = match self.store.read_holding_registers(start, quantity) {
            Ok(words) => words,
            Err(_) => return exception_pdu(0x03, ModbusException::IllegalDataAddress),
        };

        let mut response = Vec::with_capacity(2 + words.len() * 2);
        response.push(0x03);
        response.push((words.len() * 2) as u8);
        response.extend_from_slice(&registers_to_bytes(&words));
        response
    }

    /// FC 0x04.
    fn handle_read_input_registers(&self, pdu: &[u8]) -> Vec<u8> {
        if pdu.len() < 5 {
            return exception_pdu(0x04, ModbusException::IllegalDataValue);
        }
        let start = u16::from_be_bytes([pdu[1], pdu[2]]);
        let quantity = u16::from_be_bytes([pdu[3], pdu[4]]);

        if quantity == 0 || quantity > MAX_READ_REGISTERS {
            return exception_pdu(0x04, ModbusException::IllegalDataValue);
        }

        let words = match self.store.read_input_registers(start, quantity) {
            Ok(words) => words,
            Err(_) => return exception_pdu(0x04, ModbusException::IllegalDataAddress),
        };

        let mut response = Vec::with_capacity(2 + words.len() * 2);
        response.push(0x04);
        response.push((words.len() * 2) as u8);
        response.extend_from_slice(&registers_to_bytes(&words));
        response
    }

    /// FC 0x05. The only accepted register encodings are 0x0000 (off) and
    /// 0xFF00 (on); the request is echoed on success.
    fn handle_write_single_coil(&self, pdu: &[u8]) -> Vec<u8> {
        if pdu.len() < 5 {
            return exception_pdu(0x05, ModbusException::IllegalDataValue);
        }
        let address = u16::from_be_bytes([pdu[1], pdu[2]]);
        let value = u16::from_be_bytes([pdu[3], pdu[4]]);

        let coil_value = match value {
            0x0000 => false,
            0xFF00 => true,
            _ => {
                debug!("write single coil: rejected value 0x{:04X}", value);
                return exception_pdu(0x05, ModbusException::IllegalDataValue);
            }
        };

        self.store.write_coil(address, coil_value);
        pdu.to_vec()
    }

    /// FC 0x06. Any 16-bit value is accepted; the request is echoed.
    fn handle_write_single_register(&self, pdu: &[u8]) -> Vec<u8> {
        if pdu.len() < 5 {
            return exception_pdu(0x06, ModbusException::IllegalDataValue);
        }
        let address = u16::from_be_bytes([pdu[1], pdu[2]]);
        let value = u16::from_be_bytes([pdu[3], pdu[4]]);

        self.store.write_holding_register(address, value);
        pdu.to_vec()
    }

    /// FC 0x0F. Responds with `{FC, start, quantity}`.
    fn handle_write_multiple_coils(&self, pdu: &[u8]) -> Vec<u8> {
        if pdu.len() < 6 {
            return exception_pdu(0x0F, ModbusException::IllegalDataValue);
        }
        let start = u16::from_be_bytes([pdu[1], pdu[2]]);
        let quantity = u16::from_be_bytes([pdu[3], pdu[4]]);
        let byte_count = pdu[5] as usize;

        if quantity == 0 || quantity > MAX_WRITE_BITS {
            return exception_pdu(0x0F, ModbusException::IllegalDataValue);
        }
        let expected = (quantity as usize + 7) / 8;
        if byte_count != expected || pdu.len() < 6 + byte_count {
            return exception_pdu(0x0F, ModbusException::IllegalDataValue);
        }

        let bits = unpack_bits(&pdu[6..6 + byte_count], quantity as usize);
        if self.store.write_coils(start, &bits).is_err() {
            return exception_pdu(0x0F, ModbusException::SlaveDeviceFailure);
        }

        let mut response = Vec::with_capacity(5);
        response.push(0x0F);
        response.extend_from_slice(&start.to_be_bytes());
        response.extend_from_slice(&quantity.to_be_bytes());
        response
    }

    /// FC 0x10. Responds with `{FC, start, quantity}`.
    fn handle_write_multiple_registers(&self, pdu: &[u8]) -> Vec<u8> {
        if pdu.len() < 6 {
            return exception_pdu(0x10, ModbusException::IllegalDataValue);
        }
        let start = u16::from_be_bytes([pdu[1], pdu[2]]);
        let quantity = u16::from_be_bytes([pdu[3], pdu[4]]);
        let byte_count = pdu[5] as usize;

        if quantity == 0 || quantity > MAX_WRITE_REGISTERS {
            return exception_pdu(0x10, ModbusException::IllegalDataValue);
        }
        if byte_count != quantity as usize * 2 || pdu.len() < 6 + byte_count {
            return exception_pdu(0x10, ModbusException::IllegalDataValue);
        }

        let mut words = Vec::with_capacity(quantity as usize);
        for i in 0..quantity as usize {
            let offset = 6 + i * 2;
            words.push(u16::from_be_bytes([pdu[offset], pdu[offset + 1]]));
        }

        if self.store.write_holding_registers(start, &words).is_err() {
            return exception_pdu(0x10, ModbusException::SlaveDeviceFailure);
        }

        let mut response = Vec::with_capacity(5);
        response.push(0x10);
        response.extend_from_slice(&start.to_be_bytes());
        response.extend_from_slice(&quantity.to_be_bytes());
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> ModbusFunctionHandler {
        ModbusFunctionHandler::new(Arc::new(ModbusDataStore::new()))
    }

    fn read_req(fc: u8, start: u16, quantity: u16) -> Vec<u8> {
        let mut pdu = vec![fc];
        pdu.extend_from_slice(&start.to_be_bytes());
        pdu.extend_from_slice(&quantity.to_be_bytes());
        pdu
    }

    #[test]
    fn test_read_coils_packing() {
        let h = handler();
        h.store.write_coil(0, true);
        h.store.write_coil(2, true);
        h.store.write_coil(8, true);

        let resp = h.process_request(&read_req(0x01, 0, 10));
        assert_eq!(resp, vec![0x01, 0x02, 0b0000_0101, 0b0000_0001]);
    }

    #[test]
    fn test_read_coils_byte_count_rounds_up() {
        let h = handler();
        for qty in [1u16, 8, 9, 16, 17] {
            let resp = h.process_request(&read_req(0x01, 0, qty));
            assert_eq!(resp[1] as usize, (qty as usize + 7) / 8, "qty={}", qty);
            assert_eq!(resp.len(), 2 + resp[1] as usize);
        }
    }

    #[test]
    fn test_read_holding_registers() {
        let h = handler();
        h.store
            .write_holding_registers(0, &[0x000A, 0x000B, 0x000C, 0x000D])
            .unwrap();

        let resp = h.process_request(&read_req(0x03, 0, 4));
        assert_eq!(
            resp,
            vec![0x03, 0x08, 0x00, 0x0A, 0x00, 0x0B, 0x00, 0x0C, 0x00, 0x0D]
        );
    }

    #[test]
    fn test_quantity_limits() {
        let h = handler();
        assert_eq!(h.process_request(&read_req(0x01, 0, 0)), vec![0x81, 0x03]);
        assert_eq!(h.process_request(&read_req(0x01, 0, 2001)), vec![0x81, 0x03]);
        assert_eq!(h.process_request(&read_req(0x03, 0, 126)), vec![0x83, 0x03]);
        assert_eq!(h.process_request(&read_req(0x04, 0, 0)), vec![0x84, 0x03]);
    }

    #[test]
    fn test_short_request() {
        let h = handler();
        assert_eq!(h.process_request(&[0x03, 0x00]), vec![0x83, 0x03]);
        assert_eq!(h.process_request(&[]), vec![0x80, 0x01]);
    }

    #[test]
    fn test_write_single_coil() {
        let h = handler();
        let req = vec![0x05, 0x00, 0x07, 0xFF, 0x00];
        assert_eq!(h.process_request(&req), req);
        assert!(h.store.read_coil(7));

        let req = vec![0x05, 0x00, 0x07, 0x00, 0x00];
        assert_eq!(h.process_request(&req), req);
        assert!(!h.store.read_coil(7));

        // anything other than 0x0000/0xFF00 is rejected
        let req = vec![0x05, 0x00, 0x00, 0x12, 0x34];
        assert_eq!(h.process_request(&req), vec![0x85, 0x03]);
    }

    #[test]
    fn test_write_single_register_echo() {
        let h = handler();
        let req = vec![0x06, 0x00, 0x10, 0x12, 0x34];
        assert_eq!(h.process_request(&req), req);
        assert_eq!(h.store.read_holding_register(0x10), 0x1234);
    }

    #[test]
    fn test_write_multiple_coils() {
        let h = handler();
        // 10 coils: 0b11_0000_0101 LSB-first in two bytes
        let req = vec![0x0F, 0x00, 0x14, 0x00, 0x0A, 0x02, 0b0000_0101, 0b0000_0011];
        assert_eq!(h.process_request(&req), vec![0x0F, 0x00, 0x14, 0x00, 0x0A]);
        assert!(h.store.read_coil(20));
        assert!(!h.store.read_coil(21));
        assert!(h.store.read_coil(22));
        assert!(h.store.read_coil(28));
        assert!(h.store.read_coil(29));

        // byte count must be ceil(quantity / 8)
        let req = vec![0x0F, 0x00, 0x00, 0x00, 0x0A, 0x01, 0xFF];
        assert_eq!(h.process_request(&req), vec![0x8F, 0x03]);
    }

    #[test]
    fn test_write_multiple_registers() {
        let h = handler();
        let req = vec![0x10, 0x00, 0x00, 0x00, 0x02, 0x04, 0x00, 0xAA, 0x00, 0xBB];
        assert_eq!(h.process_request(&req), vec![0x10, 0x00, 0x00, 0x00, 0x02]);
        assert_eq!(h.store.read_holding_register(0), 0x00AA);
        assert_eq!(h.store.read_holding_register(1), 0x00BB);

        // byte count must be 2 * quantity
        let req = vec![0x10, 0x00, 0x00, 0x00, 0x02, 0x03, 0x00, 0xAA, 0x00];
        assert_eq!(h.process_request(&req), vec![0x90, 0x03]);

        // over the write limit
        let mut req = vec![0x10, 0x00, 0x00, 0x00, 0x7C, 0xF8];
        req.extend(std::iter::repeat(0).take(248));
        assert_eq!(h.process_request(&req), vec![0x90, 0x03]);
    }

    #[test]
    fn test_unknown_function() {
        let h = handler();
        assert_eq!(h.process_request(&[0x2B, 0x00]), vec![0xAB, 0x01]);
    }
}
