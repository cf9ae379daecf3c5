//! File-oriented stores.
//!
//! [`ModbusFileStore`] answers the record-oriented function codes 0x14/0x15:
//! a directory of numbered files, each a sparse map of 16-bit record numbers
//! to 2-byte records with a configured capacity. [`FileAddressStore`]
//! answers the vendor codes 0xCB/0xCC against a single flat address space of
//! 2-byte cells, independent of both the process image and the record files.
//!
//! Both handlers take the raw request PDU and return the raw response PDU;
//! validation failures come back as exception PDUs, never as `Err`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use log::{debug, warn};

use crate::protocol::{exception_pdu, ModbusException};
use crate::{MAX_FILE_RECORDS, MAX_RECORD_LENGTH, MAX_RECORD_NUMBER};

/// Reference type mandated by the Modbus file-record operations.
const FILE_REF_TYPE: u8 = 6;

/// One numbered file: a sparse record map with a fixed capacity.
///
/// Records are exactly 2 bytes; reading a record that was never written
/// yields two zero bytes. The record map has its own lock so concurrent
/// requests against different files never serialize on the directory.
pub struct RecordFile {
    number: u16,
    description: String,
    capacity: u16,
    records: RwLock<HashMap<u16, [u8; 2]>>,
}

impl RecordFile {
    fn new(number: u16, description: &str, capacity: u16) -> Self {
        Self {
            number,
            description: description.to_string(),
            capacity,
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    /// Read `length` records starting at `start`, concatenated in record
    /// order. `None` when the range exceeds the file capacity.
    fn read_records(&self, start: u16, length: u16) -> Option<Vec<u8>> {
        if start as u32 + length as u32 > self.capacity as u32 {
            return None;
        }
        let records = self.records.read().unwrap();
        let mut data = Vec::with_capacity(length as usize * 2);
        for i in 0..length {
            let record = records.get(&(start + i)).copied().unwrap_or([0, 0]);
            data.extend_from_slice(&record);
        }
        Some(data)
    }

    /// Write records from a packed byte payload (2 bytes per record).
    /// Fails when the range exceeds the file capacity.
    fn write_records(&self, start: u16, data: &[u8]) -> bool {
        let length = (data.len() / 2) as u16;
        if start as u32 + length as u32 > self.capacity as u32 {
            return false;
        }
        let mut records = self.records.write().unwrap();
        for i in 0..length {
            let offset = i as usize * 2;
            records.insert(start + i, [data[offset], data[offset + 1]]);
        }
        true
    }

    /// Written records as 16-bit values, in record order, capped at `max`.
    fn written_records(&self, max: usize) -> BTreeMap<u16, u16> {
        let records = self.records.read().unwrap();
        let mut sorted: BTreeMap<u16, u16> = BTreeMap::new();
        for (&number, bytes) in records.iter() {
            sorted.insert(number, u16::from_be_bytes(*bytes));
        }
        sorted.into_iter().take(max).collect()
    }

    fn written_count(&self) -> usize {
        self.records.read().unwrap().len()
    }
}

/// Directory of record files answering FC 0x14 (read) and 0x15 (write).
pub struct ModbusFileStore {
    files: RwLock<HashMap<u16, Arc<RecordFile>>>,
}

impl ModbusFileStore {
    pub fn new() -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
        }
    }

    /// Create a file explicitly. Fails if the file number is taken.
    pub fn create_file(&self, number: u16, description: &str, capacity: u16) -> bool {
        let mut files = self.files.write().unwrap();
        if files.contains_key(&number) {
            return false;
        }
        files.insert(number, Arc::new(RecordFile::new(number, description, capacity)));
        true
    }

    fn lookup(&self, number: u16) -> Option<Arc<RecordFile>> {
        // Directory lock is dropped before the caller touches the per-file
        // record lock.
        let files = self.files.read().unwrap();
        files.get(&number).cloned()
    }

    /// Handle FC 0x14 Read File Record.
    ///
    /// Exactly one sub-request is parsed from the PDU; any trailing bytes
    /// are ignored. The response layout is:
    ///
    /// ```text
    /// FC=0x14 | ByteCount(1) | SubRespLen(1) | RefType=6 | Data(2*recordLength)
    /// ```
    ///
    /// with `SubRespLen = 1 + 2*recordLength` and `ByteCount = 1 +
    /// SubRespLen`. The ByteCount counts the SubRespLen field itself; the
    /// masters this station is deployed against expect exactly this layout.
    pub fn handle_read_file_record(&self, pdu: &[u8]) -> Vec<u8> {
        if pdu.len() < 9 {
            return exception_pdu(0x14, ModbusException::IllegalDataValue);
        }

        let ref_type = pdu[2];
        if ref_type != FILE_REF_TYPE {
            return exception_pdu(0x14, ModbusException::IllegalDataValue);
        }

        let file_number = u16::from_be_bytes([pdu[3], pdu[4]]);
        let record_number = u16::from_be_bytes([pdu[5], pdu[6]]);
        let record_length = u16::from_be_bytes([pdu[7], pdu[8]]);

        // The 1-byte ByteCount field caps a sub-response at 126 records.
        if record_length > MAX_RECORD_LENGTH {
            return exception_pdu(0x14, ModbusException::IllegalDataValue);
        }
        if record_number > MAX_RECORD_NUMBER {
            return exception_pdu(0x14, ModbusException::IllegalDataAddress);
        }

        let file = match self.lookup(file_number) {
            Some(file) => file,
            None => {
                debug!("read file record: file {} not found", file_number);
                return exception_pdu(0x14, ModbusException::IllegalDataAddress);
            }
        };

        let data = match file.read_records(record_number, record_length) {
            Some(data) => data,
            None => {
                debug!(
                    "read file record: range {}+{} exceeds capacity {} of file {}",
                    record_number, record_length, file.capacity(), file_number
                );
                return exception_pdu(0x14, ModbusException::IllegalDataAddress);
            }
        };

        let sub_resp_len = 1 + data.len();
        let byte_count = 1 + sub_resp_len;
        if sub_resp_len > 0xFF || byte_count > 0xFF {
            return exception_pdu(0x14, ModbusException::IllegalDataValue);
        }

        let mut response = Vec::with_capacity(4 + data.len());
        response.push(0x14);
        response.push(byte_count as u8);
        response.push(sub_resp_len as u8);
        response.push(FILE_REF_TYPE);
        response.extend_from_slice(&data);
        response
    }

    /// Handle FC 0x15 Write File Record.
    ///
    /// If the file does not exist it is auto-created with the default
    /// capacity before the write. On success the entire request PDU is
    /// echoed back.
    pub fn handle_write_file_record(&self, pdu: &[u8]) -> Vec<u8> {
        if pdu.len() < 10 {
            return exception_pdu(0x15, ModbusException::IllegalDataValue);
        }

        let ref_type = pdu[2];
        if ref_type != FILE_REF_TYPE {
            return exception_pdu(0x15, ModbusException::IllegalDataValue);
        }

        let file_number = u16::from_be_bytes([pdu[3], pdu[4]]);
        let record_number = u16::from_be_bytes([pdu[5], pdu[6]]);
        let record_length = u16::from_be_bytes([pdu[7], pdu[8]]);
        let data = &pdu[9..];

        if record_length > MAX_RECORD_LENGTH {
            return exception_pdu(0x15, ModbusException::IllegalDataValue);
        }
        if data.len() != record_length as usize * 2 {
            return exception_pdu(0x15, ModbusException::IllegalDataValue);
        }
        if record_number > MAX_RECORD_NUMBER {
            return exception_pdu(0x15, ModbusException::IllegalDataAddress);
        }

        let file = {
            let mut files = self.files.write().unwrap();
            files
                .entry(file_number)
                .or_insert_with(|| {
                    Arc::new(RecordFile::new(file_number, "", MAX_FILE_RECORDS))
                })
                .clone()
        };

        if !file.write_records(record_number, data) {
            warn!(
                "write file record: range {}+{} exceeds capacity {} of file {}",
                record_number, record_length, file.capacity(), file_number
            );
            return exception_pdu(0x15, ModbusException::SlaveDeviceFailure);
        }

        pdu.to_vec()
    }

    /// Human-readable summary of every file, for display.
    pub fn file_list(&self) -> Vec<String> {
        let files = self.files.read().unwrap();
        let mut numbers: Vec<u16> = files.keys().copied().collect();
        numbers.sort_unstable();
        numbers
            .iter()
            .map(|n| {
                let file = &files[n];
                format!(
                    "file {}: {} ({} records)",
                    file.number(),
                    file.description(),
                    file.capacity()
                )
            })
            .collect()
    }

    /// Detail line for one file, or a not-found message.
    pub fn file_info(&self, number: u16) -> String {
        match self.lookup(number) {
            Some(file) => format!(
                "file {}: {} ({} records, {} written)",
                file.number(),
                file.description(),
                file.capacity(),
                file.written_count()
            ),
            None => format!("file {} does not exist", number),
        }
    }

    /// Written records of one file as 16-bit values, capped at `max`.
    pub fn all_records(&self, number: u16, max: usize) -> BTreeMap<u16, u16> {
        match self.lookup(number) {
            Some(file) => file.written_records(max),
            None => BTreeMap::new(),
        }
    }
}

impl Default for ModbusFileStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Flat address-indexed store of 2-byte cells answering the vendor codes
/// FC 0xCB (read) and 0xCC (write).
pub struct FileAddressStore {
    cells: RwLock<HashMap<u16, [u8; 2]>>,
}

impl FileAddressStore {
    pub fn new() -> Self {
        Self {
            cells: RwLock::new(HashMap::new()),
        }
    }

    /// Zero-fill an address range.
    pub fn initialize_region(&self, start: u16, count: u16) {
        let mut cells = self.cells.write().unwrap();
        for i in 0..count {
            cells.insert(start.wrapping_add(i), [0, 0]);
        }
    }

    /// Handle FC 0xCB: `{FC, startAddr(2), quantity(2)}` with quantity
    /// 1..=125. Missing cells read as two zero bytes.
    pub fn handle_read_file(&self, pdu: &[u8]) -> Vec<u8> {
        if pdu.len() < 5 {
            return exception_pdu(0xCB, ModbusException::IllegalDataValue);
        }

        let start = u16::from_be_bytes([pdu[1], pdu[2]]);
        let quantity = u16::from_be_bytes([pdu[3], pdu[4]]);

        if quantity == 0 || quantity > 125 {
            return exception_pdu(0xCB, ModbusException::IllegalDataValue);
        }

        let cells = self.cells.read().unwrap();
        let mut data = Vec::with_capacity(quantity as usize * 2);
        for i in 0..quantity {
            let cell = cells.get(&start.wrapping_add(i)).copied().unwrap_or([0, 0]);
            data.extend_from_slice(&cell);
        }
        drop(cells);

        let mut response = Vec::with_capacity(2 + data.len());
        response.push(0xCB);
        response.push(data.len() as u8);
        response.extend_from_slice(&data);
        response
    }

    /// Handle FC 0xCC: `{FC, startAddr(2), quantity(2), byteCount(1), data}`
    /// with quantity 1..=123 and byteCount == 2*quantity. The response
    /// echoes `{FC, startAddr, quantity}`.
    pub fn handle_write_file(&self, pdu: &[u8]) -> Vec<u8> {
        if pdu.len() < 7 {
            return exception_pdu(0xCC, ModbusException::IllegalDataValue);
        }

        let start = u16::from_be_bytes([pdu[1], pdu[2]]);
        let quantity = u16::from_be_bytes([pdu[3], pdu[4]]);
        let byte_count = pdu[5] as usize;
        let data = &pdu[6..];

        if quantity == 0 || quantity > 123 {
            return exception_pdu(0xCC, ModbusException::IllegalDataValue);
        }
        if byte_count != data.len() || byte_count != quantity as usize * 2 {
            return exception_pdu(0xCC, ModbusException::IllegalDataValue);
        }

        {
            let mut cells = self.cells.write().unwrap();
            for i in 0..quantity {
                let offset = i as usize * 2;
                cells.insert(
                    start.wrapping_add(i),
                    [data[offset], data[offset + 1]],
                );
            }
        }

        let mut response = Vec::with_capacity(5);
        response.push(0xCC);
        response.extend_from_slice(&start.to_be_bytes());
        response.extend_from_slice(&quantity.to_be_bytes());
        response
    }
}

impl Default for FileAddressStore {
    fn default() -> Self {
        Self::new()
    }
}
