//! Process-image data store.
//!
//! Four sparse, independently locked regions keyed by 16-bit address: coils
//! and discrete inputs hold bits, holding and input registers hold 16-bit
//! words. Reading an address that was never written yields the region
//! default (false / 0). Discrete inputs and input registers have no
//! protocol-facing write path; their setters exist for initialization and
//! application-side simulation only.
//!
//! Change notifications go to registered sinks *after* the write lock has
//! been released. Sinks must be cheap and must never call back into the
//! store from the notification; they may observe events coalesced or out of
//! order with respect to unrelated addresses.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{ModbusError, ModbusResult};
use crate::{MAX_READ_BITS, MAX_READ_REGISTERS, MAX_WRITE_BITS, MAX_WRITE_REGISTERS};

/// The four addressable regions of the process image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataRegion {
    Coil,
    DiscreteInput,
    HoldingRegister,
    InputRegister,
}

impl DataRegion {
    pub fn as_str(self) -> &'static str {
        match self {
            DataRegion::Coil => "coil",
            DataRegion::DiscreteInput => "discrete_input",
            DataRegion::HoldingRegister => "holding_register",
            DataRegion::InputRegister => "input_register",
        }
    }

    /// Parse a region name as it appears in seed configuration files.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "coil" | "coils" => Some(DataRegion::Coil),
            "discrete_input" | "discreteinput" | "discrete" | "di" => {
                Some(DataRegion::DiscreteInput)
            }
            "holding_register" | "holdingregister" | "holding" | "hr" => {
                Some(DataRegion::HoldingRegister)
            }
            "input_register" | "inputregister" | "input" | "ir" => {
                Some(DataRegion::InputRegister)
            }
            _ => None,
        }
    }

    /// Regions the protocol cannot write (process-internal only).
    pub fn is_read_only(self) -> bool {
        matches!(self, DataRegion::DiscreteInput | DataRegion::InputRegister)
    }
}

/// A change observed on the process image. Bit values are reported as 0/1.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    /// A single cell changed.
    Point {
        region: DataRegion,
        address: u16,
        value: u16,
    },
    /// A bulk register write, coalesced into one event.
    Batch {
        region: DataRegion,
        start: u16,
        values: Vec<u16>,
    },
}

/// Subscriber callback for change events. Invoked outside the store's
/// critical section; must not block.
pub type ChangeSink = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// One sparse region. Value type is `bool` for the bit regions and `u16`
/// for the word regions.
#[derive(Debug)]
struct Region<T> {
    cells: RwLock<HashMap<u16, T>>,
    read_max: u16,
    write_max: u16,
}

impl<T: Copy + Default> Region<T> {
    fn new(read_max: u16, write_max: u16) -> Self {
        Self {
            cells: RwLock::new(HashMap::new()),
            read_max,
            write_max,
        }
    }

    fn read_single(&self, address: u16) -> T {
        let cells = self.cells.read().unwrap();
        cells.get(&address).copied().unwrap_or_default()
    }

    fn read_range(&self, start: u16, count: u16) -> ModbusResult<Vec<T>> {
        if count == 0 || count > self.read_max {
            return Err(ModbusError::invalid_address(start, count));
        }
        let cells = self.cells.read().unwrap();
        Ok((0..count)
            .map(|i| {
                cells
                    .get(&start.wrapping_add(i))
                    .copied()
                    .unwrap_or_default()
            })
            .collect())
    }

    fn write_single(&self, address: u16, value: T) {
        let mut cells = self.cells.write().unwrap();
        cells.insert(address, value);
    }

    fn write_range(&self, start: u16, values: &[T]) -> ModbusResult<()> {
        if values.is_empty() || values.len() > self.write_max as usize {
            return Err(ModbusError::invalid_address(start, values.len() as u16));
        }
        let mut cells = self.cells.write().unwrap();
        for (i, value) in values.iter().enumerate() {
            cells.insert(start.wrapping_add(i as u16), *value);
        }
        Ok(())
    }

    fn initialize(&self, start: u16, count: u16, value: T) {
        let mut cells = self.cells.write().unwrap();
        for i in 0..count {
            cells.insert(start.wrapping_add(i), value);
        }
    }

    fn populated(&self) -> usize {
        self.cells.read().unwrap().len()
    }
}

/// Populated-cell counts per region.
#[derive(Debug, Clone, Default)]
pub struct DataStoreStats {
    pub coils: usize,
    pub discrete_inputs: usize,
    pub holding_registers: usize,
    pub input_registers: usize,
}

/// Thread-safe process image serving the protocol engine and any in-process
/// observers.
pub struct ModbusDataStore {
    coils: Region<bool>,
    discrete_inputs: Region<bool>,
    holding_registers: Region<u16>,
    input_registers: Region<u16>,
    sinks: RwLock<Vec<ChangeSink>>,
}

impl ModbusDataStore {
    pub fn new() -> Self {
        Self {
            coils: Region::new(MAX_READ_BITS, MAX_WRITE_BITS),
            discrete_inputs: Region::new(MAX_READ_BITS, MAX_WRITE_BITS),
            holding_registers: Region::new(MAX_READ_REGISTERS, MAX_WRITE_REGISTERS),
            input_registers: Region::new(MAX_READ_REGISTERS, MAX_WRITE_REGISTERS),
            sinks: RwLock::new(Vec::new()),
        }
    }

    /// Register a change sink. Sinks receive events for coil and holding
    /// register mutations performed through the write methods; bulk
    /// initialization does not notify.
    pub fn subscribe(&self, sink: ChangeSink) {
        self.sinks.write().unwrap().push(sink);
    }

    fn publish(&self, event: ChangeEvent) {
        let sinks = self.sinks.read().unwrap();
        for sink in sinks.iter() {
            sink(&event);
        }
    }

    // ---- coils ----

    pub fn read_coil(&self, address: u16) -> bool {
        self.coils.read_single(address)
    }

    pub fn read_coils(&self, start: u16, count: u16) -> ModbusResult<Vec<bool>> {
        self.coils.read_range(start, count)
    }

    pub fn write_coil(&self, address: u16, value: bool) {
        self.coils.write_single(address, value);
        self.publish(ChangeEvent::Point {
            region: DataRegion::Coil,
            address,
            value: value as u16,
        });
    }

    pub fn write_coils(&self, start: u16, values: &[bool]) -> ModbusResult<()> {
        self.coils.write_range(start, values)?;
        for (i, &value) in values.iter().enumerate() {
            self.publish(ChangeEvent::Point {
                region: DataRegion::Coil,
                address: start.wrapping_add(i as u16),
                value: value as u16,
            });
        }
        Ok(())
    }

    // ---- discrete inputs (process-internal writes only) ----

    pub fn read_discrete_input(&self, address: u16) -> bool {
        self.discrete_inputs.read_single(address)
    }

    pub fn read_discrete_inputs(&self, start: u16, count: u16) -> ModbusResult<Vec<bool>> {
        self.discrete_inputs.read_range(start, count)
    }

    pub fn write_discrete_input(&self, address: u16, value: bool) {
        self.discrete_inputs.write_single(address, value);
    }

    // ---- holding registers ----

    pub fn read_holding_register(&self, address: u16) -> u16 {
        self.holding_registers.read_single(address)
    }

    pub fn read_holding_registers(&self, start: u16, count: u16) -> ModbusResult<Vec<u16>> {
        self.holding_registers.read_range(start, count)
    }

    pub fn write_holding_register(&self, address: u16, value: u16) {
        self.holding_registers.write_single(address, value);
        self.publish(ChangeEvent::Point {
            region: DataRegion::HoldingRegister,
            address,
            value,
        });
    }

    pub fn write_holding_registers(&self, start: u16, values: &[u16]) -> ModbusResult<()> {
        self.holding_registers.write_range(start, values)?;
        self.publish(ChangeEvent::Batch {
            region: DataRegion::HoldingRegister,
            start,
            values: values.to_vec(),
        });
        Ok(())
    }

    // ---- input registers (process-internal writes only) ----

    pub fn read_input_register(&self, address: u16) -> u16 {
        self.input_registers.read_single(address)
    }

    pub fn read_input_registers(&self, start: u16, count: u16) -> ModbusResult<Vec<u16>> {
        self.input_registers.read_range(start, count)
    }

    pub fn write_input_register(&self, address: u16, value: u16) {
        self.input_registers.write_single(address, value);
    }

    // ---- bulk seeding, no notifications ----

    pub fn initialize_coils(&self, start: u16, count: u16, value: bool) {
        self.coils.initialize(start, count, value);
    }

    pub fn initialize_discrete_inputs(&self, start: u16, count: u16, value: bool) {
        self.discrete_inputs.initialize(start, count, value);
    }

    pub fn initialize_holding_registers(&self, start: u16, count: u16, value: u16) {
        self.holding_registers.initialize(start, count, value);
    }

    pub fn initialize_input_registers(&self, start: u16, count: u16, value: u16) {
        self.input_registers.initialize(start, count, value);
    }

    pub fn stats(&self) -> DataStoreStats {
        DataStoreStats {
            coils: self.coils.populated(),
            discrete_inputs: self.discrete_inputs.populated(),
            holding_registers: self.holding_registers.populated(),
            input_registers: self.input_registers.populated(),
        }
    }
}

impl Default for ModbusDataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_defaults_on_miss() {
        let store = ModbusDataStore::new();
        assert!(!store.read_coil(42));
        assert_eq!(store.read_holding_register(42), 0);

        let bits = store.read_coils(100, 16).unwrap();
        assert!(bits.iter().all(|&b| !b));
        let words = store.read_input_registers(100, 8).unwrap();
        assert!(words.iter().all(|&w| w == 0));
    }

    #[test]
    fn test_read_write_coils() {
        let store = ModbusDataStore::new();
        store.write_coil(10, true);
        assert!(store.read_coil(10));

        store.write_coils(20, &[true, false, true]).unwrap();
        assert_eq!(store.read_coils(20, 3).unwrap(), vec![true, false, true]);
    }

    #[test]
    fn test_read_write_registers() {
        let store = ModbusDataStore::new();
        store.write_holding_register(5, 0xABCD);
        assert_eq!(store.read_holding_register(5), 0xABCD);

        store
            .write_holding_registers(100, &[0x1111, 0x2222, 0x3333])
            .unwrap();
        assert_eq!(
            store.read_holding_registers(100, 3).unwrap(),
            vec![0x1111, 0x2222, 0x3333]
        );
    }

    #[test]
    fn test_range_limits() {
        let store = ModbusDataStore::new();
        assert!(store.read_coils(0, 0).is_err());
        assert!(store.read_coils(0, 2001).is_err());
        assert!(store.read_coils(0, 2000).is_ok());

        assert!(store.read_holding_registers(0, 126).is_err());
        assert!(store.read_holding_registers(0, 125).is_ok());

        let too_many = vec![0u16; 124];
        assert!(store.write_holding_registers(0, &too_many).is_err());
        let too_many_bits = vec![false; 1969];
        assert!(store.write_coils(0, &too_many_bits).is_err());
    }

    #[test]
    fn test_initialize_is_silent() {
        let store = ModbusDataStore::new();
        let events: Arc<Mutex<Vec<ChangeEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = events.clone();
        store.subscribe(Arc::new(move |e| captured.lock().unwrap().push(e.clone())));

        store.initialize_holding_registers(0, 10, 7);
        assert!(events.lock().unwrap().is_empty());
        assert_eq!(store.read_holding_register(9), 7);
    }

    #[test]
    fn test_change_events() {
        let store = ModbusDataStore::new();
        let events: Arc<Mutex<Vec<ChangeEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = events.clone();
        store.subscribe(Arc::new(move |e| captured.lock().unwrap().push(e.clone())));

        store.write_coil(1, true);
        store.write_holding_registers(10, &[0xAA, 0xBB]).unwrap();

        let seen = events.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(
            seen[0],
            ChangeEvent::Point {
                region: DataRegion::Coil,
                address: 1,
                value: 1
            }
        );
        assert_eq!(
            seen[1],
            ChangeEvent::Batch {
                region: DataRegion::HoldingRegister,
                start: 10,
                values: vec![0xAA, 0xBB]
            }
        );
    }

    #[test]
    fn test_region_parse() {
        assert_eq!(DataRegion::parse("coil"), Some(DataRegion::Coil));
        assert_eq!(DataRegion::parse("HR"), Some(DataRegion::HoldingRegister));
        assert_eq!(
            DataRegion::parse("HoldingRegister"),
            Some(DataRegion::HoldingRegister)
        );
        assert_eq!(DataRegion::parse(" discrete "), Some(DataRegion::DiscreteInput));
        assert_eq!(
            DataRegion::parse("discreteinput"),
            Some(DataRegion::DiscreteInput)
        );
        assert_eq!(DataRegion::parse("bogus"), None);
        assert!(DataRegion::InputRegister.is_read_only());
        assert!(!DataRegion::Coil.is_read_only());
    }
}
