//! Seed-point configuration.
//!
//! A seed file describes the initial process image as a list of typed
//! points. Three formats are accepted: tab-separated, comma-separated, and
//! a JSON array; the format is detected from the file extension or, when
//! parsing raw text, from the content itself.
//!
//! Delimited rows are laid out
//!
//! ```text
//! address, name, region, initial-value,
//!     [description, unit, min-value, max-value, read-only,
//!      value-type, register-count]
//! ```
//!
//! with the first four columns mandatory and the rest optional. When the
//! value-type column is absent it is inferred: bit regions get `bool`, an
//! initial value containing a decimal point gets `float32`, anything else
//! gets `uint16`. A positive register-count column overrides the count
//! derived from the value type. Header rows, rows with fewer than four
//! fields, and rows without a name are skipped; an unrecognized region
//! name falls back to the holding-register region.
//!
//! Applying a seed expands each typed value into registers (high word
//! first, spanning consecutive addresses) and writes through the store's
//! initialization paths, so seeding never produces change notifications.

use std::path::Path;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::data_store::{DataRegion, ModbusDataStore};
use crate::error::{ModbusError, ModbusResult};
use crate::value::{ModbusValue, ModbusValueType};

/// Seed file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Tsv,
    Csv,
    Json,
    Auto,
}

/// One configured point of the process image.
///
/// `description`, `unit`, `min_value` and `max_value` are display metadata
/// carried for the presentation layer; the engine itself only consumes the
/// address, region, value type and initial value.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedPoint {
    pub address: u16,
    pub name: String,
    pub region: DataRegion,
    pub initial_value: String,
    pub description: String,
    pub unit: String,
    pub min_value: String,
    pub max_value: String,
    pub read_only: bool,
    pub value_type: ModbusValueType,
    pub register_count: usize,
}

impl SeedPoint {
    /// Build a point with the inferred value type and the region's natural
    /// read-only flag.
    pub fn new(address: u16, name: &str, region: DataRegion, initial_value: &str) -> Self {
        let value_type = Self::infer_value_type(region, initial_value);
        Self {
            address,
            name: name.to_string(),
            region,
            initial_value: initial_value.to_string(),
            description: String::new(),
            unit: String::new(),
            min_value: String::new(),
            max_value: String::new(),
            read_only: region.is_read_only(),
            value_type,
            register_count: value_type.register_count(),
        }
    }

    /// Value type used when a row does not spell one out: bit regions hold
    /// booleans, a decimal point in the initial value means `float32`,
    /// anything else is a raw `uint16`.
    pub fn infer_value_type(region: DataRegion, initial_value: &str) -> ModbusValueType {
        if matches!(region, DataRegion::Coil | DataRegion::DiscreteInput) {
            ModbusValueType::Bool
        } else if initial_value.contains('.') {
            ModbusValueType::Float32
        } else {
            ModbusValueType::Uint16
        }
    }

    /// Address span this point occupies: `[address, address + count - 1]`.
    pub fn address_range(&self) -> (u16, u16) {
        (
            self.address,
            self.address
                .wrapping_add(self.register_count.saturating_sub(1) as u16),
        )
    }
}

/// Raw JSON shape. Keys are camelCase (`pointType`, `initialValue`, ...);
/// values may be spelled as strings, numbers or booleans.
#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawPoint {
    address: u16,
    #[serde(alias = "pointName")]
    name: String,
    point_type: String,
    initial_value: serde_json::Value,
    description: String,
    unit: String,
    min_value: serde_json::Value,
    max_value: serde_json::Value,
    read_only: bool,
    value_type: String,
    register_count: usize,
}

fn json_value_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Pick a format from the file extension: `.json`, `.csv`, anything else
/// is treated as tab-separated.
pub fn detect_format(path: &Path) -> ConfigFormat {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("json") => ConfigFormat::Json,
        Some("csv") => ConfigFormat::Csv,
        _ => ConfigFormat::Tsv,
    }
}

/// Read and parse a seed file.
pub fn import_from_file(path: &Path, format: ConfigFormat) -> ModbusResult<Vec<SeedPoint>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ModbusError::configuration(format!("cannot read {}: {}", path.display(), e)))?;
    let format = match format {
        ConfigFormat::Auto => detect_format(path),
        other => other,
    };
    parse_content(&content, format)
}

/// Parse seed text. With `Auto`, JSON is assumed for content starting with
/// `[`, tab-separated for content containing a tab, comma-separated
/// otherwise.
pub fn parse_content(content: &str, format: ConfigFormat) -> ModbusResult<Vec<SeedPoint>> {
    match format {
        ConfigFormat::Tsv => Ok(parse_delimited(content, '\t')),
        ConfigFormat::Csv => Ok(parse_delimited(content, ',')),
        ConfigFormat::Json => parse_json(content),
        ConfigFormat::Auto => {
            let trimmed = content.trim_start();
            if trimmed.starts_with('[') {
                parse_json(content)
            } else if content.contains('\t') {
                Ok(parse_delimited(content, '\t'))
            } else {
                Ok(parse_delimited(content, ','))
            }
        }
    }
}

fn parse_delimited(content: &str, separator: char) -> Vec<SeedPoint> {
    let mut points = Vec::new();
    for (index, raw_line) in content.lines().enumerate() {
        let line_number = index + 1;
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split(separator).collect();
        if fields.len() < 4 {
            continue;
        }

        let address = match fields[0].trim().parse::<u16>() {
            Ok(address) => address,
            Err(_) => {
                // header row or junk
                debug!("seed line {} skipped: non-numeric address", line_number);
                continue;
            }
        };

        let name = fields[1].trim();
        if name.is_empty() {
            warn!("seed line {} skipped: empty point name", line_number);
            continue;
        }

        let region =
            DataRegion::parse(fields[2]).unwrap_or(DataRegion::HoldingRegister);

        let mut point = SeedPoint::new(address, name, region, fields[3].trim());

        if let Some(description) = fields.get(4) {
            point.description = description.trim().to_string();
        }
        if let Some(unit) = fields.get(5) {
            point.unit = unit.trim().to_string();
        }
        if let Some(min_value) = fields.get(6) {
            point.min_value = min_value.trim().to_string();
        }
        if let Some(max_value) = fields.get(7) {
            point.max_value = max_value.trim().to_string();
        }
        if let Some(read_only) = fields.get(8) {
            point.read_only = match read_only.trim() {
                "true" | "1" => true,
                "false" | "0" => false,
                _ => region == DataRegion::DiscreteInput,
            };
        }
        if let Some(value_type) = fields.get(9) {
            point.value_type = ModbusValueType::parse(value_type);
            point.register_count = point.value_type.register_count();
        }
        if let Some(register_count) = fields.get(10) {
            if let Ok(count) = register_count.trim().parse::<usize>() {
                if count > 0 {
                    point.register_count = count;
                }
            }
        }

        points.push(point);
    }
    debug!("parsed {} seed points", points.len());
    points
}

fn parse_json(content: &str) -> ModbusResult<Vec<SeedPoint>> {
    let raw: Vec<RawPoint> = serde_json::from_str(content)?;
    let mut points = Vec::with_capacity(raw.len());
    for item in raw {
        if item.name.is_empty() {
            warn!("seed entry at address {} skipped: empty point name", item.address);
            continue;
        }
        let region =
            DataRegion::parse(&item.point_type).unwrap_or(DataRegion::HoldingRegister);
        // register count always re-derives from the value type here; only
        // the delimited formats can override it
        let value_type = ModbusValueType::parse(&item.value_type);
        points.push(SeedPoint {
            address: item.address,
            name: item.name,
            region,
            initial_value: json_value_to_string(item.initial_value),
            description: item.description,
            unit: item.unit,
            min_value: json_value_to_string(item.min_value),
            max_value: json_value_to_string(item.max_value),
            read_only: item.read_only,
            value_type,
            register_count: value_type.register_count(),
        });
    }
    Ok(points)
}

/// Serialize seed points back to text in the requested format (`Auto`
/// writes tab-separated). All eleven columns are written.
pub fn generate_content(points: &[SeedPoint], format: ConfigFormat) -> ModbusResult<String> {
    match format {
        ConfigFormat::Tsv | ConfigFormat::Auto => Ok(generate_delimited(points, '\t')),
        ConfigFormat::Csv => Ok(generate_delimited(points, ',')),
        ConfigFormat::Json => {
            let raw: Vec<RawPoint> = points
                .iter()
                .map(|p| RawPoint {
                    address: p.address,
                    name: p.name.clone(),
                    point_type: p.region.as_str().to_string(),
                    initial_value: serde_json::Value::String(p.initial_value.clone()),
                    description: p.description.clone(),
                    unit: p.unit.clone(),
                    min_value: serde_json::Value::String(p.min_value.clone()),
                    max_value: serde_json::Value::String(p.max_value.clone()),
                    read_only: p.read_only,
                    value_type: p.value_type.as_str().to_string(),
                    register_count: p.register_count,
                })
                .collect();
            Ok(serde_json::to_string_pretty(&raw)?)
        }
    }
}

/// Write a seed file in the requested format (`Auto` detects from the
/// extension).
pub fn export_to_file(path: &Path, points: &[SeedPoint], format: ConfigFormat) -> ModbusResult<()> {
    let format = match format {
        ConfigFormat::Auto => detect_format(path),
        other => other,
    };
    let content = generate_content(points, format)?;
    std::fs::write(path, content)
        .map_err(|e| ModbusError::configuration(format!("cannot write {}: {}", path.display(), e)))
}

fn generate_delimited(points: &[SeedPoint], separator: char) -> String {
    let sep = separator.to_string();
    let mut out = String::new();
    let header = [
        "address",
        "name",
        "region",
        "initial_value",
        "description",
        "unit",
        "min_value",
        "max_value",
        "read_only",
        "value_type",
        "register_count",
    ];
    out.push_str(&header.join(&sep));
    out.push('\n');
    for p in points {
        let row = [
            p.address.to_string(),
            p.name.clone(),
            p.region.as_str().to_string(),
            p.initial_value.clone(),
            p.description.clone(),
            p.unit.clone(),
            p.min_value.clone(),
            p.max_value.clone(),
            p.read_only.to_string(),
            p.value_type.as_str().to_string(),
            p.register_count.to_string(),
        ];
        out.push_str(&row.join(&sep));
        out.push('\n');
    }
    out
}

/// Seed the process image from parsed points. Bit regions take the value's
/// truthiness; word regions take the value expanded into consecutive
/// registers. An empty initial value seeds zeros for the type's span.
pub fn apply_seed_points(store: &ModbusDataStore, points: &[SeedPoint]) -> ModbusResult<()> {
    for point in points {
        let value = if point.initial_value.is_empty() {
            ModbusValue::from_registers(
                point.value_type,
                &vec![0u16; point.value_type.register_count()],
            )?
        } else {
            ModbusValue::parse_string(point.value_type, &point.initial_value).map_err(|e| {
                ModbusError::configuration(format!(
                    "point '{}' at {}: {}",
                    point.name, point.address, e
                ))
            })?
        };

        match point.region {
            DataRegion::Coil => store.initialize_coils(point.address, 1, value.as_bool()),
            DataRegion::DiscreteInput => {
                store.initialize_discrete_inputs(point.address, 1, value.as_bool())
            }
            DataRegion::HoldingRegister => {
                for (i, word) in value.to_registers().into_iter().enumerate() {
                    store.initialize_holding_registers(
                        point.address.wrapping_add(i as u16),
                        1,
                        word,
                    );
                }
            }
            DataRegion::InputRegister => {
                for (i, word) in value.to_registers().into_iter().enumerate() {
                    store.initialize_input_registers(point.address.wrapping_add(i as u16), 1, word);
                }
            }
        }
    }
    Ok(())
}
