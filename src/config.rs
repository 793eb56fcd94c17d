//! Device configuration.
//!
//! An INI-style file describes the devices available to the process, one
//! section per device:
//!
//! ```ini
//! # comments with '#' or ';'
//! [storage]
//! transport = ip
//! ip = 10.0.0.7
//! priority = 70
//!
//! [ip0]
//! transport = ip
//! default = true
//! ```
//!
//! `transport` is required; `priority` ranges 0..=100 (default 50) and
//! orders `get_devices` highest first; at most one device may be marked
//! `default`. Unknown keys are carried through untouched for
//! transport-specific use.

use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::Path;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DeviceSpec {
    pub name: String,
    pub transport: String,
    pub priority: u8,
    pub default: bool,
    /// Bind address for IP transports.
    pub ip: Option<IpAddr>,
    /// Interface address for link-level transports.
    pub mac: Option<String>,
}

impl DeviceSpec {
    fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            transport: String::new(),
            priority: 50,
            default: false,
            ip: None,
            mac: None,
        }
    }
}

#[derive(Debug, Fail)]
pub enum ConfigError {
    #[fail(display = "line {}: {}", _0, _1)]
    Parse(usize, String),
    #[fail(display = "device `{}` missing required key `transport`", _0)]
    MissingTransport(String),
    #[fail(display = "device `{}` priority out of range (0..=100)", _0)]
    PriorityRange(String),
    #[fail(display = "more than one device marked default")]
    MultipleDefaults,
    #[fail(display = "{}", _0)]
    Io(#[cause] io::Error),
}

impl From<io::Error> for ConfigError {
    fn from(x: io::Error) -> Self {
        ConfigError::Io(x)
    }
}

pub fn load(path: &Path) -> Result<Vec<DeviceSpec>, ConfigError> {
    parse(&fs::read_to_string(path)?)
}

pub fn parse(text: &str) -> Result<Vec<DeviceSpec>, ConfigError> {
    let mut devices: Vec<DeviceSpec> = Vec::new();
    let mut current: Option<DeviceSpec> = None;
    for (i, raw) in text.lines().enumerate() {
        let lineno = i + 1;
        let line = match raw.find(|c| c == '#' || c == ';') {
            Some(pos) => &raw[..pos],
            None => raw,
        }.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('[') {
            if !line.ends_with(']') || line.len() < 3 {
                return Err(ConfigError::Parse(lineno, "malformed section header".into()));
            }
            if let Some(dev) = current.take() {
                finish(dev, &mut devices)?;
            }
            current = Some(DeviceSpec::new(&line[1..line.len() - 1]));
            continue;
        }
        let eq = line
            .find('=')
            .ok_or_else(|| ConfigError::Parse(lineno, "expected `key = value`".into()))?;
        let (key, value) = (line[..eq].trim(), line[eq + 1..].trim());
        let dev = current
            .as_mut()
            .ok_or_else(|| ConfigError::Parse(lineno, "key outside of a device section".into()))?;
        match key {
            "transport" => dev.transport = value.into(),
            "priority" => {
                let p: i64 = value
                    .parse()
                    .map_err(|_| ConfigError::Parse(lineno, "priority is not a number".into()))?;
                if p < 0 || p > 100 {
                    return Err(ConfigError::PriorityRange(dev.name.clone()));
                }
                dev.priority = p as u8;
            }
            "default" => {
                dev.default = match value {
                    "1" | "true" | "yes" => true,
                    "0" | "false" | "no" => false,
                    _ => {
                        return Err(ConfigError::Parse(lineno, "default must be boolean".into()));
                    }
                };
            }
            "ip" => {
                dev.ip = Some(value.parse().map_err(|_| {
                    ConfigError::Parse(lineno, "malformed ip address".into())
                })?);
            }
            "mac" => dev.mac = Some(value.into()),
            // transport-specific keys we do not interpret
            _ => {}
        }
    }
    if let Some(dev) = current.take() {
        finish(dev, &mut devices)?;
    }
    if devices.iter().filter(|d| d.default).count() > 1 {
        return Err(ConfigError::MultipleDefaults);
    }
    // priority order, highest first; file order breaks ties
    devices.sort_by(|a, b| b.priority.cmp(&a.priority));
    Ok(devices)
}

fn finish(dev: DeviceSpec, devices: &mut Vec<DeviceSpec>) -> Result<(), ConfigError> {
    if dev.transport.is_empty() {
        return Err(ConfigError::MissingTransport(dev.name));
    }
    devices.push(dev);
    Ok(())
}

/// The device list used when no configuration file is present: one UDP
/// device on the wildcard address.
pub fn default_devices() -> Vec<DeviceSpec> {
    let mut dev = DeviceSpec::new("ip0");
    dev.transport = "ip".into();
    dev.default = true;
    vec![dev]
}
