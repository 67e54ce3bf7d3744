//! Static catalog of the attributes Tasmota firmwares are known to report.
//!
//! Attributes not listed here are only materialized by auto-discovery, see
//! [`AttributeSchema::inferred`].

use crate::store::{ObjectCommon, ValueType};

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeSchema {
    pub name: &'static str,
    pub value_type: ValueType,
    pub role: &'static str,
    pub unit: Option<&'static str>,
    pub read: bool,
    pub write: bool,
    /// Name used in the state tree instead of `name`
    pub replace: Option<&'static str>,
    /// Remember `cmnd/<device>/<name>` as the command topic when seen in a record
    pub store_map: bool,
}

impl AttributeSchema {
    const fn new(name: &'static str, value_type: ValueType, role: &'static str) -> Self {
        Self {
            name,
            value_type,
            role,
            unit: None,
            read: true,
            write: false,
            replace: None,
            store_map: false,
        }
    }

    const fn unit(mut self, unit: &'static str) -> Self {
        self.unit = Some(unit);
        self
    }

    const fn writable(mut self) -> Self {
        self.write = true;
        self
    }

    const fn mapped(mut self) -> Self {
        self.write = true;
        self.store_map = true;
        self
    }

    const fn replaced(mut self, replace: &'static str) -> Self {
        self.replace = Some(replace);
        self
    }

    /// Schema for an attribute missing from the catalog: `number` when the
    /// raw value parses as one, `string` otherwise.
    pub fn inferred(numeric: bool, write: bool) -> ObjectCommon {
        ObjectCommon {
            name: String::new(),
            value_type: Some(if numeric {
                ValueType::Number
            } else {
                ValueType::String
            }),
            role: "value".to_string(),
            unit: None,
            read: true,
            write,
        }
    }

    /// Name of the entry in the state tree.
    pub fn tree_name(&self) -> &'static str {
        self.replace.unwrap_or(self.name)
    }

    pub fn common(&self, name: String) -> ObjectCommon {
        ObjectCommon {
            name,
            value_type: Some(self.value_type),
            role: self.role.to_string(),
            unit: self.unit.map(str::to_string),
            read: self.read,
            write: self.write,
        }
    }
}

use ValueType::{Array, Boolean, Number, String as Text};

static CATALOG: &[AttributeSchema] = &[
    // relays
    AttributeSchema::new("POWER", Boolean, "switch").mapped(),
    AttributeSchema::new("POWER1", Boolean, "switch").mapped(),
    AttributeSchema::new("POWER2", Boolean, "switch").mapped(),
    AttributeSchema::new("POWER3", Boolean, "switch").mapped(),
    AttributeSchema::new("POWER4", Boolean, "switch").mapped(),
    AttributeSchema::new("POWER5", Boolean, "switch").mapped(),
    AttributeSchema::new("POWER6", Boolean, "switch").mapped(),
    AttributeSchema::new("POWER7", Boolean, "switch").mapped(),
    AttributeSchema::new("POWER8", Boolean, "switch").mapped(),
    AttributeSchema::new("Switch1", Boolean, "switch"),
    AttributeSchema::new("Switch2", Boolean, "switch"),
    AttributeSchema::new("Switch3", Boolean, "switch"),
    AttributeSchema::new("Switch4", Boolean, "switch"),
    // light
    AttributeSchema::new("Dimmer", Number, "level.dimmer").unit("%").mapped(),
    AttributeSchema::new("Color", Text, "level.color.rgb").mapped(),
    AttributeSchema::new("CT", Number, "level.color.temperature").mapped(),
    AttributeSchema::new("Channel", Array, "level").unit("%"),
    AttributeSchema::new("Fade", Boolean, "switch").mapped(),
    AttributeSchema::new("Speed", Number, "level").mapped(),
    AttributeSchema::new("Scheme", Number, "level").mapped(),
    AttributeSchema::new("Wakeup", Number, "level").unit("%").mapped(),
    AttributeSchema::new("LedTable", Boolean, "switch").mapped(),
    AttributeSchema::new("modeReadColors", Boolean, "switch.mode.read").writable(),
    AttributeSchema::new("modeLedExor", Boolean, "switch.mode.color").writable(),
    AttributeSchema::new("Hue", Number, "level.color.hue").writable(),
    AttributeSchema::new("Saturation", Number, "level.color.saturation").writable(),
    AttributeSchema::new("Red", Number, "level.color.red").unit("%").writable(),
    AttributeSchema::new("Green", Number, "level.color.green").unit("%").writable(),
    AttributeSchema::new("Blue", Number, "level.color.blue").unit("%").writable(),
    AttributeSchema::new("WW", Number, "level.color.white").unit("%").writable(),
    AttributeSchema::new("CW", Number, "level.color.white").unit("%").writable(),
    AttributeSchema::new("RGB_POWER", Boolean, "switch.light").writable(),
    AttributeSchema::new("WW_POWER", Boolean, "switch.light").writable(),
    AttributeSchema::new("CW_POWER", Boolean, "switch.light").writable(),
    // climate
    AttributeSchema::new("Temperature", Number, "value.temperature").unit("°C"),
    AttributeSchema::new("Humidity", Number, "value.humidity").unit("%"),
    AttributeSchema::new("DewPoint", Number, "value.temperature").unit("°C"),
    AttributeSchema::new("Pressure", Number, "value.pressure").unit("hPa"),
    AttributeSchema::new("SeaPressure", Number, "value.pressure").unit("hPa"),
    AttributeSchema::new("Illuminance", Number, "value.brightness").unit("lx"),
    AttributeSchema::new("CarbonDioxide", Number, "value.co2").unit("ppm"),
    AttributeSchema::new("CO2", Number, "value.co2").unit("ppm"),
    AttributeSchema::new("Analog0", Number, "value"),
    AttributeSchema::new("Analog1", Number, "value"),
    AttributeSchema::new("Analog2", Number, "value"),
    AttributeSchema::new("Analog3", Number, "value"),
    AttributeSchema::new("Analog4", Number, "value"),
    AttributeSchema::new("Counter1", Number, "value"),
    AttributeSchema::new("Counter2", Number, "value"),
    AttributeSchema::new("Counter3", Number, "value"),
    AttributeSchema::new("Counter4", Number, "value"),
    // system
    AttributeSchema::new("Vcc", Number, "value.voltage").unit("V"),
    AttributeSchema::new("Uptime", Number, "value.duration").unit("h"),
    AttributeSchema::new("UpTime", Number, "value.duration")
        .unit("h")
        .replaced("Uptime"),
    AttributeSchema::new("LoadAvg", Number, "value"),
    AttributeSchema::new("RSSI", Number, "value.rssi").unit("%"),
    AttributeSchema::new("Signal", Number, "value.rssi").unit("dBm"),
    AttributeSchema::new("SSId", Text, "info.ssid"),
    AttributeSchema::new("SSID", Text, "info.ssid").replaced("SSId"),
    AttributeSchema::new("Module", Text, "info.module"),
    AttributeSchema::new("Version", Text, "info.version"),
    AttributeSchema::new("FallbackTopic", Text, "info.topic"),
    AttributeSchema::new("GroupTopic", Text, "info.topic"),
    AttributeSchema::new("Hostname", Text, "info.name"),
    AttributeSchema::new("IPAddress", Text, "info.ip"),
    AttributeSchema::new("RestartReason", Text, "info.reason"),
    AttributeSchema::new("WebServerMode", Text, "info"),
    // energy
    AttributeSchema::new("Total", Number, "value.power.consumption").unit("kWh"),
    AttributeSchema::new("Today", Number, "value.power.consumption").unit("kWh"),
    AttributeSchema::new("Yesterday", Number, "value.power.consumption").unit("kWh"),
    AttributeSchema::new("Period", Number, "value.power.consumption").unit("Wh"),
    AttributeSchema::new("Power", Number, "value.power").unit("W"),
    AttributeSchema::new("ApparentPower", Number, "value.power").unit("VA"),
    AttributeSchema::new("ReactivePower", Number, "value.power").unit("VAr"),
    AttributeSchema::new("Factor", Number, "value.power.factor"),
    AttributeSchema::new("Voltage", Number, "value.voltage").unit("V"),
    AttributeSchema::new("Current", Number, "value.current").unit("A"),
];

/// Looks an attribute up by the name the device reports.
pub fn lookup(name: &str) -> Option<&'static AttributeSchema> {
    CATALOG.iter().find(|schema| schema.name == name)
}

/// Channels derived from a packed color; writing any of them runs the
/// color pipeline instead of a plain command.
pub const COLOR_FAMILY: &[&str] = &[
    "Red",
    "Green",
    "Blue",
    "WW",
    "CW",
    "Color",
    "RGB_POWER",
    "WW_POWER",
    "CW_POWER",
    "Hue",
    "Saturation",
];

pub fn is_color_family(attr: &str) -> bool {
    COLOR_FAMILY.contains(&attr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_entries_map_their_command_topic() {
        let power = lookup("POWER3").unwrap();
        assert_eq!(power.value_type, ValueType::Boolean);
        assert!(power.store_map && power.write);
    }

    #[test]
    fn replaced_names() {
        assert_eq!(lookup("UpTime").unwrap().tree_name(), "Uptime");
        assert_eq!(lookup("Uptime").unwrap().tree_name(), "Uptime");
    }

    #[test]
    fn names_are_unique() {
        for (i, a) in CATALOG.iter().enumerate() {
            assert!(
                CATALOG[i + 1..].iter().all(|b| b.name != a.name),
                "duplicate {}",
                a.name
            );
        }
    }

    #[test]
    fn inference_rule() {
        let common = AttributeSchema::inferred(true, false);
        assert_eq!(common.value_type, Some(ValueType::Number));
        assert!(!common.write);
        assert_eq!(AttributeSchema::inferred(false, true).value_type, Some(ValueType::String));
    }
}
