//! Inbound side of the mapping: topic + payload in, store tasks out.

use super::cache::ModeCache;
use super::catalog::{self, AttributeSchema};
use super::error::PayloadError;
use super::topic::{sanitize, sanitize_leaf, Direction, Leaf, Topic};
use crate::color::{byte_to_percent, channel_byte, ColorRole};
use crate::device::Device;
use crate::store::{CommonPatch, StateObject, StateValue, ValueType};
use crate::tasks::Task;
use serde_json::Value;
use tracing::{debug, warn};

/// Which topics may materialize attributes missing from the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverFlags {
    /// `tele/<device>/SENSOR`, read-only entries
    pub tele_sensor: bool,
    /// `tele/<device>/STATE`, read-only entries
    pub tele_state: bool,
    /// `stat/<device>/RESULT`, read-write entries
    pub stat_result: bool,
    /// Create Hue/Saturation entries next to a Color
    pub hue_calc: bool,
}

impl Default for ResolverFlags {
    fn default() -> Self {
        Self {
            tele_sensor: true,
            tele_state: false,
            stat_result: false,
            hue_calc: true,
        }
    }
}

/// How a topic is handled.
enum Dispatch<'t> {
    Record(Option<&'static str>),
    Attribute(&'t str),
    Ignore,
}

pub struct Resolver {
    namespace: String,
    flags: ResolverFlags,
}

impl Resolver {
    pub fn new(namespace: impl Into<String>, flags: ResolverFlags) -> Self {
        Self {
            namespace: namespace.into(),
            flags,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn flags(&self) -> ResolverFlags {
        self.flags
    }

    /// `<namespace>.<object_id>`
    pub fn device_base(&self, device: &Device) -> String {
        format!("{}.{}", self.namespace, device.object_id)
    }

    /// Id of the flag that controls whether reported colors are copied in.
    pub fn read_colors_id(&self, device: &Device) -> String {
        format!("{}.modeReadColors", self.device_base(device))
    }

    /// Turns one inbound message into store tasks.
    ///
    /// `read_colors` is the device's current read-colors flag; the caller
    /// resolves it through the [`ModeCache`] before calling. The device's
    /// fallback segment and command topics are updated in place.
    pub fn ingest(
        &self,
        topic: &Topic,
        payload: &str,
        device: &mut Device,
        read_colors: bool,
        cache: &mut ModeCache,
    ) -> Result<Vec<Task>, PayloadError> {
        if device.fallback_segment.is_none() {
            device.fallback_segment = topic.device_segment.clone();
        }

        let payload = rewrite_nan(payload);
        let dispatch = match (&topic.direction, &topic.leaf) {
            (_, Leaf::Lwt) => Dispatch::Ignore,
            (_, Leaf::Result) if is_power_echo(&payload) => {
                debug!("[{}] Ignoring power echo on {}", device.client_id, topic.raw);
                Dispatch::Ignore
            }
            (Direction::Status | Direction::Telemetry, Leaf::Result) => Dispatch::Record(None),
            (Direction::Telemetry, Leaf::State | Leaf::Sensor | Leaf::Wakeup) => {
                Dispatch::Record(None)
            }
            (Direction::Telemetry, Leaf::Info) => Dispatch::Record(Some("INFO")),
            (Direction::Telemetry, Leaf::Energy) => Dispatch::Record(Some("ENERGY")),
            (_, Leaf::Attribute(name)) => Dispatch::Attribute(name.as_str()),
            _ => {
                debug!("Cannot process: {}", topic.raw);
                Dispatch::Ignore
            }
        };

        match dispatch {
            Dispatch::Ignore => Ok(Vec::new()),
            Dispatch::Attribute(name) => Ok(self.single_attribute(topic, name, &payload, device)),
            Dispatch::Record(prefix) => {
                let record: Value =
                    serde_json::from_str(&payload).map_err(|source| PayloadError::Json {
                        topic: topic.raw.clone(),
                        source,
                    })?;

                let mut walk = Walk {
                    base: self.device_base(device),
                    hue_calc: self.flags.hue_calc,
                    discover: self.discovery(topic),
                    device_segment: topic.device_segment.clone(),
                    prefix,
                    read_colors,
                    device,
                    cache,
                    tasks: Vec::new(),
                };
                walk.walk(&record, None, Vec::new());
                Ok(walk.tasks)
            }
        }
    }

    /// `Some(write)` when unknown attributes on this topic are materialized.
    fn discovery(&self, topic: &Topic) -> Option<bool> {
        match (&topic.direction, &topic.leaf) {
            (Direction::Telemetry, Leaf::Sensor) if self.flags.tele_sensor => Some(false),
            (Direction::Telemetry, Leaf::State) if self.flags.tele_state => Some(false),
            (Direction::Status, Leaf::Result) if self.flags.stat_result => Some(true),
            _ => None,
        }
    }

    /// A topic whose leaf is itself a catalog attribute, e.g. `stat/sonoff/POWER = ON`.
    fn single_attribute(
        &self,
        topic: &Topic,
        name: &str,
        payload: &str,
        device: &mut Device,
    ) -> Vec<Task> {
        let Some(schema) = catalog::lookup(name) else {
            debug!("Cannot process: {}", topic.raw);
            return Vec::new();
        };

        let id = format!("{}.{}", self.device_base(device), sanitize_leaf(name));
        let common = schema.common(format!("{} {}", device.client_id, name));
        let value = match schema.value_type {
            ValueType::Number => parse_number(payload).map(StateValue::Number),
            ValueType::Boolean => switch_token(payload).map(StateValue::Bool),
            ValueType::String | ValueType::Array if name == "Color" => Some(StateValue::String(
                format!("#{}", payload.trim().trim_start_matches('#')),
            )),
            ValueType::String | ValueType::Array => Some(StateValue::from(payload)),
        };

        if topic.direction == Direction::Command {
            device
                .topic_map
                .insert(name.to_string(), topic.raw.clone());
        }

        vec![Task::create_with_value(StateObject::state(id, common), value)]
    }
}

/// One recursive pass over a JSON record.
struct Walk<'a> {
    base: String,
    hue_calc: bool,
    discover: Option<bool>,
    device_segment: Option<String>,
    prefix: Option<&'static str>,
    read_colors: bool,
    device: &'a mut Device,
    cache: &'a mut ModeCache,
    tasks: Vec<Task>,
}

impl Walk<'_> {
    fn walk(&mut self, node: &Value, unit: Option<String>, path: Vec<String>) {
        let fields: Vec<(String, &Value)> = match node {
            Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .map(|(i, v)| (i.to_string(), v))
                .collect(),
            _ => return,
        };

        // TempUnit covers every Temperature on this level and below,
        // wherever it sits among the fields
        let unit = node
            .get("TempUnit")
            .and_then(Value::as_str)
            .map(normalize_unit)
            .or(unit);

        for (name, value) in fields {
            if name == "Time" || name == "TempUnit" || value.is_null() {
                continue;
            }

            let schema = catalog::lookup(&name);
            if value.is_object() || value.is_array() {
                match schema {
                    Some(schema) if schema.value_type == ValueType::Array => {
                        self.fan_out_array(schema, value, &path)
                    }
                    _ => {
                        let mut nested = path.clone();
                        nested.push(sanitize(&name));
                        self.walk(value, unit.clone(), nested);
                    }
                }
            } else if let Some(schema) = schema {
                self.known_scalar(schema, value, unit.as_deref(), &path);
            } else if let Some(write) = self.discover {
                self.discovered_scalar(&name, value, write, &path);
            }
        }
    }

    fn entry_id(&self, path: &[String], name: &str) -> String {
        let mut id = format!("{}.", self.base);
        if let Some(prefix) = self.prefix {
            id.push_str(prefix);
            id.push('.');
        }
        if !path.is_empty() {
            id.push_str(&path.join("_"));
            id.push('_');
        }
        id.push_str(&sanitize(name));
        id
    }

    fn entry_name(&self, path: &[String], name: &str) -> String {
        let mut parts = vec![self.device.client_id.as_str()];
        parts.extend(self.prefix);
        parts.extend(path.iter().map(String::as_str));
        parts.push(name);
        parts.join(" ")
    }

    fn known_scalar(
        &mut self,
        schema: &AttributeSchema,
        value: &Value,
        unit: Option<&str>,
        path: &[String],
    ) {
        let tree_name = schema.tree_name();
        let id = self.entry_id(path, tree_name);
        let mut common = schema.common(self.entry_name(path, tree_name));

        if schema.name == "Temperature" {
            common.unit = Some(unit.unwrap_or("°C").to_string());
        }

        if schema.store_map {
            if let Some(segment) = &self.device_segment {
                self.device
                    .topic_map
                    .insert(tree_name.to_string(), format!("cmnd/{}/{}", segment, tree_name));
            }
        }

        if schema.name == "Color" {
            let Some(raw) = value.as_str() else {
                warn!("[{}] Color is not a string: {}", self.device.client_id, value);
                return;
            };
            let role = ColorRole::from_len(raw.len());
            common.role = role.role_name().to_string();
            let shown = self.read_colors.then(|| StateValue::String(format!("#{}", raw)));
            self.tasks
                .push(Task::create_with_value(StateObject::state(&id, common), shown));
            self.track_role(&id, role, path);
            self.fan_out_color(raw, role, path);
            return;
        }

        let typed = typed_value(schema.value_type, value);
        self.tasks
            .push(Task::create_with_value(StateObject::state(id, common), typed));
    }

    fn discovered_scalar(&mut self, name: &str, value: &Value, write: bool, path: &[String]) {
        let number = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => parse_number(s),
            _ => None,
        };
        let mut common = AttributeSchema::inferred(number.is_some(), write);
        common.name = self.entry_name(path, name);
        let typed = match number {
            Some(n) => StateValue::Number(n),
            None => StateValue::String(text_of(value)),
        };

        debug!("[{}] Auto insert object {}", self.device.client_id, name);
        let id = self.entry_id(path, name);
        self.tasks
            .push(Task::create_with_value(StateObject::state(id, common), Some(typed)));
    }

    /// `Channel: [100, 0, 0]` becomes `Channel1..Channel3`.
    fn fan_out_array(&mut self, schema: &AttributeSchema, value: &Value, path: &[String]) {
        let Some(items) = value.as_array() else {
            return;
        };
        for (i, item) in items.iter().take(10).enumerate() {
            let name = format!("{}{}", schema.tree_name(), i + 1);
            let mut common = schema.common(self.entry_name(path, &name));
            common.value_type = Some(ValueType::Number);
            let typed = typed_value(ValueType::Number, item);
            let id = self.entry_id(path, &name);
            self.tasks
                .push(Task::create_with_value(StateObject::state(id, common), typed));
        }
    }

    /// Entries derived from a packed color. Channel values are only written
    /// when colors are read from the device.
    fn fan_out_color(&mut self, raw: &str, role: ColorRole, path: &[String]) {
        let read = self.read_colors;
        let percent = |offset: usize| StateValue::Number(byte_to_percent(channel_byte(raw, offset)));
        let power = |offsets: &[usize]| {
            StateValue::Bool(offsets.iter().any(|&o| channel_byte(raw, o) != 0))
        };

        self.derived("modeReadColors", path, None, None);
        self.derived("modeLedExor", path, None, None);
        if self.hue_calc {
            self.derived("Hue", path, None, None);
            self.derived("Saturation", path, None, None);
        }

        self.derived("Red", path, Some(read), read.then(|| percent(0)));
        self.derived("Green", path, Some(read), read.then(|| percent(2)));
        self.derived("Blue", path, Some(read), read.then(|| percent(4)));
        self.derived("RGB_POWER", path, Some(read), read.then(|| power(&[0, 2, 4])));

        if role.has_cw() {
            let cw = role.cw_offset();
            self.derived("CW", path, Some(read), read.then(|| percent(cw)));
            self.derived("CW_POWER", path, Some(read), read.then(|| power(&[cw])));
        }
        if role.has_ww() {
            let ww = role.ww_offset();
            self.derived("WW", path, Some(read), read.then(|| percent(ww)));
            self.derived("WW_POWER", path, Some(read), read.then(|| power(&[ww])));
        }
    }

    fn derived(
        &mut self,
        name: &str,
        path: &[String],
        readable: Option<bool>,
        value: Option<StateValue>,
    ) {
        let Some(schema) = catalog::lookup(name) else {
            return;
        };
        let mut common = schema.common(self.entry_name(path, name));
        if let Some(readable) = readable {
            common.read = readable;
        }
        let id = self.entry_id(path, name);
        self.tasks
            .push(Task::create_with_value(StateObject::state(id, common), value));
    }

    /// Updates the Color role when it differs from the last one seen and
    /// removes white channels the new role does not have.
    fn track_role(&mut self, color_id: &str, role: ColorRole, path: &[String]) {
        let previous = self.cache.swap_role(color_id, role);
        if previous == Some(role) {
            return;
        }

        self.tasks.push(Task::extend(
            color_id,
            CommonPatch {
                role: Some(role.role_name().to_string()),
                ..Default::default()
            },
        ));

        if let Some(previous) = previous {
            debug!(
                "[{}] Color role changed from {} to {}",
                self.device.client_id,
                previous.role_name(),
                role.role_name()
            );
            let kept = white_entries(role);
            for name in white_entries(previous) {
                if !kept.contains(name) {
                    let id = self.entry_id(path, name);
                    self.tasks.push(Task::delete(id));
                }
            }
        }
    }
}

fn white_entries(role: ColorRole) -> &'static [&'static str] {
    match role {
        ColorRole::Rgb => &[],
        ColorRole::Rgbww => &["WW", "WW_POWER"],
        ColorRole::Rgbcwww => &["CW", "CW_POWER", "WW", "WW_POWER"],
    }
}

/// Tasmota prints unquoted `nan` for broken sensors.
fn rewrite_nan(payload: &str) -> String {
    if !payload.contains("nan") {
        return payload.to_string();
    }
    payload
        .replace(":nan,", ":\"NaN\",")
        .replace(":nan}", ":\"NaN\"}")
        .replace(":nan]", ":\"NaN\"]")
}

/// `{"POWER":"ON"}` and `{"POWER":"OFF"}` results only echo a command.
fn is_power_echo(payload: &str) -> bool {
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    compact.starts_with(r#"{"POWER":"ON"}"#) || compact.starts_with(r#"{"POWER":"OFF"}"#)
}

fn normalize_unit(unit: &str) -> String {
    if unit.starts_with('°') {
        unit.to_string()
    } else {
        format!("°{}", unit)
    }
}

/// Finite numbers only; `NaN` from a broken sensor stays a string.
fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

fn switch_token(raw: &str) -> Option<bool> {
    match raw {
        "ON" | "1" | "true" | "on" => Some(true),
        "OFF" | "0" | "false" | "off" => Some(false),
        _ => None,
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn typed_value(value_type: ValueType, value: &Value) -> Option<StateValue> {
    match value_type {
        ValueType::Number => match value {
            Value::Number(n) => n.as_f64().map(StateValue::Number),
            Value::String(s) => parse_number(s).map(StateValue::Number),
            Value::Bool(b) => Some(StateValue::Number(if *b { 1.0 } else { 0.0 })),
            _ => None,
        },
        ValueType::Boolean => {
            let on = match value {
                Value::Bool(b) => *b,
                Value::Number(n) => n.as_f64() == Some(1.0),
                Value::String(s) => matches!(s.to_uppercase().as_str(), "ON" | "TRUE" | "1"),
                _ => false,
            };
            Some(StateValue::Bool(on))
        }
        ValueType::String | ValueType::Array => Some(StateValue::String(text_of(value))),
    }
}
