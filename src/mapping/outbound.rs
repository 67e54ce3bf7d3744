//! Outbound side of the mapping: a state written by the supervising system
//! becomes one or more device commands.
//!
//! Plain attributes are coerced by the stored object type and sent to the
//! device's command topic. The color family goes through a small pipeline
//! that reads the current packed color, patches the affected digits and
//! mirrors derived channels back into the tree. A missing prerequisite is
//! defaulted in the store and the pipeline stops there; the next write then
//! finds it.

use super::cache::ModeCache;
use super::catalog::is_color_family;
use super::error::MappingError;
use crate::color::{
    byte_to_hex, byte_to_percent, channel_byte, hsv_to_rgb, percent_to_byte, replace_channel,
    rgb_to_hex, strip_delimiter, ColorRole,
};
use crate::device::Device;
use crate::store::{ObjectStore, State, StateValue, ValueType};
use tracing::{debug, warn};

/// A payload for one command topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub topic: String,
    pub payload: String,
}

/// Splits `<namespace>.<object path>.<attribute>`.
pub fn split_state_id<'a>(namespace: &str, id: &'a str) -> Option<(&'a str, &'a str)> {
    id.strip_prefix(namespace)?
        .strip_prefix('.')?
        .rsplit_once('.')
}

pub struct Outbound<'a> {
    store: &'a dyn ObjectStore,
    cache: &'a mut ModeCache,
    namespace: &'a str,
    hue_calc: bool,
}

impl<'a> Outbound<'a> {
    pub fn new(
        store: &'a dyn ObjectStore,
        cache: &'a mut ModeCache,
        namespace: &'a str,
        hue_calc: bool,
    ) -> Self {
        Self {
            store,
            cache,
            namespace,
            hue_calc,
        }
    }

    /// Translates a non-acknowledged change of `id` on `device`.
    pub async fn on_state_change(
        &mut self,
        device: &Device,
        attr: &str,
        id: &str,
        state: &State,
    ) -> Result<Vec<Command>, MappingError> {
        let base = format!("{}.{}", self.namespace, device.object_id);
        match attr {
            "modeReadColors" => {
                let flag = state.val.is_truthy();
                self.cache.set_read_colors(id, flag);
                self.store.set_state(id, flag.into(), true).await?;
                Ok(Vec::new())
            }
            "modeLedExor" => {
                let flag = state.val.is_truthy();
                self.cache.set_led_exor(id, flag);
                self.store.set_state(id, flag.into(), true).await?;
                Ok(Vec::new())
            }
            attr if is_color_family(attr) => self.color(device, &base, attr, id, state).await,
            _ => self.scalar(device, attr, id, state).await,
        }
    }

    async fn scalar(
        &mut self,
        device: &Device,
        attr: &str,
        id: &str,
        state: &State,
    ) -> Result<Vec<Command>, MappingError> {
        let object = self
            .store
            .get_object(id)
            .await?
            .ok_or_else(|| MappingError::MissingObject(id.to_string()))?;

        let payload = match object.common.value_type {
            Some(ValueType::Boolean) => on_off(switch_on(&state.val)).to_string(),
            Some(ValueType::Number) => match state.val.as_f64() {
                Some(n) => n.to_string(),
                None => state.val.to_string(),
            },
            _ => state.val.to_string(),
        };
        Ok(vec![command(device, attr, payload)?])
    }

    async fn color(
        &mut self,
        device: &Device,
        base: &str,
        attr: &str,
        id: &str,
        state: &State,
    ) -> Result<Vec<Command>, MappingError> {
        match attr {
            "Color" => self.packed_color(device, base, id, state).await,
            "Red" => self.rgb_channel(device, base, 0, state).await,
            "Green" => self.rgb_channel(device, base, 2, state).await,
            "Blue" => self.rgb_channel(device, base, 4, state).await,
            "RGB_POWER" => self.rgb_power(device, base, state).await,
            "WW_POWER" => self.white_power(device, base, White::Warm, state).await,
            "CW_POWER" => self.white_power(device, base, White::Cold, state).await,
            "WW" => self.white_level(device, base, White::Warm, state).await,
            "CW" => self.white_level(device, base, White::Cold, state).await,
            "Hue" | "Saturation" if self.hue_calc => {
                self.hsv(base, attr, state).await?;
                Ok(Vec::new())
            }
            _ => {
                debug!("Ignoring {} change, hue support is off", attr);
                Ok(Vec::new())
            }
        }
    }

    /// Digits of the current Color state without `#`.
    async fn current_color(&self, color_id: &str) -> Result<Option<String>, MappingError> {
        Ok(self
            .store
            .get_state(color_id)
            .await?
            .and_then(|s| s.val.as_str().map(strip_delimiter)))
    }

    async fn color_role(&self, color_id: &str) -> Result<ColorRole, MappingError> {
        let object = self
            .store
            .get_object(color_id)
            .await?
            .ok_or_else(|| MappingError::MissingObject(color_id.to_string()))?;
        Ok(ColorRole::from_role_name(&object.common.role))
    }

    async fn persist_black(&self, color_id: &str) -> Result<Vec<Command>, MappingError> {
        debug!("No color state for {}, defaulting to black", color_id);
        self.store
            .set_state(color_id, "#000000".into(), false)
            .await?;
        Ok(Vec::new())
    }

    async fn packed_color(
        &mut self,
        device: &Device,
        base: &str,
        id: &str,
        state: &State,
    ) -> Result<Vec<Command>, MappingError> {
        let role = self.color_role(id).await?;
        let Some(raw) = state.val.as_str() else {
            warn!("Color {} is not a string: {}", id, state.val);
            return Ok(Vec::new());
        };

        // white is added by the device; the packed value keeps its length
        let mut digits: String = strip_delimiter(raw).chars().take(6).collect();
        digits.push_str(&"0".repeat(role.white_digits()));
        let commands = vec![command(device, "Color", digits.clone())?];

        for (name, offset) in [("Red", 0), ("Green", 2), ("Blue", 4)] {
            let percent = byte_to_percent(channel_byte(&digits, offset));
            self.store
                .set_state(&format!("{}.{}", base, name), percent.into(), true)
                .await?;
        }
        Ok(commands)
    }

    async fn rgb_channel(
        &mut self,
        device: &Device,
        base: &str,
        offset: usize,
        state: &State,
    ) -> Result<Vec<Command>, MappingError> {
        let digits = byte_to_hex(percent_to_byte(state.val.as_f64().unwrap_or(0.0)));
        let topic = command_topic(device, "Color")?;
        let color_id = format!("{}.Color", base);
        let Some(color) = self.current_color(&color_id).await? else {
            return self.persist_black(&color_id).await;
        };

        let out = replace_channel(&color, offset, 2, &digits);
        self.store
            .set_state(&color_id, format!("#{}", out).into(), false)
            .await?;
        Ok(vec![Command {
            topic,
            payload: out,
        }])
    }

    async fn rgb_power(
        &mut self,
        device: &Device,
        base: &str,
        state: &State,
    ) -> Result<Vec<Command>, MappingError> {
        let on = state.val.is_truthy();
        let color_topic = command_topic(device, "Color")?;
        let power_topic = command_topic(device, "POWER")?;
        let exclusive = self
            .cache
            .led_exor(self.store, &format!("{}.modeLedExor", base))
            .await;
        let color_id = format!("{}.Color", base);
        let Some(color) = self.current_color(&color_id).await? else {
            return self.persist_black(&color_id).await;
        };

        let rgb = if on { "ffffff" } else { "000000" };
        let mut out = replace_channel(&color, 0, 6, rgb);
        if on && exclusive {
            let white = out.len().saturating_sub(6);
            out = format!("{}{}", rgb, "0".repeat(white));

            let role = ColorRole::from_len(color.len());
            let mut cleared = Vec::new();
            if role.has_ww() {
                cleared.push(White::Warm);
            }
            if role.has_cw() {
                cleared.push(White::Cold);
            }
            for white in cleared {
                self.store
                    .set_state(&format!("{}.{}_POWER", base, white.name()), false.into(), true)
                    .await?;
                self.store
                    .set_state(&format!("{}.{}", base, white.name()), 0.0.into(), true)
                    .await?;
            }
        }

        let mut commands = vec![Command {
            topic: color_topic,
            payload: out.clone(),
        }];
        self.store
            .set_state(&color_id, format!("#{}", out).into(), false)
            .await?;
        if on {
            commands.push(Command {
                topic: power_topic,
                payload: "ON".to_string(),
            });
        }
        Ok(commands)
    }

    async fn white_power(
        &mut self,
        device: &Device,
        base: &str,
        white: White,
        state: &State,
    ) -> Result<Vec<Command>, MappingError> {
        let color_id = format!("{}.Color", base);
        let role = self.color_role(&color_id).await?;
        let offset = white.offset(role);
        let on = state.val.is_truthy();
        let color_topic = command_topic(device, "Color")?;
        let power_topic = command_topic(device, "POWER")?;
        let exclusive = self
            .cache
            .led_exor(self.store, &format!("{}.modeLedExor", base))
            .await;
        let Some(color) = self.current_color(&color_id).await? else {
            warn!("No color state for {}", color_id);
            return Ok(Vec::new());
        };

        let mut out = replace_channel(&color, offset, 2, if on { "ff" } else { "00" });
        if on && exclusive {
            out = replace_channel(&out, 0, 6, "000000");
            self.store
                .set_state(&format!("{}.RGB_POWER", base), false.into(), true)
                .await?;
        }

        self.store
            .set_state(&color_id, format!("#{}", out).into(), false)
            .await?;
        let mut commands = vec![Command {
            topic: color_topic,
            payload: out.clone(),
        }];
        let percent = byte_to_percent(channel_byte(&out, offset));
        self.store
            .set_state(&format!("{}.{}", base, white.name()), percent.into(), true)
            .await?;
        if on {
            commands.push(Command {
                topic: power_topic,
                payload: "ON".to_string(),
            });
        }
        Ok(commands)
    }

    async fn white_level(
        &mut self,
        device: &Device,
        base: &str,
        white: White,
        state: &State,
    ) -> Result<Vec<Command>, MappingError> {
        let color_id = format!("{}.Color", base);
        let offset = white.offset(self.color_role(&color_id).await?);
        let digits = byte_to_hex(percent_to_byte(state.val.as_f64().unwrap_or(0.0)));
        let topic = command_topic(device, "Color")?;
        let Some(color) = self.current_color(&color_id).await? else {
            return self.persist_black(&color_id).await;
        };

        let out = replace_channel(&color, offset, 2, &digits);
        self.store
            .set_state(&color_id, format!("#{}", out).into(), true)
            .await?;
        Ok(vec![Command {
            topic,
            payload: out,
        }])
    }

    /// Recomputes Color from Hue, Saturation and Dimmer. The resulting
    /// unacknowledged Color write is what reaches the device.
    async fn hsv(&mut self, base: &str, attr: &str, state: &State) -> Result<(), MappingError> {
        let value = state.val.as_f64().unwrap_or(0.0);
        let Some(dimmer) = self.level_or_default(&format!("{}.Dimmer", base)).await? else {
            return Ok(());
        };

        let (hue, saturation) = if attr == "Hue" {
            let Some(saturation) = self
                .level_or_default(&format!("{}.Saturation", base))
                .await?
            else {
                return Ok(());
            };
            (value.min(359.0), saturation)
        } else {
            let Some(hue) = self.level_or_default(&format!("{}.Hue", base)).await? else {
                return Ok(());
            };
            (hue, value.min(100.0))
        };

        let rgb = hsv_to_rgb(hue, saturation, dimmer);
        self.store
            .set_state(
                &format!("{}.Color", base),
                format!("#{}", rgb_to_hex(rgb)).into(),
                false,
            )
            .await?;
        Ok(())
    }

    /// Numeric state of `id`. When absent it is set to 100 and `None` is
    /// returned.
    async fn level_or_default(&self, id: &str) -> Result<Option<f64>, MappingError> {
        match self.store.get_state(id).await?.and_then(|s| s.val.as_f64()) {
            Some(level) => Ok(Some(level)),
            None => {
                self.store.set_state(id, 100.0.into(), true).await?;
                Ok(None)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum White {
    Warm,
    Cold,
}

impl White {
    fn name(self) -> &'static str {
        match self {
            White::Warm => "WW",
            White::Cold => "CW",
        }
    }

    fn offset(self, role: ColorRole) -> usize {
        match self {
            White::Warm => role.ww_offset(),
            White::Cold => role.cw_offset(),
        }
    }
}

fn command_topic(device: &Device, attr: &str) -> Result<String, MappingError> {
    device
        .command_topic(attr)
        .ok_or_else(|| MappingError::NoTopic(attr.to_string()))
}

fn command(device: &Device, attr: &str, payload: String) -> Result<Command, MappingError> {
    Ok(Command {
        topic: command_topic(device, attr)?,
        payload,
    })
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

/// Truthiness for switch commands; `"false"`, `"off"` and `"0"` are off.
fn switch_on(value: &StateValue) -> bool {
    match value {
        StateValue::Bool(b) => *b,
        StateValue::Number(n) => *n != 0.0,
        StateValue::String(s) => {
            !s.is_empty()
                && !s.eq_ignore_ascii_case("false")
                && !s.eq_ignore_ascii_case("off")
                && s != "0"
        }
    }
}
