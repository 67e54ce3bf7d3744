//! Per-device light mode flags and the last inferred color role.
//!
//! Populated from the store on first lookup and afterwards only changed by
//! in-band writes to the flag entries. A flag changed behind the bridge's
//! back stays stale until restart.

use crate::color::ColorRole;
use crate::store::ObjectStore;
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Default)]
pub struct ModeCache {
    read_colors: HashMap<String, bool>,
    led_exor: HashMap<String, bool>,
    roles: HashMap<String, ColorRole>,
}

impl ModeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether colors reported by the device are copied into the tree.
    /// Defaults to off when the entry has no state.
    pub async fn read_colors(&mut self, store: &dyn ObjectStore, id: &str) -> bool {
        if let Some(flag) = self.read_colors.get(id) {
            return *flag;
        }
        let flag = load_flag(store, id).await.unwrap_or(false);
        self.read_colors.insert(id.to_string(), flag);
        flag
    }

    /// Whether white and rgb channels exclude each other. Defaults to on
    /// when the entry has no state.
    pub async fn led_exor(&mut self, store: &dyn ObjectStore, id: &str) -> bool {
        if let Some(flag) = self.led_exor.get(id) {
            return *flag;
        }
        let flag = load_flag(store, id).await.unwrap_or(true);
        self.led_exor.insert(id.to_string(), flag);
        flag
    }

    pub fn cached_read_colors(&self, id: &str) -> Option<bool> {
        self.read_colors.get(id).copied()
    }

    pub fn set_read_colors(&mut self, id: &str, flag: bool) {
        self.read_colors.insert(id.to_string(), flag);
    }

    pub fn set_led_exor(&mut self, id: &str, flag: bool) {
        self.led_exor.insert(id.to_string(), flag);
    }

    /// Records the role of a Color entry and returns the previous one.
    pub fn swap_role(&mut self, color_id: &str, role: ColorRole) -> Option<ColorRole> {
        self.roles.insert(color_id.to_string(), role)
    }
}

async fn load_flag(store: &dyn ObjectStore, id: &str) -> Option<bool> {
    match store.get_state(id).await {
        Ok(state) => state.map(|s| s.val.is_truthy()),
        Err(e) => {
            warn!("Cannot read mode flag {}: {}", id, e);
            None
        }
    }
}
