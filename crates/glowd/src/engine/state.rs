use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Snapshot of one entity as observed through a gateway.
///
/// States are kept as the host platform's raw strings ("on", "off",
/// "detected", "unavailable", ...) since the automation rules are defined in
/// terms of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    /// Raw state string
    pub state: String,

    /// Attribute map (brightness, friendly_name, ...)
    #[serde(default)]
    pub attributes: serde_json::Map<String, Value>,

    /// When the state last transitioned, epoch milliseconds.
    /// None when the gateway could not provide it.
    pub last_changed_ms: Option<i64>,
}

impl EntityState {
    /// A placeholder for entities seen through attribute topics before their
    /// state topic arrived.
    pub fn unknown() -> Self {
        Self {
            state: "unknown".to_string(),
            attributes: serde_json::Map::new(),
            last_changed_ms: None,
        }
    }

    /// Whether the entity counts as active ("on" for targets, "on" or
    /// "detected" for motion sensors).
    pub fn is_active(&self) -> bool {
        matches!(self.state.as_str(), "on" | "detected")
    }

    /// Native brightness (0-255), when reported.
    pub fn brightness(&self) -> Option<u8> {
        self.attributes
            .get("brightness")
            .and_then(Value::as_u64)
            .map(|b| b.min(255) as u8)
    }

    /// Whether the entity reports a brightness attribute at all.
    pub fn supports_brightness(&self) -> bool {
        self.attributes.contains_key("brightness")
    }
}

/// Convert a 0-100 percentage into the 0-255 native brightness scale.
pub fn percent_to_brightness(percent: u8) -> u8 {
    let percent = percent.min(100) as u32;
    ((percent * 255 + 50) / 100) as u8
}

/// Convert a 0-255 native brightness into a 0-100 percentage.
pub fn brightness_to_percent(brightness: u8) -> u8 {
    ((brightness as u32 * 100 + 127) / 255) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(state: &str) -> EntityState {
        EntityState {
            state: state.to_string(),
            attributes: serde_json::Map::new(),
            last_changed_ms: None,
        }
    }

    #[test]
    fn test_is_active() {
        assert!(entity("on").is_active());
        assert!(entity("detected").is_active());
        assert!(!entity("off").is_active());
        assert!(!entity("unavailable").is_active());
        assert!(!entity("unknown").is_active());
    }

    #[test]
    fn test_brightness_attribute() {
        let mut state = entity("on");
        assert!(!state.supports_brightness());
        assert_eq!(state.brightness(), None);

        state
            .attributes
            .insert("brightness".to_string(), serde_json::json!(128));
        assert!(state.supports_brightness());
        assert_eq!(state.brightness(), Some(128));
    }

    #[test]
    fn test_brightness_scale_conversion() {
        assert_eq!(percent_to_brightness(0), 0);
        assert_eq!(percent_to_brightness(50), 128);
        assert_eq!(percent_to_brightness(100), 255);
        // Out-of-range input clamps rather than wrapping.
        assert_eq!(percent_to_brightness(150), 255);

        assert_eq!(brightness_to_percent(0), 0);
        assert_eq!(brightness_to_percent(128), 50);
        assert_eq!(brightness_to_percent(255), 100);
    }
}
