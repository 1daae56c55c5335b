//! Action registry contract
//!
//! The registry is owned by the game layer. Its ordering *is* the wire
//! format: both peers must register the same digital ids and the same analog
//! actions in the same order, otherwise packed input decodes to garbage.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::input::codec::{DIGITAL_ID_MASK, MAX_ANALOG_ACTIONS};

/// Numeric id of a digital action (6 bits on the wire)
pub type ActionId = u8;

/// Wire precision of one analog action (per axis)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnalogPrecision {
    /// 8-bit quantized axis
    Uint8,
    /// 16-bit quantized axis
    Uint16,
    /// 32-bit quantized axis (the pair fills the whole payload word)
    Uint32,
    /// Raw IEEE-754 bit patterns (the pair fills the whole payload word)
    Float32,
}

impl AnalogPrecision {
    /// Bits used by one axis
    #[inline]
    pub fn axis_bits(self) -> u32 {
        match self {
            AnalogPrecision::Uint8 => 8,
            AnalogPrecision::Uint16 => 16,
            AnalogPrecision::Uint32 | AnalogPrecision::Float32 => 32,
        }
    }

    /// Bits used by the x/y pair in the payload word
    #[inline]
    pub fn payload_bits(self) -> u32 {
        self.axis_bits() * 2
    }

    #[inline]
    pub fn is_float(self) -> bool {
        matches!(self, AnalogPrecision::Float32)
    }
}

/// One registered analog action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalogActionDesc {
    pub name: String,
    pub precision: AnalogPrecision,
}

/// Lookup surface the codec needs from the game layer
pub trait ActionRegistry {
    /// Numeric id for a digital action, `None` if unregistered
    fn numeric_id_for_action(&self, name: &str) -> Option<ActionId>;

    /// Digital action name for a numeric id, `None` if unregistered
    fn action_for_numeric_id(&self, id: ActionId) -> Option<&str>;

    /// Registered analog actions in wire order
    fn analog_actions_in_order(&self) -> &[AnalogActionDesc];
}

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Action '{0}' is already registered")]
    Duplicate(String),
    #[error("Digital action id {0} is already taken")]
    IdTaken(ActionId),
    #[error("Digital action id {0} does not fit in 6 bits")]
    IdOutOfRange(ActionId),
    #[error("All 64 digital action ids are in use")]
    DigitalIdsExhausted,
    #[error("At most {0} analog actions can be registered")]
    TooManyAnalogActions(usize),
}

/// Default registry implementation backed by hash maps
#[derive(Debug, Default, Clone)]
pub struct ActionTable {
    by_name: FxHashMap<String, ActionId>,
    by_id: FxHashMap<ActionId, String>,
    analog: Vec<AnalogActionDesc>,
}

impl ActionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a digital action with the lowest free id
    pub fn add_digital(&mut self, name: &str) -> Result<ActionId, RegistryError> {
        let id = (0..=DIGITAL_ID_MASK as ActionId)
            .find(|id| !self.by_id.contains_key(id))
            .ok_or(RegistryError::DigitalIdsExhausted)?;
        self.insert_digital(name, id)?;
        Ok(id)
    }

    /// Register a digital action under an explicit id
    pub fn insert_digital(&mut self, name: &str, id: ActionId) -> Result<(), RegistryError> {
        if id > DIGITAL_ID_MASK as ActionId {
            return Err(RegistryError::IdOutOfRange(id));
        }
        if self.by_name.contains_key(name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        if self.by_id.contains_key(&id) {
            return Err(RegistryError::IdTaken(id));
        }
        self.by_name.insert(name.to_string(), id);
        self.by_id.insert(id, name.to_string());
        Ok(())
    }

    /// Append an analog action to the wire order
    pub fn add_analog(&mut self, name: &str, precision: AnalogPrecision) -> Result<(), RegistryError> {
        if self.analog.iter().any(|a| a.name == name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        if self.analog.len() >= MAX_ANALOG_ACTIONS {
            return Err(RegistryError::TooManyAnalogActions(MAX_ANALOG_ACTIONS));
        }
        self.analog.push(AnalogActionDesc {
            name: name.to_string(),
            precision,
        });
        Ok(())
    }

    pub fn digital_count(&self) -> usize {
        self.by_id.len()
    }

    pub fn analog_count(&self) -> usize {
        self.analog.len()
    }
}

impl ActionRegistry for ActionTable {
    fn numeric_id_for_action(&self, name: &str) -> Option<ActionId> {
        self.by_name.get(name).copied()
    }

    fn action_for_numeric_id(&self, id: ActionId) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    fn analog_actions_in_order(&self) -> &[AnalogActionDesc] {
        &self.analog
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_digital_assigns_lowest_free_id() {
        let mut table = ActionTable::new();
        table.insert_digital("JUMP", 0).unwrap();
        table.insert_digital("FIRE", 2).unwrap();

        assert_eq!(table.add_digital("CROUCH").unwrap(), 1);
        assert_eq!(table.add_digital("RELOAD").unwrap(), 3);
        assert_eq!(table.numeric_id_for_action("FIRE"), Some(2));
        assert_eq!(table.action_for_numeric_id(1), Some("CROUCH"));
    }

    #[test]
    fn test_insert_digital_rejects_conflicts() {
        let mut table = ActionTable::new();
        table.insert_digital("UP", 3).unwrap();

        assert_eq!(
            table.insert_digital("UP", 4),
            Err(RegistryError::Duplicate("UP".to_string()))
        );
        assert_eq!(table.insert_digital("DOWN", 3), Err(RegistryError::IdTaken(3)));
        assert_eq!(table.insert_digital("LEFT", 64), Err(RegistryError::IdOutOfRange(64)));
    }

    #[test]
    fn test_digital_ids_exhausted() {
        let mut table = ActionTable::new();
        for i in 0..64 {
            table.add_digital(&format!("A{}", i)).unwrap();
        }
        assert_eq!(table.digital_count(), 64);
        assert_eq!(table.add_digital("ONE_MORE"), Err(RegistryError::DigitalIdsExhausted));
    }

    #[test]
    fn test_analog_order_preserved() {
        let mut table = ActionTable::new();
        table.add_analog("MOVE", AnalogPrecision::Uint16).unwrap();
        table.add_analog("LOOK", AnalogPrecision::Uint8).unwrap();

        let names: Vec<_> = table
            .analog_actions_in_order()
            .iter()
            .map(|a| a.name.as_str())
            .collect();
        assert_eq!(names, vec!["MOVE", "LOOK"]);
    }

    #[test]
    fn test_analog_limit() {
        let mut table = ActionTable::new();
        for i in 0..MAX_ANALOG_ACTIONS {
            table.add_analog(&format!("AXIS{}", i), AnalogPrecision::Uint8).unwrap();
        }
        assert_eq!(
            table.add_analog("EXTRA", AnalogPrecision::Uint8),
            Err(RegistryError::TooManyAnalogActions(MAX_ANALOG_ACTIONS))
        );
    }

    #[test]
    fn test_precision_bits() {
        assert_eq!(AnalogPrecision::Uint8.payload_bits(), 16);
        assert_eq!(AnalogPrecision::Uint16.payload_bits(), 32);
        assert_eq!(AnalogPrecision::Uint32.payload_bits(), 64);
        assert_eq!(AnalogPrecision::Float32.payload_bits(), 64);
        assert!(AnalogPrecision::Float32.is_float());
    }
}
