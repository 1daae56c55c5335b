use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::input::camera::CameraDelta;
use crate::input::codec::{self, ActionFilter, AnalogActions, DigitalActions};
use crate::input::registry::ActionRegistry;
use crate::util::quat::Quat;
use crate::util::vec2::Vec2;

/// Actions sampled by the game layer for one frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameActions {
    /// Active digital actions, in activation order
    pub digital: Vec<String>,
    /// Present analog actions
    pub analog: FxHashMap<String, Vec2>,
    /// Camera rotation delta, if the camera moved
    pub camera: Option<Quat>,
}

impl FrameActions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_digital(mut self, name: &str) -> Self {
        self.digital.push(name.to_string());
        self
    }

    pub fn with_analog(mut self, name: &str, value: Vec2) -> Self {
        self.analog.insert(name.to_string(), value);
        self
    }

    pub fn with_camera(mut self, rotation: Quat) -> Self {
        self.camera = Some(rotation);
        self
    }
}

/// Packed per-frame input record stored in the history window
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSnapshot {
    pub digital: u64,
    pub analog: u64,
    pub camera: CameraDelta,
}

impl InputSnapshot {
    /// Pack one frame of actions, camera quantized lossily
    pub fn pack<R: ActionRegistry + ?Sized>(
        registry: &R,
        actions: &FrameActions,
        filter: Option<&ActionFilter>,
    ) -> Self {
        let mut digital = codec::pack_digital(registry, &actions.digital, filter);
        let analog = codec::pack_analog(registry, &mut digital, &actions.analog, filter);
        let camera = actions.camera.map_or(CameraDelta::None, CameraDelta::lossy);
        Self {
            digital,
            analog,
            camera,
        }
    }

    /// Same as [`InputSnapshot::pack`] but keeps the camera rotation unquantized
    pub fn pack_raw_camera<R: ActionRegistry + ?Sized>(
        registry: &R,
        actions: &FrameActions,
        filter: Option<&ActionFilter>,
    ) -> Self {
        let mut snapshot = Self::pack(registry, actions, filter);
        snapshot.camera = actions.camera.map_or(CameraDelta::None, CameraDelta::Raw);
        snapshot
    }

    pub fn decode<R: ActionRegistry + ?Sized>(&self, registry: &R) -> DecodedInput {
        DecodedInput {
            digital: codec::unpack_digital(self.digital, registry),
            analog: codec::unpack_analog(self.digital, self.analog, registry),
            camera: self.camera.rotation(),
        }
    }

    /// True when the snapshot carries no input at all (e.g. a backfilled gap)
    pub fn is_empty(&self) -> bool {
        self.digital == 0 && self.analog == 0 && self.camera.is_none()
    }
}

/// Decoded form of an [`InputSnapshot`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedInput {
    pub digital: DigitalActions,
    pub analog: AnalogActions,
    pub camera: Option<Quat>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::registry::{ActionTable, AnalogPrecision};

    fn registry() -> ActionTable {
        let mut table = ActionTable::new();
        table.insert_digital("UP", 3).unwrap();
        table.insert_digital("LEFT", 7).unwrap();
        table.add_analog("MOVE", AnalogPrecision::Uint16).unwrap();
        table
    }

    #[test]
    fn test_pack_and_decode_frame() {
        let table = registry();
        let rotation = Quat::from_axis_angle([0.0, 1.0, 0.0], 0.3);
        let actions = FrameActions::new()
            .with_digital("LEFT")
            .with_digital("UP")
            .with_analog("MOVE", Vec2::new(0.25, -1.0))
            .with_camera(rotation);

        let decoded = InputSnapshot::pack(&table, &actions, None).decode(&table);
        assert_eq!(decoded.digital.as_slice(), &["LEFT", "UP"]);
        assert_eq!(decoded.analog.len(), 1);
        assert!(decoded.analog[0].value.approx_eq(Vec2::new(0.25, -1.0), 0.001));
        assert!(decoded.camera.unwrap().same_rotation(rotation, 1e-5));
    }

    #[test]
    fn test_raw_camera_kept_exact() {
        let table = registry();
        let rotation = Quat::from_axis_angle([1.0, 1.0, 0.0], 1.1);
        let actions = FrameActions::new().with_camera(rotation);
        let snapshot = InputSnapshot::pack_raw_camera(&table, &actions, None);
        assert_eq!(snapshot.camera, CameraDelta::Raw(rotation));
    }

    #[test]
    fn test_default_is_empty() {
        assert!(InputSnapshot::default().is_empty());
        let decoded = InputSnapshot::default().decode(&registry());
        assert!(decoded.digital.is_empty());
        assert!(decoded.analog.is_empty());
        assert!(decoded.camera.is_none());
    }
}
