//! Per-entity input history and rollback replay
//!
//! Several systems may request overlapping resimulations. `start_counter`
//! counts them, `simulation_counter` counts how many of them have replayed
//! the current frame. The frame is decoded once, on the first pass, and the
//! cursor only advances after every requester has seen it.

use tracing::{debug, error};

use crate::input::codec::AnalogAction;
use crate::input::history::NetworkBucket;
use crate::input::registry::ActionRegistry;
use crate::input::snapshot::{DecodedInput, InputSnapshot};
use crate::util::quat::Quat;
use crate::util::wrapping::FrameId;

/// Default window bounds of one entity's input history
pub const DEFAULT_HISTORY_MIN: usize = 16;
pub const DEFAULT_HISTORY_MAX: usize = 32;

/// Receives replayed actions, supplied by the game layer
pub trait InputApplier {
    fn apply_digital(&mut self, frame: FrameId, action: &str);
    fn apply_analog(&mut self, frame: FrameId, action: &AnalogAction);
    fn apply_camera(&mut self, _frame: FrameId, _rotation: Quat) {}
}

/// Replay progress of one entity
#[derive(Debug, Clone, Default)]
pub struct ResimulationCursor {
    start_counter: u32,
    simulation_counter: u32,
    target_frame: Option<FrameId>,
    cache: Option<DecodedInput>,
}

impl ResimulationCursor {
    #[inline]
    pub fn is_active(&self) -> bool {
        self.start_counter > 0
    }

    #[inline]
    pub fn start_counter(&self) -> u32 {
        self.start_counter
    }

    #[inline]
    pub fn simulation_counter(&self) -> u32 {
        self.simulation_counter
    }

    /// Frame the next `simulate` call replays
    #[inline]
    pub fn target_frame(&self) -> Option<FrameId> {
        self.target_frame
    }
}

/// Input history plus resimulation cursor of one networked entity
#[derive(Debug, Clone)]
pub struct NetworkInputComponent {
    pub history: NetworkBucket<InputSnapshot>,
    cursor: ResimulationCursor,
}

impl Default for NetworkInputComponent {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_MIN, DEFAULT_HISTORY_MAX)
    }
}

impl NetworkInputComponent {
    pub fn new(min_size: usize, max_size: usize) -> Self {
        Self {
            history: NetworkBucket::new(min_size, max_size),
            cursor: ResimulationCursor::default(),
        }
    }

    pub fn cursor(&self) -> &ResimulationCursor {
        &self.cursor
    }

    /// Record the input received for `frame`
    pub fn push_input(&mut self, frame: FrameId, snapshot: InputSnapshot) -> bool {
        self.history.push(frame, snapshot)
    }

    /// Register a resimulation request starting after `failed_frame`
    pub fn resimulation_start(&mut self, failed_frame: FrameId) {
        if self.cursor.start_counter == 0 {
            self.cursor.target_frame = Some(failed_frame.wrapping_add(1));
            self.cursor.simulation_counter = 0;
            self.cursor.cache = None;
        }
        self.cursor.start_counter += 1;
    }

    /// Replay the current target frame through `applier`
    ///
    /// Returns whether a snapshot was found for the frame.
    pub fn simulate<R, A>(&mut self, registry: &R, applier: &mut A) -> bool
    where
        R: ActionRegistry + ?Sized,
        A: InputApplier + ?Sized,
    {
        let Some(frame) = self.cursor.target_frame else {
            error!("simulate called without an active resimulation");
            return false;
        };

        if self.cursor.simulation_counter == 0 {
            self.cursor.cache = self.history.get(frame).map(|s| s.decode(registry));
        }

        let found = match &self.cursor.cache {
            Some(decoded) => {
                for action in &decoded.digital {
                    applier.apply_digital(frame, action);
                }
                for action in &decoded.analog {
                    applier.apply_analog(frame, action);
                }
                if let Some(rotation) = decoded.camera {
                    applier.apply_camera(frame, rotation);
                }
                true
            }
            None => {
                debug!("No input snapshot for frame {} to resimulate", frame);
                false
            }
        };

        self.cursor.simulation_counter += 1;
        if self.cursor.simulation_counter >= self.cursor.start_counter {
            self.cursor.target_frame = Some(frame.wrapping_add(1));
            self.cursor.simulation_counter = 0;
            self.cursor.cache = None;
        }
        found
    }

    /// Finish one resimulation request
    pub fn resimulation_end(&mut self) {
        debug_assert_eq!(self.cursor.simulation_counter, 0, "resimulation ended mid-frame");
        if self.cursor.simulation_counter != 0 {
            error!(
                "Resimulation ended mid-frame ({} of {} passes)",
                self.cursor.simulation_counter, self.cursor.start_counter
            );
        }
        if self.cursor.start_counter == 0 {
            error!("resimulation_end without matching resimulation_start");
            return;
        }

        self.cursor.start_counter -= 1;
        if self.cursor.start_counter == 0 {
            self.cursor = ResimulationCursor::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::registry::{ActionTable, AnalogPrecision};
    use crate::input::snapshot::FrameActions;
    use crate::util::vec2::Vec2;

    #[derive(Default)]
    struct Recorder {
        digital: Vec<(FrameId, String)>,
        analog: Vec<(FrameId, String)>,
        camera: Vec<FrameId>,
    }

    impl InputApplier for Recorder {
        fn apply_digital(&mut self, frame: FrameId, action: &str) {
            self.digital.push((frame, action.to_string()));
        }

        fn apply_analog(&mut self, frame: FrameId, action: &AnalogAction) {
            self.analog.push((frame, action.name.clone()));
        }

        fn apply_camera(&mut self, frame: FrameId, _rotation: Quat) {
            self.camera.push(frame);
        }
    }

    fn setup() -> (ActionTable, NetworkInputComponent) {
        let mut table = ActionTable::new();
        table.insert_digital("FIRE", 1).unwrap();
        table.insert_digital("JUMP", 2).unwrap();
        table.add_analog("MOVE", AnalogPrecision::Uint8).unwrap();

        let mut component = NetworkInputComponent::new(4, 16);
        for frame in 10..15u32 {
            let actions = if frame % 2 == 0 {
                FrameActions::new().with_digital("FIRE")
            } else {
                FrameActions::new()
                    .with_digital("JUMP")
                    .with_analog("MOVE", Vec2::new(0.5, 0.0))
                    .with_camera(Quat::from_axis_angle([0.0, 1.0, 0.0], 0.1))
            };
            assert!(component.push_input(frame, InputSnapshot::pack(&table, &actions, None)));
        }
        (table, component)
    }

    #[test]
    fn test_single_resimulation() {
        let (table, mut component) = setup();
        let mut rec = Recorder::default();

        component.resimulation_start(10);
        assert_eq!(component.cursor().target_frame(), Some(11));

        assert!(component.simulate(&table, &mut rec));
        assert!(component.simulate(&table, &mut rec));
        component.resimulation_end();

        assert_eq!(rec.digital, vec![(11, "JUMP".to_string()), (12, "FIRE".to_string())]);
        assert_eq!(rec.analog, vec![(11, "MOVE".to_string())]);
        assert_eq!(rec.camera, vec![11]);
        assert!(!component.cursor().is_active());
        assert_eq!(component.cursor().target_frame(), None);
    }

    #[test]
    fn test_nested_requests_share_frame() {
        let (table, mut component) = setup();
        let mut rec = Recorder::default();

        component.resimulation_start(11);
        component.resimulation_start(13);
        // The first request decides where replay begins
        assert_eq!(component.cursor().target_frame(), Some(12));

        component.simulate(&table, &mut rec);
        assert_eq!(component.cursor().target_frame(), Some(12));
        assert_eq!(component.cursor().simulation_counter(), 1);

        component.simulate(&table, &mut rec);
        assert_eq!(component.cursor().target_frame(), Some(13));
        assert_eq!(component.cursor().simulation_counter(), 0);

        assert_eq!(rec.digital, vec![(12, "FIRE".to_string()), (12, "FIRE".to_string())]);

        component.resimulation_end();
        assert!(component.cursor().is_active());
        component.resimulation_end();
        assert!(!component.cursor().is_active());
    }

    #[test]
    fn test_missing_frame_is_skipped() {
        let (table, mut component) = setup();
        let mut rec = Recorder::default();

        component.resimulation_start(30);
        assert!(!component.simulate(&table, &mut rec));
        assert!(rec.digital.is_empty());
        // Cursor still advances past the missing frame
        assert_eq!(component.cursor().target_frame(), Some(32));
        component.resimulation_end();
    }

    #[test]
    fn test_simulate_while_idle() {
        let (table, mut component) = setup();
        let mut rec = Recorder::default();
        assert!(!component.simulate(&table, &mut rec));
        assert_eq!(component.cursor().start_counter(), 0);
    }
}
