//! Input packing, history and rollback replay

pub mod camera;
pub mod codec;
pub mod history;
pub mod packet;
pub mod registry;
pub mod resim;
pub mod snapshot;

pub use codec::{ActionFilter, AnalogAction};
pub use history::{FixedWindowHistory, NetworkBucket};
pub use registry::{ActionRegistry, ActionTable, AnalogPrecision};
pub use resim::{InputApplier, NetworkInputComponent, ResimulationCursor};
pub use snapshot::{DecodedInput, FrameActions, InputSnapshot};
