//! Digital/analog input packing
//!
//! Digital word layout (`u64`):
//!
//! ```text
//!  63  62..59   58..54            53..0
//! [dup][count][analog presence][9 x 6-bit digital ids]
//! ```
//!
//! The analog payload word holds the present analog actions back to back,
//! in registry order, starting at bit 0.

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::input::registry::{ActionId, ActionRegistry, AnalogPrecision};
use crate::util::vec2::Vec2;

/// Width of one packed digital id
pub const DIGITAL_ID_BITS: u32 = 6;
/// Mask applied to numeric ids before packing
pub const DIGITAL_ID_MASK: u64 = 0x3F;
/// Digital slots available below the analog presence bits
pub const MAX_DIGITAL_ACTIONS: usize = 9;
/// First analog presence bit in the digital word
pub const ANALOG_PRESENCE_SHIFT: u32 = 54;
/// Analog presence bits available below the count field
pub const MAX_ANALOG_ACTIONS: usize = 5;
/// Offset of the 4-bit digital count field
pub const DIGITAL_COUNT_SHIFT: u32 = 59;
/// Mask of the digital count field (after shifting)
pub const DIGITAL_COUNT_MASK: u64 = 0xF;
/// Reserved duplicate/resend marker, always cleared on the wire
pub const DUPLICATE_BIT: u64 = 1 << 63;
/// Bits available in the analog payload word
pub const ANALOG_PAYLOAD_BITS: u32 = 64;

/// Optional whitelist of actions to pack (e.g. actions replicated to other peers)
pub type ActionFilter = FxHashSet<String>;

/// Decoded digital actions in packing order
pub type DigitalActions = SmallVec<[String; MAX_DIGITAL_ACTIONS]>;

/// Decoded analog actions in registry order
pub type AnalogActions = SmallVec<[AnalogAction; MAX_ANALOG_ACTIONS]>;

/// One decoded analog action
#[derive(Debug, Clone, PartialEq)]
pub struct AnalogAction {
    pub name: String,
    pub precision: AnalogPrecision,
    pub value: Vec2,
}

#[inline]
fn passes(filter: Option<&ActionFilter>, name: &str) -> bool {
    filter.map_or(true, |f| f.contains(name))
}

/// Pack active digital actions into a fresh digital word
///
/// Actions missing from the registry or rejected by `filter` are skipped.
/// Only the first [`MAX_DIGITAL_ACTIONS`] accepted actions are packed.
pub fn pack_digital<R, S>(registry: &R, actions: &[S], filter: Option<&ActionFilter>) -> u64
where
    R: ActionRegistry + ?Sized,
    S: AsRef<str>,
{
    let mut word = 0u64;
    let mut count = 0usize;

    for action in actions {
        let name = action.as_ref();
        if !passes(filter, name) {
            continue;
        }
        let Some(id) = registry.numeric_id_for_action(name) else {
            debug!("Skipping unregistered digital action '{}'", name);
            continue;
        };
        if count == MAX_DIGITAL_ACTIONS {
            warn!(
                "More than {} digital actions active, dropping '{}' and the rest",
                MAX_DIGITAL_ACTIONS, name
            );
            break;
        }
        word |= (u64::from(id) & DIGITAL_ID_MASK) << (count as u32 * DIGITAL_ID_BITS);
        count += 1;
    }

    word |= (count as u64 & DIGITAL_COUNT_MASK) << DIGITAL_COUNT_SHIFT;
    word & !DUPLICATE_BIT
}

/// Number of digital actions recorded in a digital word
#[inline]
pub fn digital_count(word: u64) -> usize {
    ((word >> DIGITAL_COUNT_SHIFT) & DIGITAL_COUNT_MASK) as usize
}

/// Numeric ids recorded in a digital word, in packing order
pub fn digital_ids(word: u64) -> SmallVec<[ActionId; MAX_DIGITAL_ACTIONS]> {
    let mut count = digital_count(word);
    if count > MAX_DIGITAL_ACTIONS {
        warn!("Corrupt digital word: count {} exceeds {} slots", count, MAX_DIGITAL_ACTIONS);
        count = MAX_DIGITAL_ACTIONS;
    }
    (0..count)
        .map(|i| ((word >> (i as u32 * DIGITAL_ID_BITS)) & DIGITAL_ID_MASK) as ActionId)
        .collect()
}

/// Unpack a digital word into action names
pub fn unpack_digital<R: ActionRegistry + ?Sized>(word: u64, registry: &R) -> DigitalActions {
    digital_ids(word)
        .into_iter()
        .filter_map(|id| match registry.action_for_numeric_id(id) {
            Some(name) => Some(name.to_string()),
            None => {
                debug!("Unknown digital action id {} in packed input", id);
                None
            }
        })
        .collect()
}

/// Quantize an analog value in [-1, 1] to `precision`
///
/// Float precision returns the raw bit patterns.
pub fn analog_to_fixed(precision: AnalogPrecision, value: Vec2) -> (u64, u64) {
    if precision.is_float() {
        return (u64::from(value.x.to_bits()), u64::from(value.y.to_bits()));
    }
    let max = ((1u64 << precision.axis_bits()) - 1) as f64;
    let v = value.clamp_unit();
    let q = |c: f32| (((f64::from(c) + 1.0) * 0.5) * max).round() as u64;
    (q(v.x), q(v.y))
}

/// Inverse of [`analog_to_fixed`]
pub fn fixed_to_analog(precision: AnalogPrecision, x: u64, y: u64) -> Vec2 {
    if precision.is_float() {
        return Vec2::new(f32::from_bits(x as u32), f32::from_bits(y as u32));
    }
    let max = ((1u64 << precision.axis_bits()) - 1) as f64;
    let d = |q: u64| ((q as f64 / max) * 2.0 - 1.0) as f32;
    Vec2::new(d(x), d(y))
}

/// Largest quantization error of one axis at `precision`
pub fn quantization_step(precision: AnalogPrecision) -> f32 {
    if precision.is_float() {
        0.0
    } else {
        2.0 / ((1u64 << precision.axis_bits()) - 1) as f32
    }
}

#[inline]
fn axis_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Pack present analog actions
///
/// Sets a presence bit in `digital_word` for each packed action and returns
/// the payload word. Packing stops at the first action that would overflow
/// the 64-bit payload, leaving already packed data intact.
pub fn pack_analog<R: ActionRegistry + ?Sized>(
    registry: &R,
    digital_word: &mut u64,
    values: &FxHashMap<String, Vec2>,
    filter: Option<&ActionFilter>,
) -> u64 {
    let mut payload = 0u64;
    let mut offset = 0u32;

    for (i, desc) in registry.analog_actions_in_order().iter().enumerate() {
        if i >= MAX_ANALOG_ACTIONS {
            warn!("Analog action '{}' is beyond the {} presence bits", desc.name, MAX_ANALOG_ACTIONS);
            break;
        }
        let Some(value) = values.get(&desc.name) else {
            continue;
        };
        if !passes(filter, &desc.name) {
            continue;
        }

        let bits = desc.precision.payload_bits();
        if offset + bits > ANALOG_PAYLOAD_BITS {
            warn!(
                "Analog payload full at bit {}, cannot pack '{}' ({} bits)",
                offset, desc.name, bits
            );
            break;
        }

        let axis = desc.precision.axis_bits();
        let (x, y) = analog_to_fixed(desc.precision, *value);
        payload |= (x & axis_mask(axis)) << offset;
        payload |= (y & axis_mask(axis)) << (offset + axis);
        offset += bits;

        *digital_word |= 1u64 << (ANALOG_PRESENCE_SHIFT + i as u32);
    }

    payload
}

/// Unpack analog actions using the presence bits of `digital_word`
pub fn unpack_analog<R: ActionRegistry + ?Sized>(
    digital_word: u64,
    payload: u64,
    registry: &R,
) -> AnalogActions {
    let mut out = AnalogActions::new();
    let mut offset = 0u32;

    for (i, desc) in registry
        .analog_actions_in_order()
        .iter()
        .take(MAX_ANALOG_ACTIONS)
        .enumerate()
    {
        if digital_word & (1u64 << (ANALOG_PRESENCE_SHIFT + i as u32)) == 0 {
            continue;
        }

        let bits = desc.precision.payload_bits();
        if offset + bits > ANALOG_PAYLOAD_BITS {
            warn!("Corrupt analog payload: '{}' does not fit at bit {}", desc.name, offset);
            break;
        }

        let axis = desc.precision.axis_bits();
        let x = (payload >> offset) & axis_mask(axis);
        let y = (payload >> (offset + axis)) & axis_mask(axis);
        offset += bits;

        out.push(AnalogAction {
            name: desc.name.clone(),
            precision: desc.precision,
            value: fixed_to_analog(desc.precision, x, y),
        });
    }

    out
}
