//! State derivation – raw gateway positions to publishable device state.
//!
//! Both functions are total over [`Percent`]; values outside `0..=100` cannot
//! reach them because the gateway layer clamps with [`Percent::saturating`]
//! when it builds a [`DeviceSnapshot`].
//!
//! | Orientation | `target < current` | `target > current` | at rest, terminal | at rest, elsewhere |
//! |---|---|---|---|---|
//! | Normal | `opening` | `closing` | 100 → `closed` | `open` |
//! | Inverted | `closing` | `opening` | 0 → `closed` | `open` |

use vlxbridge_types::{DeviceSnapshot, LimitState, MotionState, Orientation, Percent};

/// Derive the motion state of a device from its current and target position.
///
/// ```
/// use vlxbridge_kernel::derivation::derive_motion;
/// use vlxbridge_types::{MotionState, Orientation, Percent};
///
/// let p = |v| Percent::new(v).unwrap();
/// assert_eq!(derive_motion(p(100), p(100), Orientation::Normal), MotionState::Closed);
/// assert_eq!(derive_motion(p(0), p(0), Orientation::Inverted), MotionState::Closed);
/// assert_eq!(derive_motion(p(30), p(80), Orientation::Normal), MotionState::Closing);
/// ```
pub fn derive_motion(current: Percent, target: Percent, orientation: Orientation) -> MotionState {
    match orientation {
        Orientation::Normal => {
            if target < current {
                MotionState::Opening
            } else if target > current {
                MotionState::Closing
            } else if current == Percent::MAX {
                MotionState::Closed
            } else {
                MotionState::Open
            }
        }
        Orientation::Inverted => {
            if target > current {
                MotionState::Opening
            } else if target < current {
                MotionState::Closing
            } else if current == Percent::MIN {
                MotionState::Closed
            } else {
                MotionState::Open
            }
        }
    }
}

/// `on` when the maximum position limitation keeps the device from its full
/// range.
pub fn derive_limit(max: Percent) -> LimitState {
    if max < Percent::MAX {
        LimitState::On
    } else {
        LimitState::Off
    }
}

/// Everything a device bridge publishes for one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivedState {
    pub position: Percent,
    pub motion: MotionState,
    pub limit: LimitState,
}

/// Derive the full publishable state of a snapshot.
pub fn derive(snapshot: &DeviceSnapshot, orientation: Orientation) -> DerivedState {
    DerivedState {
        position: snapshot.position,
        motion: derive_motion(snapshot.position, snapshot.target, orientation),
        limit: derive_limit(snapshot.limitation_max),
    }
}
