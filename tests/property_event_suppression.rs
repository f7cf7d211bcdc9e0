//! Property: event-index suppression formula
//!
//! `need_event(event, new, old)` must hold exactly when `event` lies in the
//! half-open publish window `[old, new)` under modulo-2^16 arithmetic, for
//! every combination of the three indices. An off-by-one here causes missed
//! or spurious notifications that almost never show up in example-based
//! tests, so the formula is swept against an independent arithmetic model
//! over the whole u16 domain.

use graphite::ring::need_event;
use proptest::prelude::*;

/// Independent model: distance from `old` to `event` computed in u32
/// modular arithmetic, compared against the window length.
fn in_window(event: u16, new: u16, old: u16) -> bool {
    const M: u32 = 1 << 16;
    let window = (new as u32 + M - old as u32) % M;
    let offset = (event as u32 + M - old as u32) % M;
    offset < window
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(2000))]

    /// The wrapping-u16 formula matches the modular model everywhere.
    #[test]
    fn formula_matches_model(event: u16, new: u16, old: u16) {
        prop_assert_eq!(need_event(event, new, old), in_window(event, new, old));
    }

    /// The decision only depends on relative distances: shifting all three
    /// indices by the same amount never changes it.
    #[test]
    fn formula_is_shift_invariant(event: u16, new: u16, old: u16, shift: u16) {
        prop_assert_eq!(
            need_event(event, new, old),
            need_event(
                event.wrapping_add(shift),
                new.wrapping_add(shift),
                old.wrapping_add(shift)
            )
        );
    }

    /// An empty publish window never signals.
    #[test]
    fn empty_window_never_signals(event: u16, idx: u16) {
        prop_assert!(!need_event(event, idx, idx));
    }

    /// A watermark at the window start always signals.
    #[test]
    fn watermark_at_window_start_signals(old: u16, published in 1u16..) {
        prop_assert!(need_event(old, old.wrapping_add(published), old));
    }
}

/// Spot checks at the wrap boundary, mirroring the windows the sweep walks
/// through but pinned to readable values.
#[test]
fn wrap_boundary_cases() {
    assert!(need_event(0xffff, 0x0000, 0xfffe));
    assert!(need_event(0xffff, 0x0001, 0xffff));
    assert!(!need_event(0x0000, 0x0000, 0xffff));
    assert!(need_event(0x0000, 0x0001, 0xffff));
    assert!(!need_event(0x0002, 0x0001, 0xffff));
}
