//! Comparator slot model and the slot selection rule.
//!
//! The FPB unit exposes a small fixed number of comparators (commonly 6),
//! each able to redirect one original address to injected code. The device
//! is authoritative about their state: the table is parsed fresh out of
//! every info query, and the workflow never acts on a cached copy when
//! making a reuse decision.

use crate::error::{Error, Result};
use crate::protocol::wire;

// =============================================================================
// Public Interface
// =============================================================================

/// One hardware comparator as reported by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    /// Comparator index on the device.
    pub id: usize,
    /// Whether the comparator currently holds a redirect.
    pub occupied: bool,
    /// Original (patched-over) address, when occupied.
    pub original: u32,
    /// Redirect target address, when occupied.
    pub target: u32,
    /// Size of the injected code, when occupied.
    pub code_size: u32,
}

impl Slot {
    /// Parse one `Slot[n]: ...` line of an info response. Occupied slots
    /// read `Slot[0]: 0x08001234 -> 0x20001000, 120 bytes`; free ones read
    /// `Slot[1]: empty`. Returns `None` for lines that are not slot lines.
    pub(crate) fn parse_line(line: &str) -> Option<Slot> {
        let line = line.trim();
        let rest = line.strip_prefix("Slot[")?;
        let close = rest.find(']')?;
        let id: usize = rest[..close].trim().parse().ok()?;
        let body = rest[close + 1..].trim_start_matches(':').trim();

        if body.eq_ignore_ascii_case("empty") {
            return Some(Slot {
                id,
                occupied: false,
                original: 0,
                target: 0,
                code_size: 0,
            });
        }

        // "0xORIG -> 0xTARGET, N bytes"
        let (addresses, size_part) = match body.split_once(',') {
            Some((a, s)) => (a, Some(s)),
            None => (body, None),
        };
        let (orig_str, target_str) = addresses.split_once("->")?;
        let original = wire::parse_hex_token(orig_str)?;
        let target = wire::parse_hex_token(target_str)?;
        let code_size = size_part
            .and_then(|s| s.split_whitespace().next().map(str::to_owned))
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        Some(Slot {
            id,
            occupied: true,
            original,
            target,
            code_size,
        })
    }
}

/// The slot the workflow decided to use for an injection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotPlan {
    /// A slot already redirecting this exact address: unpatch it first,
    /// then install the new redirect into it.
    Reuse(usize),
    /// A free slot.
    Fresh(usize),
}

impl SlotPlan {
    pub fn slot_id(&self) -> usize {
        match *self {
            SlotPlan::Reuse(id) | SlotPlan::Fresh(id) => id,
        }
    }
}

/// Pick a slot for a redirect of `target_address`.
///
/// A slot already redirecting the exact same address is reused (after
/// being unpatched); otherwise the lowest-numbered free slot is taken.
/// With no match and no free slot the injection cannot proceed, which is
/// an expected, reportable condition, not a fault.
pub(crate) fn choose_slot(slots: &[Slot], target_address: u32) -> Result<SlotPlan> {
    if let Some(slot) = slots
        .iter()
        .find(|s| s.occupied && s.original == target_address)
    {
        return Ok(SlotPlan::Reuse(slot.id));
    }
    let mut free: Vec<&Slot> = slots.iter().filter(|s| !s.occupied).collect();
    free.sort_by_key(|s| s.id);
    match free.first() {
        Some(slot) => Ok(SlotPlan::Fresh(slot.id)),
        None => Err(Error::ResourceExhausted("no available slots".into())),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn occupied(id: usize, original: u32) -> Slot {
        Slot {
            id,
            occupied: true,
            original,
            target: 0x2000_1000,
            code_size: 64,
        }
    }

    fn free(id: usize) -> Slot {
        Slot {
            id,
            occupied: false,
            original: 0,
            target: 0,
            code_size: 0,
        }
    }

    #[test]
    fn parse_occupied_line() {
        let slot = Slot::parse_line("Slot[0]: 0x08001234 -> 0x20001000, 120 bytes").unwrap();
        assert_eq!(slot.id, 0);
        assert!(slot.occupied);
        assert_eq!(slot.original, 0x0800_1234);
        assert_eq!(slot.target, 0x2000_1000);
        assert_eq!(slot.code_size, 120);
    }

    #[test]
    fn parse_empty_line() {
        let slot = Slot::parse_line("Slot[3]: empty").unwrap();
        assert_eq!(slot.id, 3);
        assert!(!slot.occupied);
    }

    #[test]
    fn parse_rejects_non_slot_lines() {
        assert_eq!(Slot::parse_line("Build: Jul 10 2025"), None);
        assert_eq!(Slot::parse_line("Slots: 2/6"), None);
    }

    #[test]
    fn reuse_wins_over_free() {
        let slots = vec![free(0), occupied(1, 0x0800_1234), free(2)];
        let plan = choose_slot(&slots, 0x0800_1234).unwrap();
        assert_eq!(plan, SlotPlan::Reuse(1));
    }

    #[test]
    fn first_free_when_no_match() {
        let slots = vec![occupied(0, 0x0800_9999), free(2), free(1)];
        let plan = choose_slot(&slots, 0x0800_1234).unwrap();
        assert_eq!(plan, SlotPlan::Fresh(1));
    }

    #[test]
    fn exhausted_when_all_busy_and_no_match() {
        let slots = vec![occupied(0, 0x0800_9999), occupied(1, 0x0800_8888)];
        let err = choose_slot(&slots, 0x0800_1234).unwrap_err();
        assert!(matches!(err, crate::error::Error::ResourceExhausted(_)));
    }
}
