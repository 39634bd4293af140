//! Fragment Reassembly
//!
//! The peripheral splits each JSON reading into notification-sized fragments
//! shaped `<id>#<partial-payload>`. Fragments for one id arrive in order and
//! are appended until the accumulated text ends in `}`.
//!
//! ```text
//! "a1#{\"t\":1,"   -> pending a1 = {"t":1,
//! "a1#\"v\":2}"    -> complete a1 = {"t":1,"v":2}
//! ```
//!
//! There is no reordering or gap detection: a lost fragment leaves its id
//! pending until the stale-frame sweep evicts it.

use crate::domain::models::CompleteMessage;
use crate::error::FrameError;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Separates the message id from the payload. Only the first occurrence counts.
pub const FRAGMENT_DELIMITER: char = '#';

/// Bounds on incomplete messages held at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyLimits {
    /// Pending frames older than this are evicted by [`FrameReassembler::sweep_expired`].
    /// `Duration::ZERO` disables the sweep.
    pub ttl: Duration,
    /// Creating a frame beyond this count evicts the oldest one. `0` means unbounded.
    pub max_pending: usize,
}

impl Default for ReassemblyLimits {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            max_pending: 32,
        }
    }
}

#[derive(Debug)]
pub struct PendingFrame {
    buffer: String,
    created: Instant,
}

impl PendingFrame {
    pub fn payload(&self) -> &str {
        &self.buffer
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    fn is_complete(&self) -> bool {
        self.buffer.trim_end().ends_with('}')
    }
}

/// An incomplete message dropped to keep memory bounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredFrame {
    pub id: String,
    pub age: Duration,
}

#[derive(Debug, Default)]
pub struct FrameReassembler {
    pending: HashMap<String, PendingFrame>,
    limits: ReassemblyLimits,
    overflowed: Vec<ExpiredFrame>,
}

impl FrameReassembler {
    pub fn new(limits: ReassemblyLimits) -> Self {
        Self {
            pending: HashMap::new(),
            limits,
            overflowed: Vec::new(),
        }
    }

    pub fn process_fragment(&mut self, fragment: &str) -> Result<Option<CompleteMessage>, FrameError> {
        self.process_fragment_at(fragment, Instant::now())
    }

    /// Append one fragment, returning the message it completes, if any.
    ///
    /// A fragment without a delimiter is rejected before any pending state is
    /// touched.
    pub fn process_fragment_at(
        &mut self,
        fragment: &str,
        now: Instant,
    ) -> Result<Option<CompleteMessage>, FrameError> {
        let Some((id, part)) = fragment.split_once(FRAGMENT_DELIMITER) else {
            warn!("Dropping malformed fragment ({} bytes)", fragment.len());
            return Err(FrameError::MalformedFragment {
                fragment: fragment.to_string(),
            });
        };

        if let Some(frame) = self.pending.get_mut(id) {
            frame.buffer.push_str(part);
            trace!("Fragment for {:?}: {} bytes buffered", id, frame.buffer.len());
            if !frame.is_complete() {
                return Ok(None);
            }
            let payload = self.pending.remove(id).map(|f| f.buffer).unwrap_or_default();
            return Ok(Some(Self::emit(id, payload)));
        }

        let frame = PendingFrame {
            buffer: part.to_string(),
            created: now,
        };
        if frame.is_complete() {
            return Ok(Some(Self::emit(id, frame.buffer)));
        }

        // Only a frame that stays pending counts against the cap
        self.make_room(now);
        trace!("Fragment for {:?}: {} bytes buffered", id, frame.buffer.len());
        self.pending.insert(id.to_string(), frame);
        Ok(None)
    }

    /// Evict every pending frame older than the configured TTL.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<ExpiredFrame> {
        let ttl = self.limits.ttl;
        if ttl.is_zero() {
            return Vec::new();
        }

        let stale: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, frame)| now.saturating_duration_since(frame.created) >= ttl)
            .map(|(id, _)| id.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|id| {
                let frame = self.pending.remove(&id)?;
                let age = now.saturating_duration_since(frame.created);
                warn!("Evicting incomplete message {:?} after {:?}", id, age);
                Some(ExpiredFrame { id, age })
            })
            .collect()
    }

    /// Frames evicted because the pending cap was reached since the last call.
    pub fn take_overflowed(&mut self) -> Vec<ExpiredFrame> {
        std::mem::take(&mut self.overflowed)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn pending(&self, id: &str) -> Option<&PendingFrame> {
        self.pending.get(id)
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.overflowed.clear();
    }

    fn emit(id: &str, payload: String) -> CompleteMessage {
        debug!("Message {:?} complete ({} bytes)", id, payload.len());
        CompleteMessage {
            id: id.to_string(),
            payload,
        }
    }

    fn make_room(&mut self, now: Instant) {
        let max = self.limits.max_pending;
        if max == 0 {
            return;
        }

        while self.pending.len() >= max {
            let oldest = self
                .pending
                .iter()
                .min_by_key(|(_, frame)| frame.created)
                .map(|(id, _)| id.clone());
            let Some(id) = oldest else { break };
            if let Some(frame) = self.pending.remove(&id) {
                let age = now.saturating_duration_since(frame.created);
                warn!("Pending frame limit ({}) reached, evicting {:?}", max, id);
                self.overflowed.push(ExpiredFrame { id, age });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassembler() -> FrameReassembler {
        FrameReassembler::new(ReassemblyLimits::default())
    }

    #[test]
    fn test_two_fragment_message() {
        let mut r = reassembler();
        assert_eq!(r.process_fragment("a1#{\"t\":1,").unwrap(), None);
        assert!(r.is_pending("a1"));

        let msg = r.process_fragment("a1#\"v\":2}").unwrap().unwrap();
        assert_eq!(msg.id, "a1");
        assert_eq!(msg.payload, r#"{"t":1,"v":2}"#);
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn test_single_fragment_message() {
        let mut r = reassembler();
        let msg = r.process_fragment("b2#{\"x\":1}").unwrap().unwrap();
        assert_eq!(msg.id, "b2");
        assert_eq!(msg.payload, r#"{"x":1}"#);
        assert!(!r.is_pending("b2"));
    }

    #[test]
    fn test_malformed_fragment_leaves_state_untouched() {
        let mut r = reassembler();
        r.process_fragment("c3#{\"a\":").unwrap();

        let err = r.process_fragment("no-delimiter-here").unwrap_err();
        assert!(matches!(err, FrameError::MalformedFragment { .. }));
        assert_eq!(r.pending_count(), 1);
        assert_eq!(r.pending("c3").unwrap().payload(), "{\"a\":");
    }

    #[test]
    fn test_payload_may_contain_delimiter() {
        let mut r = reassembler();
        let msg = r.process_fragment("d4#{\"tag\":\"#1\"}").unwrap().unwrap();
        assert_eq!(msg.id, "d4");
        assert_eq!(msg.payload, r##"{"tag":"#1"}"##);
    }

    #[test]
    fn test_trailing_whitespace_still_completes() {
        let mut r = reassembler();
        r.process_fragment("e5#{\"a\":1").unwrap();
        let msg = r.process_fragment("e5#}\r\n").unwrap().unwrap();
        assert_eq!(msg.payload, "{\"a\":1}\r\n");
    }

    #[test]
    fn test_interleaved_ids_are_independent() {
        let mut r = reassembler();
        assert!(r.process_fragment("a#{\"n\":").unwrap().is_none());
        assert!(r.process_fragment("b#{\"m\":").unwrap().is_none());
        let b = r.process_fragment("b#2}").unwrap().unwrap();
        let a = r.process_fragment("a#1}").unwrap().unwrap();
        assert_eq!(a.payload, r#"{"n":1}"#);
        assert_eq!(b.payload, r#"{"m":2}"#);
    }

    #[test]
    fn test_id_is_reusable_after_completion() {
        let mut r = reassembler();
        let first = r.process_fragment("f#{\"k\":1}").unwrap().unwrap();
        assert!(r.process_fragment("f#{\"k\":").unwrap().is_none());
        let second = r.process_fragment("f#2}").unwrap().unwrap();
        assert_eq!(first.payload, r#"{"k":1}"#);
        assert_eq!(second.payload, r#"{"k":2}"#);
    }

    #[test]
    fn test_emits_once_per_completion() {
        let mut r = reassembler();
        let fragments = ["g#{", "g#\"a\":[1,", "g#2]", "g#}"];
        let emitted: Vec<_> = fragments
            .iter()
            .filter_map(|f| r.process_fragment(f).unwrap())
            .collect();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].payload, fragments.iter().map(|f| &f[2..]).collect::<String>());
    }

    #[test]
    fn test_sweep_evicts_only_stale_frames() {
        let mut r = FrameReassembler::new(ReassemblyLimits {
            ttl: Duration::from_secs(5),
            max_pending: 0,
        });
        let start = Instant::now();
        r.process_fragment_at("old#{\"a\":", start).unwrap();
        r.process_fragment_at("new#{\"b\":", start + Duration::from_secs(4)).unwrap();

        let expired = r.sweep_expired(start + Duration::from_secs(6));
        assert_eq!(
            expired,
            vec![ExpiredFrame {
                id: "old".to_string(),
                age: Duration::from_secs(6),
            }]
        );
        assert!(r.is_pending("new"));
        assert!(!r.is_pending("old"));
    }

    #[test]
    fn test_zero_ttl_disables_sweep() {
        let mut r = FrameReassembler::new(ReassemblyLimits {
            ttl: Duration::ZERO,
            max_pending: 0,
        });
        let start = Instant::now();
        r.process_fragment_at("a#{", start).unwrap();
        assert!(r.sweep_expired(start + Duration::from_secs(3600)).is_empty());
        assert_eq!(r.pending_count(), 1);
    }

    #[test]
    fn test_cap_evicts_oldest() {
        let mut r = FrameReassembler::new(ReassemblyLimits {
            ttl: Duration::ZERO,
            max_pending: 2,
        });
        let start = Instant::now();
        r.process_fragment_at("a#{", start).unwrap();
        r.process_fragment_at("b#{", start + Duration::from_millis(10)).unwrap();
        // Appending to an existing id never evicts
        r.process_fragment_at("a#\"x\":", start + Duration::from_millis(20)).unwrap();
        assert!(r.take_overflowed().is_empty());

        r.process_fragment_at("c#{", start + Duration::from_millis(30)).unwrap();
        let overflowed = r.take_overflowed();
        assert_eq!(overflowed.len(), 1);
        assert_eq!(overflowed[0].id, "a");
        assert!(r.is_pending("b"));
        assert!(r.is_pending("c"));
        assert!(r.take_overflowed().is_empty());
    }

    #[test]
    fn test_single_fragment_message_does_not_evict() {
        let mut r = FrameReassembler::new(ReassemblyLimits {
            ttl: Duration::ZERO,
            max_pending: 1,
        });
        let start = Instant::now();
        r.process_fragment_at("a#{\"t\":1,", start).unwrap();

        let b = r.process_fragment_at("b#{\"x\":1}", start).unwrap().unwrap();
        assert_eq!(b.payload, r#"{"x":1}"#);
        assert!(r.take_overflowed().is_empty());

        let a = r.process_fragment_at("a#\"v\":2}", start).unwrap().unwrap();
        assert_eq!(a.payload, r#"{"t":1,"v":2}"#);
        assert_eq!(r.pending_count(), 0);
    }
}
