// src/speech.rs
//
// Serializes candidate instructions into a single speech channel. At most
// one utterance is ever in flight; repetition is bounded by a global
// cooldown, a per-identity cooldown, and a dedup queue. Nothing here blocks:
// completion is reported back through `on_done`/`on_error`.

use crate::types::SpeechConfig;
use anyhow::Result;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

/// External text-to-speech playback. Implementations report completion back
/// to the engine as a message; exactly one done/error per `speak` call.
pub trait SpeechEngine: Send {
    fn speak(&mut self, text: &str) -> Result<()>;
}

pub struct SpeechArbiter {
    engine: Box<dyn SpeechEngine>,
    cfg: SpeechConfig,
    ready: bool,
    speaking: bool,
    last_dispatch_ms: Option<u64>,
    queue: VecDeque<String>,
    identity_last_ms: HashMap<String, u64>,
}

impl SpeechArbiter {
    pub fn new(engine: Box<dyn SpeechEngine>, cfg: SpeechConfig) -> Self {
        Self {
            engine,
            cfg,
            ready: false,
            speaking: false,
            last_dispatch_ms: None,
            queue: VecDeque::new(),
            identity_last_ms: HashMap::new(),
        }
    }

    /// The playback engine finished initializing; flush anything queued.
    pub fn set_ready(&mut self, now_ms: u64) {
        self.ready = true;
        self.pump(now_ms);
    }

    /// Offer a candidate utterance. Depending on cooldowns and current state
    /// it is spoken now, queued, or silently dropped.
    pub fn speak(&mut self, text: &str, identity: Option<&str>, now_ms: u64) {
        if let Some(id) = identity {
            if let Some(&last) = self.identity_last_ms.get(id) {
                if now_ms.saturating_sub(last) < self.cfg.identity_cooldown_ms {
                    debug!("dropping '{text}' (identity '{id}' in cooldown)");
                    return;
                }
            }
            self.identity_last_ms.insert(id.to_string(), now_ms);
        }

        if !self.ready || self.speaking || self.in_global_cooldown(now_ms) {
            self.enqueue(text);
            return;
        }
        self.dispatch(text.to_string(), now_ms);
    }

    /// Playback finished; release the channel and pump the queue.
    pub fn on_done(&mut self, now_ms: u64) {
        self.speaking = false;
        self.pump(now_ms);
    }

    pub fn on_error(&mut self) {
        warn!("speech engine reported an error");
        self.speaking = false;
    }

    /// Called once per cycle so queued items go out as soon as the cooldown
    /// allows, even with no new candidates arriving.
    pub fn tick(&mut self, now_ms: u64) {
        self.pump(now_ms);
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    fn in_global_cooldown(&self, now_ms: u64) -> bool {
        match self.last_dispatch_ms {
            None => false,
            Some(last) => now_ms.saturating_sub(last) < self.cfg.global_cooldown_ms,
        }
    }

    fn enqueue(&mut self, text: &str) {
        if self.queue.iter().any(|q| q == text) {
            return;
        }
        debug!("queueing '{text}'");
        self.queue.push_back(text.to_string());
    }

    fn pump(&mut self, now_ms: u64) {
        if !self.ready || self.speaking || self.in_global_cooldown(now_ms) {
            return;
        }
        if let Some(next) = self.queue.pop_front() {
            self.dispatch(next, now_ms);
        }
    }

    fn dispatch(&mut self, text: String, now_ms: u64) {
        self.speaking = true;
        self.last_dispatch_ms = Some(now_ms);
        info!("🔈 speaking: {text}");
        if let Err(e) = self.engine.speak(&text) {
            warn!("speech dispatch failed: {e:#}");
            self.speaking = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingEngine {
        spoken: Arc<Mutex<Vec<String>>>,
    }

    impl SpeechEngine for RecordingEngine {
        fn speak(&mut self, text: &str) -> Result<()> {
            self.spoken.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn arbiter() -> (SpeechArbiter, Arc<Mutex<Vec<String>>>) {
        let engine = RecordingEngine::default();
        let spoken = engine.spoken.clone();
        let mut arb = SpeechArbiter::new(Box::new(engine), SpeechConfig::default());
        arb.set_ready(0);
        (arb, spoken)
    }

    #[test]
    fn second_call_within_cooldown_queues_without_interrupting() {
        let (mut arb, spoken) = arbiter();
        arb.speak("A", None, 0);
        arb.speak("B", None, 200);
        assert_eq!(spoken.lock().unwrap().as_slice(), ["A"]);
        assert!(arb.is_speaking());
        assert_eq!(arb.queue_len(), 1);
    }

    #[test]
    fn queued_item_dispatches_on_completion_after_cooldown() {
        let (mut arb, spoken) = arbiter();
        arb.speak("A", None, 0);
        arb.speak("B", None, 200);
        // A completes after the global cooldown has elapsed: B goes out with
        // no further speak() call.
        arb.on_done(1500);
        assert_eq!(spoken.lock().unwrap().as_slice(), ["A", "B"]);
    }

    #[test]
    fn queued_item_waits_for_cooldown_then_ticks_out() {
        let (mut arb, spoken) = arbiter();
        arb.speak("A", None, 0);
        arb.speak("B", None, 100);
        arb.on_done(300); // done, but still inside the 1 s cooldown
        assert_eq!(spoken.lock().unwrap().as_slice(), ["A"]);
        arb.tick(900);
        assert_eq!(spoken.lock().unwrap().as_slice(), ["A"]);
        arb.tick(1100);
        assert_eq!(spoken.lock().unwrap().as_slice(), ["A", "B"]);
    }

    #[test]
    fn duplicate_queue_entries_are_dropped() {
        let (mut arb, _) = arbiter();
        arb.speak("A", None, 0);
        arb.speak("B", None, 100);
        arb.speak("B", None, 200);
        arb.speak("B", None, 300);
        assert_eq!(arb.queue_len(), 1);
    }

    #[test]
    fn identity_cooldown_drops_silently() {
        let (mut arb, spoken) = arbiter();
        arb.speak("wall ahead", Some("wall"), 0);
        // Same identity inside its 1 s window: dropped, not queued.
        arb.speak("wall ahead again", Some("wall"), 500);
        assert_eq!(arb.queue_len(), 0);
        arb.on_done(1200);
        assert_eq!(spoken.lock().unwrap().as_slice(), ["wall ahead"]);
        // Past the window it may speak again.
        arb.speak("wall ahead again", Some("wall"), 1500);
        assert_eq!(
            spoken.lock().unwrap().as_slice(),
            ["wall ahead", "wall ahead again"]
        );
    }

    #[test]
    fn not_ready_queues_until_set_ready() {
        let engine = RecordingEngine::default();
        let spoken = engine.spoken.clone();
        let mut arb = SpeechArbiter::new(Box::new(engine), SpeechConfig::default());
        arb.speak("hello", None, 0);
        assert!(spoken.lock().unwrap().is_empty());
        arb.set_ready(100);
        assert_eq!(spoken.lock().unwrap().as_slice(), ["hello"]);
    }

    #[test]
    fn engine_error_releases_the_channel() {
        struct FailingEngine;
        impl SpeechEngine for FailingEngine {
            fn speak(&mut self, _text: &str) -> Result<()> {
                anyhow::bail!("tts backend gone")
            }
        }
        let mut arb = SpeechArbiter::new(Box::new(FailingEngine), SpeechConfig::default());
        arb.set_ready(0);
        arb.speak("A", None, 0);
        assert!(!arb.is_speaking());
    }
}
