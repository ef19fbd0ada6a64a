// src/pipeline/mod.rs
//
// Three lanes consume from one frame producer: detection inference, depth
// inference, and the speech-replay lane. Lane workers receive frames over
// watch channels (keep-only-latest: a busy worker simply never sees the
// frames it missed) and post results back to the single engine task, which
// is the only place engine state is touched.

pub mod stepper;

use crate::depth::DepthMap;
use crate::engine::GuidanceEngine;
use crate::providers::{DepthProvider, DetectionProvider};
use crate::types::{DetectionOutput, Frame};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use stepper::Lane;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Everything that lands on the engine task.
#[derive(Debug)]
pub enum EngineMsg {
    Detections {
        output: DetectionOutput,
        frame_ts_ms: u64,
    },
    DetectionFailed,
    DepthReady {
        map: DepthMap,
        source_ts_ms: u64,
        inference_ms: u64,
    },
    DepthFailed,
    SpeechDone,
    SpeechError,
}

pub struct PipelineRunner {
    engine: GuidanceEngine,
    msg_rx: mpsc::UnboundedReceiver<EngineMsg>,
    detection: Box<dyn DetectionProvider>,
    depth: Box<dyn DepthProvider>,
    msg_tx: mpsc::UnboundedSender<EngineMsg>,
    running: Arc<AtomicBool>,
}

impl PipelineRunner {
    pub fn new(
        engine: GuidanceEngine,
        detection: Box<dyn DetectionProvider>,
        depth: Box<dyn DepthProvider>,
        msg_tx: mpsc::UnboundedSender<EngineMsg>,
        msg_rx: mpsc::UnboundedReceiver<EngineMsg>,
    ) -> Self {
        Self {
            engine,
            msg_rx,
            detection,
            depth,
            msg_tx,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Drive the pipeline until the frame source closes. All engine state
    /// mutation happens on this task; results arriving after shutdown are
    /// discarded with the channels.
    pub async fn run(self, mut frames: mpsc::Receiver<Frame>) -> Result<()> {
        let Self {
            mut engine,
            mut msg_rx,
            detection,
            depth,
            msg_tx,
            running,
        } = self;
        let started = Instant::now();
        let now_ms = move || started.elapsed().as_millis() as u64;

        let (det_tx, det_rx) = watch::channel::<Option<Frame>>(None);
        let (depth_tx, depth_rx) = watch::channel::<Option<Frame>>(None);

        tokio::spawn(detection_worker(
            det_rx,
            detection,
            msg_tx.clone(),
            running.clone(),
        ));
        tokio::spawn(depth_worker(
            depth_rx,
            depth,
            msg_tx.clone(),
            running.clone(),
        ));

        engine.set_speech_ready(now_ms());
        info!("✓ pipeline running");

        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(frame) = frame else { break };
                    match engine.on_frame(&frame, now_ms()) {
                        Lane::Detection => {
                            let _ = det_tx.send(Some(frame));
                        }
                        Lane::Depth => {
                            let _ = depth_tx.send(Some(frame));
                        }
                        Lane::SpeechReplay => {}
                    }
                }
                Some(msg) = msg_rx.recv() => {
                    let now = now_ms();
                    match msg {
                        EngineMsg::Detections { output, frame_ts_ms } => {
                            engine.on_detections(output.boxes, output.inference_ms, frame_ts_ms, now);
                        }
                        EngineMsg::DetectionFailed => {
                            // A failed cycle and an empty one look the same
                            // downstream.
                            engine.on_empty_detections(now);
                        }
                        EngineMsg::DepthReady { map, source_ts_ms, inference_ms } => {
                            engine.on_depth(map, source_ts_ms, inference_ms, now);
                        }
                        EngineMsg::DepthFailed => engine.on_depth_failed(now),
                        EngineMsg::SpeechDone => engine.on_speech_done(now),
                        EngineMsg::SpeechError => engine.on_speech_error(),
                    }
                }
            }
        }

        running.store(false, Ordering::Relaxed);
        info!("pipeline stopped");
        Ok(())
    }
}

async fn detection_worker(
    mut rx: watch::Receiver<Option<Frame>>,
    mut provider: Box<dyn DetectionProvider>,
    tx: mpsc::UnboundedSender<EngineMsg>,
    running: Arc<AtomicBool>,
) {
    while rx.changed().await.is_ok() {
        if !running.load(Ordering::Relaxed) {
            break;
        }
        let frame = rx.borrow_and_update().clone();
        let Some(frame) = frame else { continue };
        let msg = match provider.detect(&frame) {
            Ok(output) => {
                debug!(
                    "detection: {} boxes in {}ms",
                    output.boxes.len(),
                    output.inference_ms
                );
                EngineMsg::Detections {
                    output,
                    frame_ts_ms: frame.timestamp_ms,
                }
            }
            Err(e) => {
                warn!("detection inference failed: {e:#}");
                EngineMsg::DetectionFailed
            }
        };
        if tx.send(msg).is_err() {
            break;
        }
    }
    debug!("detection worker exiting");
}

async fn depth_worker(
    mut rx: watch::Receiver<Option<Frame>>,
    mut provider: Box<dyn DepthProvider>,
    tx: mpsc::UnboundedSender<EngineMsg>,
    running: Arc<AtomicBool>,
) {
    while rx.changed().await.is_ok() {
        if !running.load(Ordering::Relaxed) {
            break;
        }
        let frame = rx.borrow_and_update().clone();
        let Some(frame) = frame else { continue };
        let start = Instant::now();
        let msg = match provider.estimate(&frame) {
            Ok(map) => EngineMsg::DepthReady {
                map,
                source_ts_ms: frame.timestamp_ms,
                inference_ms: start.elapsed().as_millis() as u64,
            },
            Err(e) => {
                warn!("depth inference failed: {e:#}");
                EngineMsg::DepthFailed
            }
        };
        if tx.send(msg).is_err() {
            break;
        }
    }
    debug!("depth worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::NullDisplay;
    use crate::speech::SpeechEngine;
    use crate::types::{Config, DetectionBox};
    use ndarray::Array2;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedDetector {
        calls: Arc<AtomicUsize>,
    }

    impl DetectionProvider for ScriptedDetector {
        fn detect(&mut self, _frame: &Frame) -> Result<DetectionOutput> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(DetectionOutput {
                boxes: vec![DetectionBox {
                    x1: 0.4,
                    y1: 0.4,
                    x2: 0.6,
                    y2: 0.6,
                    cls_name: "chair-center".to_string(),
                    confidence: 0.9,
                }],
                inference_ms: 3,
            })
        }
    }

    struct FlatDepth {
        calls: Arc<AtomicUsize>,
    }

    impl DepthProvider for FlatDepth {
        fn estimate(&mut self, _frame: &Frame) -> Result<DepthMap> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            // 2.0 m everywhere.
            Ok(DepthMap::new(Array2::from_elem((64, 64), 200.0)))
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSpeech {
        spoken: Arc<Mutex<Vec<String>>>,
    }

    impl SpeechEngine for RecordingSpeech {
        fn speak(&mut self, text: &str) -> Result<()> {
            self.spoken.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    fn gray_frame(ts: u64) -> Frame {
        Frame {
            data: vec![120; 32 * 32 * 4],
            width: 32,
            height: 32,
            timestamp_ms: ts,
        }
    }

    #[tokio::test]
    async fn lanes_fire_and_guidance_is_spoken() {
        let det_calls = Arc::new(AtomicUsize::new(0));
        let depth_calls = Arc::new(AtomicUsize::new(0));
        let speech = RecordingSpeech::default();
        let spoken = speech.spoken.clone();

        let engine = GuidanceEngine::new(
            Config::default(),
            Box::new(speech),
            Box::new(NullDisplay),
        );
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let runner = PipelineRunner::new(
            engine,
            Box::new(ScriptedDetector {
                calls: det_calls.clone(),
            }),
            Box::new(FlatDepth {
                calls: depth_calls.clone(),
            }),
            msg_tx,
            msg_rx,
        );

        let (frame_tx, frame_rx) = mpsc::channel(1);
        let handle = tokio::spawn(runner.run(frame_rx));

        for i in 0..12u64 {
            frame_tx.send(gray_frame(i * 33)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Let in-flight results drain before closing the source.
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(frame_tx);
        handle.await.unwrap().unwrap();

        // 12 frames round-robin over 3 lanes: 4 each.
        assert!(det_calls.load(Ordering::Relaxed) >= 2);
        assert!(depth_calls.load(Ordering::Relaxed) >= 2);

        let spoken = spoken.lock().unwrap();
        assert!(!spoken.is_empty(), "a chair dead center must be announced");
        assert!(spoken[0].contains("chair center"), "got: {}", spoken[0]);
    }
}
