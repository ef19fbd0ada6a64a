// src/pipeline/stepper.rs
//
// Round-robin lane selection. One lane fires per camera frame, bounding
// concurrent model-inference load to one detection and one depth run per
// three frames on constrained hardware.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Detection,
    Depth,
    /// Re-offer the last spoken guidance to the arbiter.
    SpeechReplay,
}

impl Lane {
    fn next(self) -> Lane {
        match self {
            Lane::Detection => Lane::Depth,
            Lane::Depth => Lane::SpeechReplay,
            Lane::SpeechReplay => Lane::Detection,
        }
    }
}

/// Explicit scheduler state, advanced once per frame from the single
/// scheduling loop.
pub struct PipelineStepper {
    current: Lane,
}

impl PipelineStepper {
    pub fn new() -> Self {
        Self {
            current: Lane::Detection,
        }
    }

    /// Lane for this frame; rotates for the next.
    pub fn advance(&mut self) -> Lane {
        let lane = self.current;
        self.current = self.current.next();
        lane
    }
}

impl Default for PipelineStepper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lanes_rotate_round_robin() {
        let mut s = PipelineStepper::new();
        let lanes: Vec<Lane> = (0..7).map(|_| s.advance()).collect();
        assert_eq!(
            lanes,
            vec![
                Lane::Detection,
                Lane::Depth,
                Lane::SpeechReplay,
                Lane::Detection,
                Lane::Depth,
                Lane::SpeechReplay,
                Lane::Detection,
            ]
        );
    }
}
