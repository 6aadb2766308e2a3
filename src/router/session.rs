use crate::pipeline::Pipeline;
use crate::planner::PlanShape;

/// Per-request retry state. Never shared between requests.
#[derive(Debug, Clone)]
pub struct RetrySession {
    original_pipeline: Pipeline,
    writes: bool,
    attempts_made: u32,
    rounds: u32,
    last_plan_shape: Option<PlanShape>,
}

impl RetrySession {
    pub fn new(original_pipeline: Pipeline, writes: bool) -> Self {
        Self {
            original_pipeline,
            writes,
            attempts_made: 0,
            rounds: 0,
            last_plan_shape: None,
        }
    }

    /// The unsplit pipeline every round is planned from.
    pub fn original_pipeline(&self) -> &Pipeline {
        &self.original_pipeline
    }

    pub fn writes(&self) -> bool {
        self.writes
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    pub fn last_plan_shape(&self) -> Option<PlanShape> {
        self.last_plan_shape
    }

    pub fn begin_round(&mut self, shape: PlanShape) {
        self.rounds += 1;
        self.last_plan_shape = Some(shape);
    }

    /// Counts a stale round; true while another round is allowed.
    pub fn record_stale(&mut self, max_stale_retries: u32) -> bool {
        self.attempts_made += 1;
        self.attempts_made <= max_stale_retries
    }
}
