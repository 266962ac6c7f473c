//! Inspection outcomes, rework loops and yield loss.
//!
//! Rework is a bounded state machine over (step pointer, rework count): a
//! failed inspection moves the pointer back to the step's rework target until
//! the count reaches the cap, at which point the job is scrapped.

use super::project::{Route, RouteStep};
use super::rng::{RngContext, RngStream};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InspectionResult {
    Passed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapReason {
    ReworkCapExceeded,
    YieldLoss,
}

impl ScrapReason {
    pub fn name(&self) -> &'static str {
        match self {
            ScrapReason::ReworkCapExceeded => "rework_cap_exceeded",
            ScrapReason::YieldLoss => "yield_loss",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReworkDecision {
    /// Move on to the next step
    Continue,
    /// Return to the step at `target_index`; the count is already incremented
    Rework { target_index: usize },
    Scrapped { reason: ScrapReason },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReworkEngine {
    cap: u32,
    enabled: bool,
    yield_loss: bool,
}

impl ReworkEngine {
    pub fn new(cap: u32, enabled: bool, yield_loss: bool) -> Self {
        Self { cap, enabled, yield_loss }
    }

    pub fn cap(&self) -> u32 {
        self.cap
    }

    /// Draw the inspection outcome of an inspection step.
    ///
    /// Returns `None` for non-inspection steps or when rework is disabled; no
    /// draw is consumed in that case.
    pub fn inspect(&self, step: &RouteStep, rng: &mut RngContext) -> Option<InspectionResult> {
        if !self.enabled || !step.is_inspection {
            return None;
        }
        if rng.bernoulli(RngStream::Rework, step.rework_probability) {
            Some(InspectionResult::Failed)
        } else {
            Some(InspectionResult::Passed)
        }
    }

    /// Whether the unit survives the step. Always true unless yield loss is on.
    pub fn apply_yield(&self, step: &RouteStep, rng: &mut RngContext) -> bool {
        if !self.yield_loss || step.yield_rate >= 1.0 {
            return true;
        }
        rng.uniform(RngStream::Rework) < step.yield_rate
    }

    /// Decide what follows an inspection at `step_index`
    pub fn apply_rework_if_needed(
        &self,
        rework_count: &mut u32,
        route: &Route,
        step_index: usize,
        result: InspectionResult,
    ) -> ReworkDecision {
        if result == InspectionResult::Passed {
            return ReworkDecision::Continue;
        }
        if *rework_count >= self.cap {
            return ReworkDecision::Scrapped {
                reason: ScrapReason::ReworkCapExceeded,
            };
        }
        match route.rework_target_index(step_index) {
            Some(target_index) => {
                *rework_count += 1;
                ReworkDecision::Rework { target_index }
            }
            // Validation rejects inspections without an earlier step to return to.
            None => ReworkDecision::Continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route() -> Route {
        Route::new(
            "R1",
            vec![
                RouteStep::new(1, "G1", 1.0),
                RouteStep::new(2, "G2", 1.0),
                RouteStep::new(3, "G3", 0.5).inspection(1.0).with_rework_target(1),
            ],
        )
    }

    #[test]
    fn test_failed_inspection_reworks_until_cap() {
        let engine = ReworkEngine::new(2, true, false);
        let route = route();
        let mut count = 0;

        assert_eq!(
            engine.apply_rework_if_needed(&mut count, &route, 2, InspectionResult::Failed),
            ReworkDecision::Rework { target_index: 0 }
        );
        assert_eq!(
            engine.apply_rework_if_needed(&mut count, &route, 2, InspectionResult::Failed),
            ReworkDecision::Rework { target_index: 0 }
        );
        assert_eq!(count, 2);
        assert_eq!(
            engine.apply_rework_if_needed(&mut count, &route, 2, InspectionResult::Failed),
            ReworkDecision::Scrapped {
                reason: ScrapReason::ReworkCapExceeded
            }
        );
        assert_eq!(count, 2);
    }

    #[test]
    fn test_passed_inspection_continues() {
        let engine = ReworkEngine::new(1, true, false);
        let mut count = 0;
        assert_eq!(
            engine.apply_rework_if_needed(&mut count, &route(), 2, InspectionResult::Passed),
            ReworkDecision::Continue
        );
        assert_eq!(count, 0);
    }

    #[test]
    fn test_inspect_respects_toggle_and_probability() {
        let route = route();
        let mut rng = RngContext::new(4);
        let on = ReworkEngine::new(1, true, false);
        let off = ReworkEngine::new(1, false, false);
        assert_eq!(on.inspect(&route.steps[2], &mut rng), Some(InspectionResult::Failed));
        assert_eq!(on.inspect(&route.steps[0], &mut rng), None);
        assert_eq!(off.inspect(&route.steps[2], &mut rng), None);
    }

    #[test]
    fn test_yield_loss_only_when_enabled() {
        let step = RouteStep::new(1, "G1", 1.0).with_yield(0.000_001);
        let mut rng = RngContext::new(8);
        assert!(ReworkEngine::new(1, true, false).apply_yield(&step, &mut rng));
        let lossy = ReworkEngine::new(1, true, true);
        let survivors = (0..100).filter(|_| lossy.apply_yield(&step, &mut rng)).count();
        assert_eq!(survivors, 0);
    }
}
