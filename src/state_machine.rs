/// Cry detection state machine
///
/// Idle -> CryActive on a trigger rising edge, back to Idle once the trigger
/// has been quiet past the grace period. Classification requests are gated
/// by a cooldown that is independent of the cry state. Verdicts from the
/// classification service are folded in through `apply_classification`.
///
/// The machine is plain data: the analysis loop is its only owner and the
/// rest of the service sees copies of [`CryState`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Verdict returned by the classification service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub is_verified_cry: bool,

    /// Verification confidence (0.0 - 1.0)
    pub verification_confidence: f32,

    /// Cry type, e.g. "hungry". Only set for verified cries.
    pub label: Option<String>,

    pub label_confidence: Option<f32>,

    pub probability_distribution: Option<BTreeMap<String, f32>>,
}

/// Detector state owned by the analysis loop
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CryState {
    pub is_cry_active: bool,
    pub last_cry_start: Option<Instant>,
    pub last_classification_time: Option<Instant>,
    pub total_detections: u64,
    pub verified_cries: u64,
    pub false_positives: u64,

    /// Verification of the current episode; reset when the cry ends
    pub is_verified_cry: bool,
    pub verification_confidence: f32,

    /// Labelled classification of the current episode.
    /// Always `None` while no cry is active.
    pub current_classification: Option<ClassificationResult>,
}

impl CryState {
    fn clear_episode(&mut self) {
        self.is_verified_cry = false;
        self.verification_confidence = 0.0;
        self.current_classification = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionPhase {
    Idle,
    CryActive { since: Instant },
}

impl fmt::Display for DetectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionPhase::Idle => write!(f, "Idle"),
            DetectionPhase::CryActive { .. } => write!(f, "CryActive"),
        }
    }
}

/// State machine timing parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMachineConfig {
    /// Quiet time after the cry start before the episode may end
    pub grace_period: Duration,

    /// Minimum spacing between classification requests
    pub classification_cooldown: Duration,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(3),
            classification_cooldown: Duration::from_secs(10),
        }
    }
}

/// Phase change produced by a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    CryStarted,
    CryEnded,
}

/// Request to snapshot the rolling buffer and classify it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifyRequest {
    /// Detection number of the episode that asked for it
    pub episode: u64,
    pub requested_at: Instant,
}

/// What the owner of the machine has to do after a tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub transition: Option<Transition>,
    pub classify: Option<ClassifyRequest>,
}

/// How a verdict was folded into the state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictEffect {
    FalsePositive,
    Classified,
    VerifiedUnlabeled,
}

pub struct DetectionStateMachine {
    config: StateMachineConfig,
    phase: DetectionPhase,
    classification_allowed_after: Option<Instant>,
    state: CryState,
}

impl DetectionStateMachine {
    pub fn new(config: StateMachineConfig) -> Self {
        Self {
            config,
            phase: DetectionPhase::Idle,
            classification_allowed_after: None,
            state: CryState::default(),
        }
    }

    /// Advance the machine with the trigger verdict for this tick
    pub fn on_trigger(&mut self, is_cry: bool, now: Instant) -> TickOutcome {
        match self.phase {
            DetectionPhase::Idle => {
                if is_cry {
                    self.start_episode(now)
                } else {
                    TickOutcome::default()
                }
            }

            DetectionPhase::CryActive { since } => {
                let quiet_past_grace =
                    !is_cry && now.saturating_duration_since(since) > self.config.grace_period;

                if quiet_past_grace {
                    self.end_episode()
                } else {
                    TickOutcome::default()
                }
            }
        }
    }

    fn start_episode(&mut self, now: Instant) -> TickOutcome {
        self.phase = DetectionPhase::CryActive { since: now };
        self.state.is_cry_active = true;
        self.state.last_cry_start = Some(now);
        self.state.total_detections += 1;

        info!("Cry detected (#{})", self.state.total_detections);

        let classify = if self.classification_allowed(now) {
            self.classification_allowed_after = Some(now + self.config.classification_cooldown);
            self.state.last_classification_time = Some(now);

            Some(ClassifyRequest {
                episode: self.state.total_detections,
                requested_at: now,
            })
        } else {
            if let Some(last) = self.state.last_classification_time {
                info!(
                    "Classification cooldown active (last: {:.1}s ago)",
                    now.saturating_duration_since(last).as_secs_f32()
                );
            }
            None
        };

        TickOutcome {
            transition: Some(Transition::CryStarted),
            classify,
        }
    }

    fn end_episode(&mut self) -> TickOutcome {
        self.phase = DetectionPhase::Idle;
        self.state.is_cry_active = false;
        self.state.clear_episode();

        info!("Cry stopped");

        TickOutcome {
            transition: Some(Transition::CryEnded),
            classify: None,
        }
    }

    fn classification_allowed(&self, now: Instant) -> bool {
        self.classification_allowed_after
            .map_or(true, |allowed_after| now >= allowed_after)
    }

    /// Fold a verdict for `episode` into the state.
    ///
    /// Counters always move. Verification and classification fields are
    /// only written while that same episode is still active.
    pub fn apply_classification(
        &mut self,
        episode: u64,
        result: ClassificationResult,
    ) -> VerdictEffect {
        let is_current = self.state.is_cry_active && episode == self.state.total_detections;
        if !is_current {
            debug!(
                "Verdict for episode {} arrived after it ended (current: {}, active: {})",
                episode, self.state.total_detections, self.state.is_cry_active
            );
        }

        if !result.is_verified_cry {
            self.state.false_positives += 1;
            warn!(
                "False positive detected by verifier (confidence: {:.2})",
                result.verification_confidence
            );

            if is_current {
                self.state.is_verified_cry = false;
                self.state.verification_confidence = result.verification_confidence;
                self.state.current_classification = None;
            }
            return VerdictEffect::FalsePositive;
        }

        let labelled = result.label.is_some();
        if labelled {
            self.state.verified_cries += 1;
            info!(
                "Cry verified (confidence: {:.2}), classification: {} ({:.2})",
                result.verification_confidence,
                result.label.as_deref().unwrap_or_default(),
                result.label_confidence.unwrap_or_default()
            );
        } else {
            warn!("Cry verified but no usable classification label");
        }

        if is_current {
            self.state.is_verified_cry = true;
            self.state.verification_confidence = result.verification_confidence;
            self.state.current_classification = if labelled { Some(result) } else { None };
        }

        if labelled {
            VerdictEffect::Classified
        } else {
            VerdictEffect::VerifiedUnlabeled
        }
    }

    pub fn phase(&self) -> DetectionPhase {
        self.phase
    }

    pub fn state(&self) -> &CryState {
        &self.state
    }

    /// Back to Idle for a fresh monitoring session. Counters are kept.
    pub fn reset_episode(&mut self) {
        self.phase = DetectionPhase::Idle;
        self.state.is_cry_active = false;
        self.state.clear_episode();
    }
}

impl Default for DetectionStateMachine {
    fn default() -> Self {
        Self::new(StateMachineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: f32) -> Duration {
        Duration::from_secs_f32(s)
    }

    fn verified(label: Option<&str>) -> ClassificationResult {
        ClassificationResult {
            is_verified_cry: true,
            verification_confidence: 0.9,
            label: label.map(str::to_string),
            label_confidence: label.map(|_| 0.8),
            probability_distribution: None,
        }
    }

    fn rejected() -> ClassificationResult {
        ClassificationResult {
            is_verified_cry: false,
            verification_confidence: 0.2,
            label: None,
            label_confidence: None,
            probability_distribution: None,
        }
    }

    #[test]
    fn test_initial_state() {
        let machine = DetectionStateMachine::default();
        assert_eq!(machine.phase(), DetectionPhase::Idle);
        assert_eq!(machine.phase().to_string(), "Idle");
        assert_eq!(machine.state(), &CryState::default());
    }

    #[test]
    fn test_rising_edge() {
        let mut machine = DetectionStateMachine::default();
        let t0 = Instant::now();

        let outcome = machine.on_trigger(true, t0);

        assert_eq!(machine.phase(), DetectionPhase::CryActive { since: t0 });
        assert_eq!(machine.phase().to_string(), "CryActive");
        assert_eq!(machine.state().total_detections, 1);
        assert!(machine.state().is_cry_active);
        assert_eq!(outcome.transition, Some(Transition::CryStarted));
        assert_eq!(
            outcome.classify,
            Some(ClassifyRequest { episode: 1, requested_at: t0 })
        );
    }

    #[test]
    fn test_quiet_within_grace_stays_active() {
        let mut machine = DetectionStateMachine::default();
        let t0 = Instant::now();

        machine.on_trigger(true, t0);
        let outcome = machine.on_trigger(false, t0 + secs(2.9));

        assert!(machine.state().is_cry_active);
        assert_eq!(outcome, TickOutcome::default());
    }

    #[test]
    fn test_quiet_past_grace_returns_to_idle() {
        let mut machine = DetectionStateMachine::default();
        let t0 = Instant::now();

        machine.on_trigger(true, t0);
        machine.apply_classification(1, verified(Some("hungry")));
        assert!(machine.state().current_classification.is_some());

        let outcome = machine.on_trigger(false, t0 + secs(3.1));

        assert_eq!(machine.phase(), DetectionPhase::Idle);
        assert_eq!(outcome.transition, Some(Transition::CryEnded));
        assert!(!machine.state().is_cry_active);
        assert!(machine.state().current_classification.is_none());
        assert!(!machine.state().is_verified_cry);
        assert_eq!(machine.state().verification_confidence, 0.0);
    }

    #[test]
    fn test_sustained_cry_is_one_episode() {
        let mut machine = DetectionStateMachine::default();
        let t0 = Instant::now();

        machine.on_trigger(true, t0);
        for i in 1..20 {
            let outcome = machine.on_trigger(true, t0 + secs(i as f32 * 0.5));
            assert_eq!(outcome, TickOutcome::default());
        }

        assert_eq!(machine.state().total_detections, 1);
    }

    #[test]
    fn test_cooldown_suppresses_second_request() {
        let mut machine = DetectionStateMachine::default();
        let t0 = Instant::now();

        let first = machine.on_trigger(true, t0);
        machine.on_trigger(false, t0 + secs(3.5));
        let second = machine.on_trigger(true, t0 + secs(5.0));

        assert!(first.classify.is_some());
        assert_eq!(second.transition, Some(Transition::CryStarted));
        assert!(second.classify.is_none());
        assert_eq!(machine.state().total_detections, 2);
    }

    #[test]
    fn test_cooldown_elapsed_allows_second_request() {
        let mut machine = DetectionStateMachine::default();
        let t0 = Instant::now();

        let first = machine.on_trigger(true, t0);
        machine.on_trigger(false, t0 + secs(4.0));
        let second = machine.on_trigger(true, t0 + secs(10.5));

        assert!(first.classify.is_some());
        assert_eq!(
            second.classify,
            Some(ClassifyRequest { episode: 2, requested_at: t0 + secs(10.5) })
        );
    }

    #[test]
    fn test_false_positive_verdict() {
        let mut machine = DetectionStateMachine::default();
        machine.on_trigger(true, Instant::now());

        let effect = machine.apply_classification(1, rejected());

        assert_eq!(effect, VerdictEffect::FalsePositive);
        assert_eq!(machine.state().false_positives, 1);
        assert_eq!(machine.state().verified_cries, 0);
        assert!(machine.state().current_classification.is_none());
        // Still acoustically active
        assert!(machine.state().is_cry_active);
    }

    #[test]
    fn test_labelled_verdict() {
        let mut machine = DetectionStateMachine::default();
        machine.on_trigger(true, Instant::now());

        let effect = machine.apply_classification(1, verified(Some("hungry")));

        assert_eq!(effect, VerdictEffect::Classified);
        assert_eq!(machine.state().verified_cries, 1);
        assert!(machine.state().is_verified_cry);
        let classification = machine.state().current_classification.as_ref().unwrap();
        assert_eq!(classification.label.as_deref(), Some("hungry"));
        assert_eq!(classification.label_confidence, Some(0.8));
    }

    #[test]
    fn test_verified_without_label() {
        let mut machine = DetectionStateMachine::default();
        machine.on_trigger(true, Instant::now());

        let effect = machine.apply_classification(1, verified(None));

        assert_eq!(effect, VerdictEffect::VerifiedUnlabeled);
        assert_eq!(machine.state().verified_cries, 0);
        assert!(machine.state().is_verified_cry);
        assert!(machine.state().current_classification.is_none());
    }

    #[test]
    fn test_late_verdict_keeps_idle_invariant() {
        let mut machine = DetectionStateMachine::default();
        let t0 = Instant::now();

        machine.on_trigger(true, t0);
        machine.on_trigger(false, t0 + secs(4.0));

        let effect = machine.apply_classification(1, verified(Some("tired")));

        assert_eq!(effect, VerdictEffect::Classified);
        assert_eq!(machine.state().verified_cries, 1);
        assert!(!machine.state().is_cry_active);
        assert!(machine.state().current_classification.is_none());
        assert!(!machine.state().is_verified_cry);
    }

    #[test]
    fn test_stale_episode_does_not_overwrite_current() {
        let mut machine = DetectionStateMachine::default();
        let t0 = Instant::now();

        machine.on_trigger(true, t0);
        machine.on_trigger(false, t0 + secs(4.0));
        machine.on_trigger(true, t0 + secs(5.0));

        machine.apply_classification(1, verified(Some("belly_pain")));

        assert_eq!(machine.state().total_detections, 2);
        assert!(machine.state().current_classification.is_none());
    }

    #[test]
    fn test_reset_episode_keeps_counters() {
        let mut machine = DetectionStateMachine::default();
        machine.on_trigger(true, Instant::now());
        machine.apply_classification(1, verified(Some("hungry")));

        machine.reset_episode();

        assert_eq!(machine.phase(), DetectionPhase::Idle);
        assert!(machine.state().current_classification.is_none());
        assert_eq!(machine.state().total_detections, 1);
        assert_eq!(machine.state().verified_cries, 1);
    }
}
