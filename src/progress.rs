use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;

/// Share of the bar reserved for normalizing clips; the rest is assembly.
const NORMALIZE_SHARE: f32 = 70.0;
const CONCAT_SHARE: f32 = 10.0;
const MUX_SHARE: f32 = 20.0;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub percent: f32,
    pub stage: String,
}

/// Phase layout for one job, fixed before the first encoder starts:
/// one normalize phase per item, then concat, then mux.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseWeights {
    weights: Vec<f32>,
}

impl PhaseWeights {
    pub fn for_items(item_count: usize) -> Self {
        let n = item_count.max(1);
        let mut weights = vec![NORMALIZE_SHARE / n as f32; n];
        weights.push(CONCAT_SHARE);
        weights.push(MUX_SHARE);
        Self { weights }
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn concat_phase(&self) -> usize {
        self.weights.len() - 2
    }

    pub fn mux_phase(&self) -> usize {
        self.weights.len() - 1
    }
}

/// Overall percent for `local` (0-100) progress within `phase`.
pub fn map_percent(phase: usize, local: f32, weights: &PhaseWeights) -> f32 {
    let phase = phase.min(weights.weights.len().saturating_sub(1));
    let before: f32 = weights.weights[..phase].iter().sum();
    let span = weights.weights.get(phase).copied().unwrap_or(0.0);
    (before + span * local.clamp(0.0, 100.0) / 100.0).clamp(0.0, 100.0)
}

/// Job-scoped progress sink. Sends never block and never fail the job; a
/// dropped receiver just means nobody is listening. Percent is kept
/// monotonic even when clips finish out of order.
#[derive(Clone)]
pub struct ProgressReporter {
    tx: Option<UnboundedSender<ProgressEvent>>,
    weights: PhaseWeights,
    last: Arc<Mutex<f32>>,
}

impl ProgressReporter {
    pub fn new(tx: Option<UnboundedSender<ProgressEvent>>, weights: PhaseWeights) -> Self {
        Self { tx, weights, last: Arc::new(Mutex::new(0.0)) }
    }

    pub fn silent(weights: PhaseWeights) -> Self {
        Self::new(None, weights)
    }

    pub fn weights(&self) -> &PhaseWeights {
        &self.weights
    }

    /// Report progress inside a phase. Values that would move the bar
    /// backwards are swallowed; 100 is reserved for `complete`.
    pub fn phase(&self, phase: usize, local: f32, stage: &str) {
        let percent = map_percent(phase, local, &self.weights).min(99.9);
        self.report(percent, stage);
    }

    /// Final 100% event. Consumes the reporter so it can only happen once.
    pub fn complete(self) {
        self.report(100.0, "done");
    }

    fn report(&self, percent: f32, stage: &str) {
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if percent < *last || (percent == *last && percent > 0.0) {
            return;
        }
        *last = percent;
        if let Some(tx) = &self.tx {
            let _ = tx.send(ProgressEvent { percent, stage: stage.to_string() });
        }
    }

    pub fn last_percent(&self) -> f32 {
        match self.last.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn weights_cover_the_whole_bar() {
        for n in 1..10 {
            let w = PhaseWeights::for_items(n);
            assert_eq!(w.len(), n + 2);
            assert!((map_percent(w.mux_phase(), 100.0, &w) - 100.0).abs() < 1e-3);
            assert_eq!(map_percent(0, 0.0, &w), 0.0);
        }
    }

    #[test]
    fn mapping_is_a_pure_function_of_phase_and_local() {
        let w = PhaseWeights::for_items(2);
        assert_eq!(map_percent(0, 50.0, &w), 17.5);
        assert_eq!(map_percent(1, 0.0, &w), 35.0);
        assert_eq!(map_percent(1, 100.0, &w), 70.0);
        assert_eq!(map_percent(w.concat_phase(), 100.0, &w), 80.0);
        assert_eq!(map_percent(w.mux_phase(), 50.0, &w), 90.0);
        // out of range inputs are clamped
        assert_eq!(map_percent(0, 250.0, &w), 35.0);
        assert_eq!(map_percent(99, 100.0, &w), 100.0);
    }

    #[test]
    fn percent_never_regresses_and_completes_once() {
        let (tx, mut rx) = unbounded_channel();
        let w = PhaseWeights::for_items(3);
        let reporter = ProgressReporter::new(Some(tx), w);

        reporter.phase(1, 50.0, "clip 2/3");
        reporter.phase(0, 100.0, "clip 1/3"); // finished late, lower percent
        reporter.phase(2, 10.0, "clip 3/3");
        let mux = reporter.weights().mux_phase();
        reporter.phase(mux, 100.0, "muxing"); // capped below 100
        reporter.complete();

        let mut seen = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            seen.push(ev);
        }
        assert!(seen.windows(2).all(|p| p[0].percent < p[1].percent), "{seen:?}");
        assert_eq!(seen.iter().filter(|e| e.percent == 100.0).count(), 1);
        assert_eq!(seen.last().map(|e| e.stage.as_str()), Some("done"));
    }

    #[test]
    fn closed_receiver_does_not_disturb_the_job() {
        let (tx, rx) = unbounded_channel();
        drop(rx);
        let reporter = ProgressReporter::new(Some(tx), PhaseWeights::for_items(1));
        reporter.phase(0, 40.0, "clip 1/1");
        assert!(reporter.last_percent() > 0.0);
        reporter.complete();
    }
}
