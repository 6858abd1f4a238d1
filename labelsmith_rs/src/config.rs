use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::barrier::BarrierMultiples;
use crate::cusum::CusumMode;
use crate::error::{LabelError, LabelResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SideMode {
    /// Primary labeling: every event is treated as long and the label is
    /// the sign of the return. Barrier multiples are forced symmetric.
    #[default]
    Unknown,
    /// Meta-labeling against an external side column; events without a
    /// side are dropped.
    Known,
    /// Meta-labeling where each event's side is the direction of the CUSUM
    /// move that fired it.
    CusumDirection,
}

impl SideMode {
    pub fn is_known(self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BarrierBoundary {
    /// Vertical barrier on the first bar at or after `start + horizon`.
    #[default]
    Inclusive,
    /// Vertical barrier on the first bar strictly after `start + horizon`.
    Exclusive,
}

fn default_span() -> usize {
    100
}

fn default_multiple() -> f64 {
    1.0
}

fn default_vertical_barrier_secs() -> Option<i64> {
    Some(20 * 86_400)
}

fn default_one() -> usize {
    1
}

fn default_reset() -> bool {
    true
}

fn default_vol_lookback_secs() -> i64 {
    86_400
}

/// User-facing labeling parameters. Deserialises with defaults for every
/// missing field and is written verbatim into the run manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabelConfig {
    /// EWM span of the volatility estimate.
    #[serde(default = "default_span")]
    pub span: usize,
    /// CUSUM threshold = volatility x this multiplier.
    #[serde(default = "default_multiple")]
    pub threshold_multiplier: f64,
    #[serde(default = "default_multiple")]
    pub profit_take: f64,
    #[serde(default = "default_multiple")]
    pub stop_loss: f64,
    /// Time limit per event, in seconds. `None` leaves events open-ended.
    #[serde(default = "default_vertical_barrier_secs")]
    pub vertical_barrier_secs: Option<i64>,
    #[serde(default)]
    pub barrier_boundary: BarrierBoundary,
    /// Events whose target is at or below this floor are dropped.
    #[serde(default)]
    pub min_ret: f64,
    #[serde(default = "default_one")]
    pub workers: usize,
    #[serde(default = "default_one")]
    pub batch_multiplier: usize,
    #[serde(default)]
    pub cusum_mode: CusumMode,
    #[serde(default = "default_reset")]
    pub reset_after_trigger: bool,
    #[serde(default)]
    pub side: SideMode,
    /// Calendar lookback of the returns fed to the volatility estimate.
    #[serde(default = "default_vol_lookback_secs")]
    pub vol_lookback_secs: i64,
    /// When set, label classes at or below this share are dropped.
    #[serde(default)]
    pub min_label_pct: Option<f64>,
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            span: default_span(),
            threshold_multiplier: default_multiple(),
            profit_take: default_multiple(),
            stop_loss: default_multiple(),
            vertical_barrier_secs: default_vertical_barrier_secs(),
            barrier_boundary: BarrierBoundary::default(),
            min_ret: 0.0,
            workers: default_one(),
            batch_multiplier: default_one(),
            cusum_mode: CusumMode::default(),
            reset_after_trigger: default_reset(),
            side: SideMode::default(),
            vol_lookback_secs: default_vol_lookback_secs(),
            min_label_pct: None,
        }
    }
}

impl LabelConfig {
    /// Check every parameter once, before any computation starts.
    pub fn validate(&self) -> LabelResult<ValidatedConfig> {
        if self.span == 0 {
            return Err(LabelError::config("span must be > 0"));
        }
        ensure_positive("threshold_multiplier", self.threshold_multiplier)?;
        ensure_non_negative("profit_take", self.profit_take)?;
        ensure_non_negative("stop_loss", self.stop_loss)?;
        ensure_non_negative("min_ret", self.min_ret)?;
        if self.workers == 0 {
            return Err(LabelError::config("workers must be >= 1"));
        }
        if self.batch_multiplier == 0 {
            return Err(LabelError::config("batch_multiplier must be >= 1"));
        }
        let vertical_barrier = match self.vertical_barrier_secs {
            Some(secs) if secs <= 0 => {
                return Err(LabelError::config(format!(
                    "vertical_barrier_secs must be > 0 (got {secs})"
                )))
            }
            Some(secs) => Some(Duration::seconds(secs)),
            None => None,
        };
        if self.vol_lookback_secs <= 0 {
            return Err(LabelError::config(format!(
                "vol_lookback_secs must be > 0 (got {})",
                self.vol_lookback_secs
            )));
        }
        if let Some(pct) = self.min_label_pct {
            if !(0.0..1.0).contains(&pct) {
                return Err(LabelError::config(format!(
                    "min_label_pct must be in [0, 1) (got {pct})"
                )));
            }
        }

        let multiples = if self.side.is_known() {
            BarrierMultiples {
                profit_take: self.profit_take,
                stop_loss: self.stop_loss,
            }
        } else {
            if self.stop_loss != self.profit_take {
                warn!(
                    profit_take = self.profit_take,
                    stop_loss = self.stop_loss,
                    "side unknown: forcing symmetric barriers (stop_loss := profit_take)"
                );
            }
            BarrierMultiples::symmetric(self.profit_take)
        };

        Ok(ValidatedConfig {
            raw: self.clone(),
            multiples,
            vertical_barrier,
            vol_lookback: Duration::seconds(self.vol_lookback_secs),
        })
    }
}

fn ensure_positive(name: &str, value: f64) -> LabelResult<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(LabelError::config(format!(
            "{name} must be finite and > 0 (got {value})"
        )));
    }
    Ok(())
}

fn ensure_non_negative(name: &str, value: f64) -> LabelResult<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(LabelError::config(format!(
            "{name} must be finite and >= 0 (got {value})"
        )));
    }
    Ok(())
}

/// Configuration that passed [`LabelConfig::validate`]. Built once per run
/// and shared by reference with every stage.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    raw: LabelConfig,
    multiples: BarrierMultiples,
    vertical_barrier: Option<Duration>,
    vol_lookback: Duration,
}

impl ValidatedConfig {
    pub fn raw(&self) -> &LabelConfig {
        &self.raw
    }

    pub fn span(&self) -> usize {
        self.raw.span
    }

    pub fn threshold_multiplier(&self) -> f64 {
        self.raw.threshold_multiplier
    }

    /// Effective multiples: symmetric whenever the side is unknown.
    pub fn multiples(&self) -> BarrierMultiples {
        self.multiples
    }

    pub fn vertical_barrier(&self) -> Option<Duration> {
        self.vertical_barrier
    }

    pub fn barrier_boundary(&self) -> BarrierBoundary {
        self.raw.barrier_boundary
    }

    pub fn min_ret(&self) -> f64 {
        self.raw.min_ret
    }

    pub fn workers(&self) -> usize {
        self.raw.workers
    }

    pub fn batch_multiplier(&self) -> usize {
        self.raw.batch_multiplier
    }

    pub fn cusum_mode(&self) -> CusumMode {
        self.raw.cusum_mode
    }

    pub fn reset_after_trigger(&self) -> bool {
        self.raw.reset_after_trigger
    }

    pub fn side_mode(&self) -> SideMode {
        self.raw.side
    }

    pub fn vol_lookback(&self) -> Duration {
        self.vol_lookback
    }

    pub fn min_label_pct(&self) -> Option<f64> {
        self.raw.min_label_pct
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: LabelConfig = serde_json::from_str(r#"{"span": 20, "side": "known"}"#).unwrap();
        assert_eq!(config.span, 20);
        assert_eq!(config.side, SideMode::Known);
        assert_eq!(config.vertical_barrier_secs, Some(20 * 86_400));
        assert_eq!(config.vol_lookback_secs, 86_400);
        assert!(config.reset_after_trigger);
    }

    #[test]
    fn side_unknown_forces_symmetric_multiples() {
        let config = LabelConfig {
            profit_take: 2.0,
            stop_loss: 0.5,
            ..LabelConfig::default()
        };
        let validated = config.validate().unwrap();
        assert_eq!(validated.multiples(), BarrierMultiples::symmetric(2.0));

        let known = LabelConfig {
            side: SideMode::Known,
            ..config
        }
        .validate()
        .unwrap();
        assert_eq!(known.multiples().stop_loss, 0.5);
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let cases = [
            LabelConfig {
                span: 0,
                ..LabelConfig::default()
            },
            LabelConfig {
                threshold_multiplier: 0.0,
                ..LabelConfig::default()
            },
            LabelConfig {
                stop_loss: -1.0,
                side: SideMode::Known,
                ..LabelConfig::default()
            },
            LabelConfig {
                workers: 0,
                ..LabelConfig::default()
            },
            LabelConfig {
                vertical_barrier_secs: Some(0),
                ..LabelConfig::default()
            },
            LabelConfig {
                min_label_pct: Some(1.5),
                ..LabelConfig::default()
            },
            LabelConfig {
                min_ret: f64::NAN,
                ..LabelConfig::default()
            },
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(LabelError::Configuration(_))),
                "{config:?} should be rejected"
            );
        }
    }
}
