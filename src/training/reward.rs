//! Reward Functions
//!
//! A reward function scores one step: the observation the trainer saw, the
//! action it chose and the observation that followed. It may also end the
//! episode early, e.g. when simulated capital is exhausted.

use std::collections::BTreeMap;

use crate::dataset::Window;
use crate::error::{Result, SpiceError};
use crate::pod::{ActionSpec, Pod};

/// Column the built-in rewards price positions with
pub const PRICE_FIELD: &str = "close";

/// Names accepted in a pod's `reward` key
pub const BUILTIN_REWARDS: [&str; 2] = ["position_pnl", "capital"];

/// Inputs for scoring one step
#[derive(Debug, Clone, Copy)]
pub struct RewardContext<'a> {
    pub step: u64,
    pub action: &'a ActionSpec,
    pub observation: &'a Window,
    /// `None` when the dataset ran out after this step
    pub next_observation: Option<&'a Window>,
}

/// Score for one step
#[derive(Debug, Clone, PartialEq)]
pub struct RewardOutcome {
    pub reward: f64,
    /// Set when the episode must end after this step
    pub terminate: Option<String>,
}

impl RewardOutcome {
    pub fn reward(reward: f64) -> Self {
        Self {
            reward,
            terminate: None,
        }
    }
}

/// Stateful step scorer, reset at the start of each episode
pub trait RewardFunction: Send {
    fn name(&self) -> &str;

    /// Clear per-episode state
    fn reset(&mut self);

    fn compute(&mut self, ctx: &RewardContext<'_>) -> Result<RewardOutcome>;
}

/// Build the reward function a pod names
pub fn build(pod: &Pod) -> Result<Box<dyn RewardFunction>> {
    let price = price_column(pod)?;
    let params = RewardParams(&pod.reward_params);

    match pod.reward.as_str() {
        "position_pnl" => Ok(Box::new(PositionPnlReward {
            price,
            scale: params.get("scale", 1.0),
            cost: params.get("transaction_cost", 0.0),
            last_position: 0.0,
        })),
        "capital" => {
            let starting = params.get("starting_capital", 10_000.0);
            if !(starting.is_finite() && starting > 0.0) {
                return Err(SpiceError::InvalidPod(format!(
                    "{}: starting_capital must be positive",
                    pod.name
                )));
            }
            Ok(Box::new(CapitalReward {
                price,
                starting,
                floor: params.get("min_capital", 0.0),
                cost: params.get("transaction_cost", 0.0),
                capital: starting,
                last_position: 0.0,
            }))
        }
        other => Err(SpiceError::InvalidPod(format!(
            "{}: unknown reward function '{}' (known: {})",
            pod.name,
            other,
            BUILTIN_REWARDS.join(", ")
        ))),
    }
}

fn price_column(pod: &Pod) -> Result<usize> {
    pod.dataset
        .fields
        .iter()
        .position(|f| f == PRICE_FIELD)
        .ok_or_else(|| {
            SpiceError::InvalidPod(format!(
                "{}: reward '{}' needs a '{}' field",
                pod.name, pod.reward, PRICE_FIELD
            ))
        })
}

struct RewardParams<'a>(&'a BTreeMap<String, f64>);

impl RewardParams<'_> {
    fn get(&self, key: &str, default: f64) -> f64 {
        self.0.get(key).copied().unwrap_or(default)
    }
}

/// Relative price move between two windows
fn price_return(ctx: &RewardContext<'_>, column: usize) -> Result<f64> {
    let Some(next) = ctx.next_observation else {
        return Ok(0.0);
    };
    let now = ctx.observation.latest(column);
    let then = next.latest(column);
    match (now, then) {
        (Some(now), Some(then)) if now > 0.0 && now.is_finite() && then.is_finite() => {
            Ok((then - now) / now)
        }
        _ => Err(SpiceError::RewardFunction(format!(
            "step {}: no usable price at cursor {}",
            ctx.step, ctx.observation.cursor
        ))),
    }
}

fn finite(step: u64, reward: f64) -> Result<f64> {
    if reward.is_finite() {
        Ok(reward)
    } else {
        Err(SpiceError::RewardFunction(format!(
            "step {}: reward is not finite ({})",
            step, reward
        )))
    }
}

/// Position times price return, less a cost per unit of position change
#[derive(Debug, Clone)]
pub struct PositionPnlReward {
    price: usize,
    scale: f64,
    cost: f64,
    last_position: f64,
}

impl RewardFunction for PositionPnlReward {
    fn name(&self) -> &str {
        "position_pnl"
    }

    fn reset(&mut self) {
        self.last_position = 0.0;
    }

    fn compute(&mut self, ctx: &RewardContext<'_>) -> Result<RewardOutcome> {
        let position = ctx.action.position;
        let turnover = (position - self.last_position).abs();
        self.last_position = position;

        let pnl = position * price_return(ctx, self.price)? * self.scale;
        let reward = finite(ctx.step, pnl - turnover * self.cost)?;
        Ok(RewardOutcome::reward(reward))
    }
}

/// Change in simulated capital; the episode ends when capital hits the floor
#[derive(Debug, Clone)]
pub struct CapitalReward {
    price: usize,
    starting: f64,
    floor: f64,
    cost: f64,
    capital: f64,
    last_position: f64,
}

impl RewardFunction for CapitalReward {
    fn name(&self) -> &str {
        "capital"
    }

    fn reset(&mut self) {
        self.capital = self.starting;
        self.last_position = 0.0;
    }

    fn compute(&mut self, ctx: &RewardContext<'_>) -> Result<RewardOutcome> {
        let position = ctx.action.position;
        let turnover = (position - self.last_position).abs();
        self.last_position = position;

        let before = self.capital;
        let growth = position * price_return(ctx, self.price)?;
        let after = before * (1.0 + growth) - before * turnover * self.cost;
        self.capital = after;

        let reward = finite(ctx.step, after - before)?;
        let terminate = (after <= self.floor).then(|| "bankrupt".to_string());
        Ok(RewardOutcome { reward, terminate })
    }
}
