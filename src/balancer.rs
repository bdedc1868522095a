use crate::error::{BalanceError, ConfigError};
use crate::types::*;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use thiserror::Error;

/// A split beating both of these ends the search early
const EXCELLENT_SCORE: f64 = 150.0;
const EXCELLENT_TANK_DIFF: u32 = 200;

/// Tank gaps above this are penalized on top of the 2x tank weight
const TANK_PENALTY_THRESHOLD: u32 = 500;
const TANK_PENALTY_FACTOR: f64 = 3.0;

/// SR credited per skipped game when pairing tanks
const TANK_PRIORITY_DISCOUNT: i64 = 50;

/// Chance that a role shortlist is processed in random order
const SHUFFLE_PROBABILITY: f64 = 0.3;

/// Team pull used to pick a side for the next player of a role
const ROLE_SR_WEIGHT: f64 = 0.4;
const TOTAL_SR_WEIGHT: f64 = 0.6;

/// Why a single trial could not produce two full teams
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialFailure {
    #[error("only {available} tank-eligible candidates")]
    NotEnoughTanks { available: usize },

    #[error("only {available} unassigned {role} candidates, need {required}")]
    NotEnoughEligible {
        role: Role,
        available: usize,
        required: usize,
    },

    #[error("{0} slots left open")]
    RoleUnfilled(Role),

    #[error("teams incomplete after assignment")]
    Incomplete,
}

/// Balance breakdown for a pair of full teams
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BalanceMetrics {
    pub overall_sr_diff: u32,
    pub tank_sr_diff: u32,
    pub damage_sr_diff: u32,
    pub support_sr_diff: u32,
    pub max_role_diff: u32,
    /// Lower is better
    pub balance_score: f64,
}

impl BalanceMetrics {
    pub fn calculate(team1: &Team, team2: &Team) -> Self {
        let overall_sr_diff = truncated_diff(team1.average_sr(), team2.average_sr());
        let tank_sr_diff = team1.tank_sr().abs_diff(team2.tank_sr());
        let damage_sr_diff = truncated_diff(
            team1.role_average_sr(Role::Damage),
            team2.role_average_sr(Role::Damage),
        );
        let support_sr_diff = truncated_diff(
            team1.role_average_sr(Role::Support),
            team2.role_average_sr(Role::Support),
        );
        let max_role_diff = tank_sr_diff.max(damage_sr_diff).max(support_sr_diff);

        // One tank per side, so its gap counts double
        let mut balance_score = overall_sr_diff as f64 * 1.5
            + tank_sr_diff as f64 * 2.0
            + damage_sr_diff as f64
            + support_sr_diff as f64;

        if tank_sr_diff > TANK_PENALTY_THRESHOLD {
            balance_score += (tank_sr_diff - TANK_PENALTY_THRESHOLD) as f64 * TANK_PENALTY_FACTOR;
        }

        Self {
            overall_sr_diff,
            tank_sr_diff,
            damage_sr_diff,
            support_sr_diff,
            max_role_diff,
            balance_score,
        }
    }

    pub fn quality(&self) -> BalanceQuality {
        BalanceQuality::from_score(self.balance_score)
    }

    /// Good enough to stop searching
    pub fn is_excellent(&self) -> bool {
        self.balance_score < EXCELLENT_SCORE && self.tank_sr_diff < EXCELLENT_TANK_DIFF
    }
}

/// Difference of two averages, each truncated to whole SR first
fn truncated_diff(a: f64, b: f64) -> u32 {
    (a as i64 - b as i64).unsigned_abs() as u32
}

/// Outcome of one successful trial
#[derive(Clone, Debug, Serialize)]
pub struct Split<'a> {
    pub team1: Team<'a>,
    pub team2: Team<'a>,
    pub metrics: BalanceMetrics,
    /// Iteration index that produced this split
    pub iteration: usize,
}

impl<'a> Split<'a> {
    pub fn is_valid(&self) -> bool {
        self.team1.is_full() && self.team2.is_full()
    }

    pub fn contains(&self, player: &Player) -> bool {
        self.team1.contains(player) || self.team2.contains(player)
    }
}

/// Lower score first, earlier iteration on ties
fn compare_splits(a: &Split, b: &Split) -> Ordering {
    a.metrics
        .balance_score
        .total_cmp(&b.metrics.balance_score)
        .then(a.iteration.cmp(&b.iteration))
}

/// Best split of a run of iterations
struct SearchOutcome<'a> {
    best: Option<Split<'a>>,
    iterations: usize,
}

/// Winning split plus the priority-ordered waiting list
#[derive(Clone, Debug, Serialize)]
pub struct BalanceResult<'a> {
    pub team1: Team<'a>,
    pub team2: Team<'a>,
    pub queue: Vec<&'a Player>,
    pub metrics: BalanceMetrics,
    /// Trials actually run before the search stopped
    pub iterations: usize,
}

impl<'a> BalanceResult<'a> {
    pub fn score(&self) -> f64 {
        self.metrics.balance_score
    }

    pub fn quality(&self) -> BalanceQuality {
        self.metrics.quality()
    }

    pub fn is_valid(&self) -> bool {
        self.team1.is_full() && self.team2.is_full()
    }

    /// Everyone placed on either team
    pub fn playing(&self) -> impl Iterator<Item = &'a Player> + '_ {
        self.team1.players().chain(self.team2.players())
    }
}

/// Order by skipped games, then highest SR, both descending. Stable for equal keys.
pub fn prioritize<'a>(players: &[&'a Player]) -> Vec<&'a Player> {
    let mut sorted = players.to_vec();
    sorted.sort_by(|a, b| {
        b.games_skipped
            .cmp(&a.games_skipped)
            .then_with(|| b.highest_sr().cmp(&a.highest_sr()))
    });
    sorted
}

/// Pick up to ten players likely to cover every role quota.
///
/// Walks the prioritized order three times: players whose primary role is still
/// needed, then anyone eligible for a role still short, then anyone at all.
/// Coverage is not guaranteed; trials re-check it.
pub fn select_candidates<'a>(prioritized: &[&'a Player]) -> Vec<&'a Player> {
    let mut selected: Vec<&'a Player> = Vec::with_capacity(PLAYERS_PER_MATCH);
    let mut needed = Role::ALL.map(|role| role.slots_per_match());

    let is_selected =
        |selected: &[&Player], player: &Player| selected.iter().any(|p| p.id == player.id);

    for &player in prioritized {
        if selected.len() >= PLAYERS_PER_MATCH {
            break;
        }
        if let Some(primary) = player.primary_role() {
            if needed[primary.index()] > 0 {
                selected.push(player);
                needed[primary.index()] -= 1;
            }
        }
    }

    for &player in prioritized {
        if selected.len() >= PLAYERS_PER_MATCH {
            break;
        }
        if is_selected(&selected, player) {
            continue;
        }
        let short_role = Role::ALL
            .iter()
            .copied()
            .find(|role| needed[role.index()] > 0 && player.can_play(*role));
        if let Some(role) = short_role {
            selected.push(player);
            needed[role.index()] -= 1;
        }
    }

    for &player in prioritized {
        if selected.len() >= PLAYERS_PER_MATCH {
            break;
        }
        if !is_selected(&selected, player) {
            selected.push(player);
        }
    }

    selected
}

/// Check the pool holds enough eligible players for every role of one match
pub fn validate_roles(pool: &[&Player]) -> Result<(), BalanceError> {
    for role in Role::ALL {
        let available = pool.iter().filter(|p| p.can_play(role)).count();
        let required = role.slots_per_match();
        if available < required {
            return Err(BalanceError::RoleShortage {
                role,
                available,
                required,
            });
        }
    }
    Ok(())
}

/// Queue for everyone eligible who did not make either team
pub fn build_queue<'a>(eligible: &[&'a Player], split: &Split<'a>) -> Vec<&'a Player> {
    let waiting: Vec<&'a Player> = eligible
        .iter()
        .copied()
        .filter(|p| !split.contains(p))
        .collect();
    prioritize(&waiting)
}

/// Tank pair with the smallest SR gap, discounted for skipped games
fn closest_tank_pair<'a>(tanks: &[&'a Player]) -> Option<(&'a Player, &'a Player)> {
    let mut best = None;
    let mut best_diff = i64::MAX;

    for (i, &a) in tanks.iter().enumerate() {
        for &b in &tanks[i + 1..] {
            let diff = (a.rating(Role::Tank) as i64 - b.rating(Role::Tank) as i64).abs();
            let discount = (a.games_skipped + b.games_skipped) as i64 * TANK_PRIORITY_DISCOUNT;
            let adjusted = diff - discount;
            if adjusted < best_diff {
                best_diff = adjusted;
                best = Some((a, b));
            }
        }
    }

    best
}

/// Side pull for a role: blends the role average with the whole team's SR
fn team_pull(team: &Team, role: Role) -> f64 {
    team.role_average_sr(role) * ROLE_SR_WEIGHT + team.total_sr() as f64 * TOTAL_SR_WEIGHT
}

/// The team balancing engine
pub struct Balancer {
    config: BalancerConfig,
}

impl Default for Balancer {
    fn default() -> Self {
        Self {
            config: BalancerConfig::default(),
        }
    }
}

impl Balancer {
    /// Rejects a zero iteration budget
    pub fn new(config: BalancerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    /// Split the pool into two full teams plus a waiting queue
    pub fn balance<'a>(
        &self,
        pool: &'a [Player],
        rng: &mut impl Rng,
    ) -> Result<BalanceResult<'a>, BalanceError> {
        let (eligible, candidates) = self.prepare(pool)?;
        let stop = AtomicBool::new(false);
        let outcome = self.search(&candidates, 0..self.config.max_iterations, rng, &stop);
        self.finish(&eligible, outcome)
    }

    /// Same as `balance`, with the iteration budget spread over the rayon pool.
    ///
    /// Each worker owns a generator derived from `seed` and its chunk index; the
    /// first excellent split stops every worker before its next trial.
    #[cfg(feature = "parallel")]
    pub fn balance_parallel<'a>(
        &self,
        pool: &'a [Player],
        seed: u64,
    ) -> Result<BalanceResult<'a>, BalanceError> {
        use rand::rngs::StdRng;
        use rand::SeedableRng;
        use rayon::prelude::*;

        let (eligible, candidates) = self.prepare(pool)?;
        let max_iterations = self.config.max_iterations;
        let workers = rayon::current_num_threads().clamp(1, max_iterations.max(1));
        let chunk = max_iterations.div_ceil(workers);
        let stop = AtomicBool::new(false);

        let outcomes: Vec<SearchOutcome<'a>> = (0..workers)
            .into_par_iter()
            .map(|worker| {
                let start = (worker * chunk).min(max_iterations);
                let end = (start + chunk).min(max_iterations);
                let mut rng =
                    StdRng::seed_from_u64(seed ^ (worker as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
                self.search(&candidates, start..end, &mut rng, &stop)
            })
            .collect();

        let iterations = outcomes.iter().map(|o| o.iterations).sum();
        let best = outcomes
            .into_iter()
            .filter_map(|o| o.best)
            .min_by(compare_splits);

        self.finish(&eligible, SearchOutcome { best, iterations })
    }

    /// Drop unrated players, check feasibility and pick the ten candidates
    fn prepare<'a>(
        &self,
        pool: &'a [Player],
    ) -> Result<(Vec<&'a Player>, Vec<&'a Player>), BalanceError> {
        let eligible: Vec<&'a Player> = pool.iter().filter(|p| p.has_active_role()).collect();

        if eligible.len() < PLAYERS_PER_MATCH {
            log::warn!(
                "Not enough players: {} < {}",
                eligible.len(),
                PLAYERS_PER_MATCH
            );
            return Err(BalanceError::InsufficientPlayers {
                available: eligible.len(),
                required: PLAYERS_PER_MATCH,
            });
        }

        if let Err(shortage) = validate_roles(&eligible) {
            log::warn!("Role validation failed: {}", shortage);
            return Err(shortage);
        }

        let prioritized = prioritize(&eligible);
        let candidates = select_candidates(&prioritized);
        Ok((eligible, candidates))
    }

    /// Run trials over `iterations`, keeping the lowest score
    fn search<'a>(
        &self,
        candidates: &[&'a Player],
        iterations: Range<usize>,
        rng: &mut impl Rng,
        stop: &AtomicBool,
    ) -> SearchOutcome<'a> {
        let mut best: Option<Split<'a>> = None;
        let mut run = 0;

        for iteration in iterations {
            if stop.load(AtomicOrdering::Relaxed) {
                break;
            }
            run += 1;

            let split = match self.build_trial(candidates, rng, iteration) {
                Ok(split) => split,
                Err(failure) => {
                    log::trace!("Iteration {} discarded: {}", iteration, failure);
                    continue;
                }
            };

            let improved = best
                .as_ref()
                .map_or(true, |b| split.metrics.balance_score < b.metrics.balance_score);
            if improved {
                let excellent = split.metrics.is_excellent();
                best = Some(split);
                if excellent {
                    log::debug!("Found excellent balance at iteration {}", iteration);
                    stop.store(true, AtomicOrdering::Relaxed);
                    break;
                }
            }
        }

        SearchOutcome {
            best,
            iterations: run,
        }
    }

    fn finish<'a>(
        &self,
        eligible: &[&'a Player],
        outcome: SearchOutcome<'a>,
    ) -> Result<BalanceResult<'a>, BalanceError> {
        let Some(best) = outcome.best else {
            log::warn!(
                "Failed to find valid balance after {} iterations",
                outcome.iterations
            );
            return Err(BalanceError::SearchExhausted {
                iterations: outcome.iterations,
            });
        };

        let queue = build_queue(eligible, &best);

        log::info!(
            "Balance complete: SR diff={}, tank diff={}, quality={}",
            best.metrics.overall_sr_diff,
            best.metrics.tank_sr_diff,
            best.metrics.quality()
        );

        Ok(BalanceResult {
            team1: best.team1,
            team2: best.team2,
            queue,
            metrics: best.metrics,
            iterations: outcome.iterations,
        })
    }

    /// Build one candidate split: tanks, then damage, then support.
    ///
    /// Teams are local to the trial; any failed step discards the whole attempt.
    pub fn build_trial<'a>(
        &self,
        candidates: &[&'a Player],
        rng: &mut impl Rng,
        iteration: usize,
    ) -> Result<Split<'a>, TrialFailure> {
        let mut team1 = Team::red();
        let mut team2 = Team::blue();

        self.assign_tanks(candidates, &mut team1, &mut team2, rng, iteration)?;
        assign_role(Role::Damage, candidates, &mut team1, &mut team2, rng)?;
        assign_role(Role::Support, candidates, &mut team1, &mut team2, rng)?;

        if !team1.is_full() || !team2.is_full() {
            return Err(TrialFailure::Incomplete);
        }

        let metrics = BalanceMetrics::calculate(&team1, &team2);
        Ok(Split {
            team1,
            team2,
            metrics,
            iteration,
        })
    }

    /// Closest pair during the first half of the budget, a random pair after
    fn assign_tanks<'a>(
        &self,
        candidates: &[&'a Player],
        team1: &mut Team<'a>,
        team2: &mut Team<'a>,
        rng: &mut impl Rng,
        iteration: usize,
    ) -> Result<(), TrialFailure> {
        let mut tanks: Vec<&'a Player> = candidates
            .iter()
            .copied()
            .filter(|p| p.can_play(Role::Tank))
            .collect();
        tanks.sort_by(|a, b| b.rating(Role::Tank).cmp(&a.rating(Role::Tank)));

        if tanks.len() < 2 {
            return Err(TrialFailure::NotEnoughTanks {
                available: tanks.len(),
            });
        }

        let pair = if iteration < self.config.max_iterations / 2 {
            closest_tank_pair(&tanks)
        } else {
            tanks.shuffle(rng);
            Some((tanks[0], tanks[1]))
        };

        let Some((first, second)) = pair else {
            return Err(TrialFailure::NotEnoughTanks {
                available: tanks.len(),
            });
        };

        if !team1.add(first, Role::Tank) || !team2.add(second, Role::Tank) {
            return Err(TrialFailure::RoleUnfilled(Role::Tank));
        }
        Ok(())
    }
}

/// Fill both teams' slots for one role from the strongest unassigned candidates
fn assign_role<'a>(
    role: Role,
    candidates: &[&'a Player],
    team1: &mut Team<'a>,
    team2: &mut Team<'a>,
    rng: &mut impl Rng,
) -> Result<(), TrialFailure> {
    let mut shortlist: Vec<&'a Player> = candidates
        .iter()
        .copied()
        .filter(|p| p.can_play(role) && !team1.contains(p) && !team2.contains(p))
        .collect();

    let required = role.slots_per_match();
    if shortlist.len() < required {
        return Err(TrialFailure::NotEnoughEligible {
            role,
            available: shortlist.len(),
            required,
        });
    }

    shortlist.sort_by(|a, b| b.rating(role).cmp(&a.rating(role)));
    shortlist.truncate(required);

    if rng.gen_bool(SHUFFLE_PROBABILITY) {
        shortlist.shuffle(rng);
    }

    for player in shortlist {
        let to_team1 = if team1.free_slots(role) == 0 {
            false
        } else if team2.free_slots(role) == 0 {
            true
        } else {
            team_pull(team1, role) <= team_pull(team2, role)
        };

        let (target, other) = if to_team1 {
            (&mut *team1, &mut *team2)
        } else {
            (&mut *team2, &mut *team1)
        };

        if target.free_slots(role) > 0 {
            target.add(player, role);
        } else {
            other.add(player, role);
        }
    }

    if team1.free_slots(role) == 0 && team2.free_slots(role) == 0 {
        Ok(())
    } else {
        Err(TrialFailure::RoleUnfilled(role))
    }
}
