use crate::balancer::{prioritize, BalanceMetrics, BalanceResult, Balancer};
use crate::error::LobbyError;
use crate::types::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Upper bound on matches created by one balancing request
pub const MAX_CONCURRENT_MATCHES: usize = 5;

/// One seat in a finished match
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchSlot {
    pub player_id: String,
    pub player_name: String,
    pub role: Role,
    pub sr: u32,
}

/// A team as recorded in a match
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchTeam {
    pub name: String,
    /// Truncated average SR
    pub average_sr: u32,
    pub slots: Vec<MatchSlot>,
}

impl MatchTeam {
    fn from_team(team: &Team) -> Self {
        Self {
            name: team.name.to_string(),
            average_sr: team.average_sr() as u32,
            slots: team
                .slots()
                .map(|slot| MatchSlot {
                    player_id: slot.player.id.clone(),
                    player_name: slot.player.name.clone(),
                    role: slot.role,
                    sr: slot.sr,
                })
                .collect(),
        }
    }

    pub fn player_ids(&self) -> Vec<&str> {
        self.slots.iter().map(|slot| slot.player_id.as_str()).collect()
    }

    pub fn to_display_string(&self) -> String {
        let mut out = format!("{} (Avg SR: {})\n", self.name, self.average_sr);
        for role in Role::ALL {
            let seats: Vec<String> = self
                .slots
                .iter()
                .filter(|slot| slot.role == role)
                .map(|slot| format!("{} ({})", slot.player_name, slot.sr))
                .collect();
            out.push_str(role.short_label());
            out.push(' ');
            if seats.is_empty() {
                out.push_str("_empty_");
            } else {
                out.push_str(&seats.join(", "));
            }
            out.push('\n');
        }
        out
    }
}

/// A balanced match handed to the caller
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub id: String,
    pub map: GameMap,
    pub team1: MatchTeam,
    pub team2: MatchTeam,
    pub metrics: BalanceMetrics,
    pub quality: BalanceQuality,
    /// Players left waiting, highest priority first
    pub queue: Vec<String>,
}

impl Match {
    pub fn from_result(id: String, map: GameMap, result: &BalanceResult) -> Self {
        Self {
            id,
            map,
            team1: MatchTeam::from_team(&result.team1),
            team2: MatchTeam::from_team(&result.team2),
            metrics: result.metrics,
            quality: result.quality(),
            queue: result.queue.iter().map(|p| p.id.clone()).collect(),
        }
    }

    pub fn to_display_string(&self) -> String {
        let mut out = String::from("Match Ready!\n\n");
        out.push_str(&format!("Map: {}\n", self.map));
        out.push_str(&format!("Balance: {}\n", self.quality));
        out.push_str(&format!("SR Difference: {}\n", self.metrics.overall_sr_diff));
        out.push_str(&format!("Match ID: {}\n\n", self.id));
        out.push_str(&self.team1.to_display_string());
        out.push_str("\nVS\n\n");
        out.push_str(&self.team2.to_display_string());

        out.push_str("\nRole Balance:\n");
        for (role, diff) in [
            (Role::Tank, self.metrics.tank_sr_diff),
            (Role::Damage, self.metrics.damage_sr_diff),
            (Role::Support, self.metrics.support_sr_diff),
        ] {
            let threshold = role.max_acceptable_diff();
            let status = if diff <= threshold / 2 {
                "ok"
            } else if diff <= threshold {
                "warn"
            } else {
                "bad"
            };
            out.push_str(&format!("[{}] {}: {} SR\n", status, role, diff));
        }

        if !self.queue.is_empty() {
            out.push_str(&format!("\nQueue ({}): {}\n", self.queue.len(), self.queue.join(", ")));
        }
        out
    }
}

/// Who plays next and who waits, in priority order
#[derive(Clone, Debug, Serialize)]
pub struct QueueStatus {
    pub total_players: usize,
    pub playing_next: Vec<Player>,
    pub waiting: Vec<Player>,
    pub can_start: bool,
    pub role_availability: BTreeMap<Role, usize>,
    pub players_needed: usize,
}

/// In-memory lobby: player registry, membership and match history around the balancer
pub struct Lobby {
    /// All known players by id
    players: HashMap<String, Player>,
    /// Lobby members in join order
    members: Vec<String>,
    /// Balanced matches, oldest first
    matches: Vec<Match>,
    balancer: Balancer,
    rng: StdRng,
}

impl Lobby {
    pub fn new(config: BalancerConfig, seed: u64) -> Result<Self, LobbyError> {
        Ok(Self::build(Balancer::new(config)?, seed))
    }

    pub fn with_default_config(seed: u64) -> Self {
        Self::build(Balancer::default(), seed)
    }

    fn build(balancer: Balancer, seed: u64) -> Self {
        log::info!(
            "Initializing balancer with {} iterations",
            balancer.config().max_iterations
        );
        Self {
            players: HashMap::new(),
            members: Vec::new(),
            matches: Vec::new(),
            balancer,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn config(&self) -> &BalancerConfig {
        self.balancer.config()
    }

    /// Register a new player or replace the name and ratings of a known one
    pub fn register_or_update(
        &mut self,
        id: &str,
        name: &str,
        ratings: RoleRatings,
    ) -> Result<&Player, LobbyError> {
        ratings.validate()?;
        let player = self
            .players
            .entry(id.to_string())
            .or_insert_with(|| Player::new(id, name));
        player.name = name.to_string();
        player.set_ratings(ratings)?;
        log::info!("Registered/updated player {} with roles {:?}", name, ratings);

        self.evict_if_unrated(id);
        self.players
            .get(id)
            .ok_or_else(|| LobbyError::PlayerNotFound(id.to_string()))
    }

    /// Setting the last active rating to 0 also takes the player out of the lobby
    pub fn update_rating(&mut self, id: &str, role: Role, sr: u32) -> Result<(), LobbyError> {
        self.players
            .get_mut(id)
            .ok_or_else(|| LobbyError::PlayerNotFound(id.to_string()))?
            .set_rating(role, sr)?;
        self.evict_if_unrated(id);
        Ok(())
    }

    /// Members must stay balanceable: no active role means no seat in the lobby
    fn evict_if_unrated(&mut self, id: &str) {
        let unrated = self
            .players
            .get(id)
            .map_or(false, |p| !p.has_active_role());
        if unrated && self.leave(id) {
            log::info!("Player {} has no active roles left, removed from lobby", id);
        }
    }

    pub fn player(&self, id: &str) -> Option<&Player> {
        self.players.get(id)
    }

    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Forget a player, taking them out of the lobby too
    pub fn remove_player(&mut self, id: &str) -> Option<Player> {
        self.members.retain(|m| m != id);
        let removed = self.players.remove(id);
        if removed.is_some() {
            log::info!("Deleted player {}", id);
        }
        removed
    }

    /// Returns false if the player was already in the lobby
    pub fn join(&mut self, id: &str) -> Result<bool, LobbyError> {
        let player = self
            .players
            .get(id)
            .ok_or_else(|| LobbyError::PlayerNotFound(id.to_string()))?;
        if !player.has_active_role() {
            return Err(LobbyError::NoActiveRole(id.to_string()));
        }
        if self.is_member(id) {
            return Ok(false);
        }
        self.members.push(id.to_string());
        log::debug!("Player {} joined the lobby", player.name);
        Ok(true)
    }

    pub fn leave(&mut self, id: &str) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m != id);
        let left = self.members.len() < before;
        if left {
            log::debug!("Player {} left the lobby", id);
        }
        left
    }

    pub fn is_member(&self, id: &str) -> bool {
        self.members.iter().any(|m| m == id)
    }

    pub fn members(&self) -> Vec<&Player> {
        self.members
            .iter()
            .filter_map(|id| self.players.get(id))
            .collect()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn clear(&mut self) {
        self.members.clear();
        log::info!("Cleared lobby");
    }

    pub fn can_start(&self) -> bool {
        self.member_count() >= PLAYERS_PER_MATCH
    }

    pub fn max_matches(&self) -> usize {
        self.member_count() / PLAYERS_PER_MATCH
    }

    /// Members grouped by primary role, strongest first within each role
    pub fn players_by_role(&self) -> BTreeMap<Role, Vec<&Player>> {
        let mut grouped: BTreeMap<Role, Vec<&Player>> = BTreeMap::new();
        for player in self.members() {
            if let Some(role) = player.primary_role() {
                grouped.entry(role).or_default().push(player);
            }
        }
        for (role, players) in grouped.iter_mut() {
            players.sort_by(|a, b| b.rating(*role).cmp(&a.rating(*role)));
        }
        grouped
    }

    /// Text roster by primary role; `^` marks players who sat out last round
    pub fn format_player_list(&self) -> String {
        let grouped = self.players_by_role();
        if grouped.is_empty() {
            return "No players in lobby".to_string();
        }

        let mut out = String::new();
        for (role, players) in &grouped {
            out.push_str(&format!("{} ({}):\n", role.name(), players.len()));
            for player in players {
                out.push_str(&format!("  {} - {}", player.name, player.rating(*role)));
                if player.games_skipped > 0 {
                    out.push_str(" ^");
                }
                out.push('\n');
            }
        }
        out
    }

    /// Draws from the session generator, so results follow the lobby seed
    pub fn random_map(&mut self, mode: Option<GameMode>) -> GameMap {
        match mode {
            Some(mode) => GameMap::random_by_mode(mode, &mut self.rng),
            None => GameMap::random(&mut self.rng),
        }
    }

    pub fn queue_status(&self) -> QueueStatus {
        let members = self.members();
        let sorted = prioritize(&members);
        let playing = sorted.len().min(PLAYERS_PER_MATCH);

        let role_availability = Role::ALL
            .iter()
            .map(|&role| (role, members.iter().filter(|p| p.can_play(role)).count()))
            .collect();

        QueueStatus {
            total_players: sorted.len(),
            playing_next: sorted[..playing].iter().map(|&p| p.clone()).collect(),
            waiting: sorted[playing..].iter().map(|&p| p.clone()).collect(),
            can_start: self.can_start(),
            role_availability,
            players_needed: PLAYERS_PER_MATCH.saturating_sub(sorted.len()),
        }
    }

    /// Balance up to `count` matches from the lobby.
    ///
    /// Placed players are recorded as having played; whoever is left over after
    /// the last match gets a skipped game. Members stay in the lobby either way.
    pub fn balance_matches(
        &mut self,
        count: usize,
        mode: Option<GameMode>,
    ) -> Result<Vec<Match>, LobbyError> {
        if count < 1 {
            return Err(LobbyError::InvalidMatchCount(count));
        }

        let mut remaining: Vec<Player> = self.members().into_iter().cloned().collect();
        if remaining.len() < PLAYERS_PER_MATCH {
            return Err(LobbyError::NotEnoughPlayers {
                needed: PLAYERS_PER_MATCH - remaining.len(),
            });
        }

        let count = count
            .min(MAX_CONCURRENT_MATCHES)
            .min(remaining.len() / PLAYERS_PER_MATCH);
        let mut created = Vec::with_capacity(count);

        for index in 0..count {
            if remaining.len() < PLAYERS_PER_MATCH {
                break;
            }

            let result = match self.balancer.balance(&remaining, &mut self.rng) {
                Ok(result) => result,
                Err(err) if created.is_empty() => return Err(err.into()),
                Err(err) => {
                    log::warn!("Failed to balance match {} of {}: {}", index + 1, count, err);
                    break;
                }
            };

            let map = self.random_map(mode);
            let id = format!("{:08X}", self.rng.gen::<u32>());
            let record = Match::from_result(id, map, &result);
            let playing: HashSet<String> = result.playing().map(|p| p.id.clone()).collect();

            remaining.retain(|p| !playing.contains(&p.id));
            for id in &playing {
                if let Some(player) = self.players.get_mut(id) {
                    player.record_game_played();
                }
            }

            log::info!(
                "Created match {}/{}: {} vs {} on {}",
                index + 1,
                count,
                record.team1.name,
                record.team2.name,
                record.map.display_name()
            );
            created.push(record);
        }

        for waiting in &remaining {
            if let Some(player) = self.players.get_mut(&waiting.id) {
                player.record_game_skipped();
            }
        }

        self.matches.extend(created.iter().cloned());
        Ok(created)
    }

    pub fn matches(&self) -> &[Match] {
        &self.matches
    }

    pub fn match_by_id(&self, id: &str) -> Option<&Match> {
        self.matches.iter().find(|m| m.id == id)
    }

    /// Newest first
    pub fn recent_matches(&self, limit: usize) -> Vec<&Match> {
        self.matches.iter().rev().take(limit).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BalanceError;

    fn create_test_lobby() -> Lobby {
        Lobby::new(BalancerConfig { max_iterations: 500 }, 42).unwrap()
    }

    /// Registers and joins `tanks`/`damage`/`support` single-role players
    fn fill_lobby(lobby: &mut Lobby, tanks: usize, damage: usize, support: usize) {
        let mut n = 0;
        for (role, count) in [(Role::Tank, tanks), (Role::Damage, damage), (Role::Support, support)] {
            for i in 0..count {
                n += 1;
                let id = format!("p{}", n);
                let sr = 3000 + (i as u32) * 75;
                let ratings = match role {
                    Role::Tank => RoleRatings::new(sr, 0, 0),
                    Role::Damage => RoleRatings::new(0, sr, 0),
                    Role::Support => RoleRatings::new(0, 0, sr),
                };
                lobby.register_or_update(&id, &id, ratings).unwrap();
                lobby.join(&id).unwrap();
            }
        }
    }

    #[test]
    fn test_register_and_update() {
        let mut lobby = create_test_lobby();
        lobby
            .register_or_update("1", "Ana", RoleRatings::new(0, 0, 3200))
            .unwrap();
        lobby
            .register_or_update("1", "Ana2", RoleRatings::new(0, 2800, 3300))
            .unwrap();

        assert_eq!(lobby.player_count(), 1);
        let player = lobby.player("1").unwrap();
        assert_eq!(player.name, "Ana2");
        assert_eq!(player.rating(Role::Support), 3300);

        let err = lobby.register_or_update("2", "Bad", RoleRatings::new(9000, 0, 0));
        assert!(matches!(err, Err(LobbyError::RatingOutOfRange { .. })));
        assert!(lobby.player("2").is_none());

        assert!(lobby.update_rating("1", Role::Tank, 2500).is_ok());
        assert_eq!(
            lobby.update_rating("404", Role::Tank, 2500),
            Err(LobbyError::PlayerNotFound("404".to_string()))
        );
    }

    #[test]
    fn test_join_rules() {
        let mut lobby = create_test_lobby();
        lobby
            .register_or_update("1", "Rein", RoleRatings::new(3000, 0, 0))
            .unwrap();
        lobby
            .register_or_update("2", "Nobody", RoleRatings::default())
            .unwrap();

        assert_eq!(lobby.join("1"), Ok(true));
        assert_eq!(lobby.join("1"), Ok(false));
        assert_eq!(lobby.join("2"), Err(LobbyError::NoActiveRole("2".to_string())));
        assert_eq!(lobby.join("3"), Err(LobbyError::PlayerNotFound("3".to_string())));
        assert_eq!(lobby.member_count(), 1);

        assert!(lobby.leave("1"));
        assert!(!lobby.leave("1"));
    }

    #[test]
    fn test_remove_player_leaves_lobby() {
        let mut lobby = create_test_lobby();
        fill_lobby(&mut lobby, 1, 0, 0);
        assert!(lobby.remove_player("p1").is_some());
        assert_eq!(lobby.member_count(), 0);
        assert!(lobby.remove_player("p1").is_none());
    }

    #[test]
    fn test_queue_status() {
        let mut lobby = create_test_lobby();
        fill_lobby(&mut lobby, 3, 5, 5);
        let status = lobby.queue_status();

        assert_eq!(status.total_players, 13);
        assert_eq!(status.playing_next.len(), 10);
        assert_eq!(status.waiting.len(), 3);
        assert!(status.can_start);
        assert_eq!(status.players_needed, 0);
        assert_eq!(status.role_availability[&Role::Tank], 3);
        assert_eq!(status.role_availability[&Role::Support], 5);

        let keys: Vec<u64> = status
            .playing_next
            .iter()
            .chain(&status.waiting)
            .map(|p| p.priority_score())
            .collect();
        assert!(keys.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_queue_status_counts_missing_players() {
        let mut lobby = create_test_lobby();
        fill_lobby(&mut lobby, 2, 2, 2);
        let status = lobby.queue_status();
        assert!(!status.can_start);
        assert_eq!(status.players_needed, 4);
        assert!(status.waiting.is_empty());
    }

    #[test]
    fn test_balance_records_played_and_skipped() {
        let mut lobby = create_test_lobby();
        fill_lobby(&mut lobby, 3, 6, 6);

        let matches = lobby.balance_matches(1, None).unwrap();
        assert_eq!(matches.len(), 1);
        let m = &matches[0];
        assert_eq!(m.id.len(), 8);
        assert_eq!(m.queue.len(), 5);

        let playing: Vec<&str> = m.team1.player_ids().into_iter().chain(m.team2.player_ids()).collect();
        assert_eq!(playing.len(), 10);
        for id in &playing {
            let p = lobby.player(id).unwrap();
            assert_eq!((p.games_played, p.games_skipped), (1, 0));
        }
        for id in &m.queue {
            let p = lobby.player(id).unwrap();
            assert_eq!((p.games_played, p.games_skipped), (0, 1));
        }
        // Everyone stays in the lobby for the next round
        assert_eq!(lobby.member_count(), 15);
    }

    #[test]
    fn test_skipped_players_play_next_round() {
        let mut lobby = create_test_lobby();
        fill_lobby(&mut lobby, 3, 6, 6);

        let first = lobby.balance_matches(1, None).unwrap().remove(0);
        let second = lobby.balance_matches(1, None).unwrap().remove(0);

        let second_playing: Vec<&str> = second
            .team1
            .player_ids()
            .into_iter()
            .chain(second.team2.player_ids())
            .collect();
        for id in &first.queue {
            assert!(second_playing.contains(&id.as_str()), "{} skipped twice", id);
        }
    }

    #[test]
    fn test_balance_multiple_matches() {
        let mut lobby = create_test_lobby();
        fill_lobby(&mut lobby, 4, 8, 8);

        let matches = lobby.balance_matches(3, Some(GameMode::Escort)).unwrap();
        assert_eq!(matches.len(), 2, "capped by 20 players");
        for m in &matches {
            assert_eq!(m.map.mode(), GameMode::Escort);
        }
        let mut all: Vec<&str> = matches
            .iter()
            .flat_map(|m| m.team1.player_ids().into_iter().chain(m.team2.player_ids()))
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 20);
        assert!(lobby.players().all(|p| p.games_played == 1 && p.games_skipped == 0));

        assert_eq!(lobby.matches().len(), 2);
        assert_eq!(lobby.recent_matches(1)[0].id, matches[1].id);
        assert!(lobby.match_by_id(&matches[0].id).is_some());
    }

    #[test]
    fn test_balance_errors() {
        let mut lobby = create_test_lobby();
        assert_eq!(
            lobby.balance_matches(0, None),
            Err(LobbyError::InvalidMatchCount(0))
        );

        fill_lobby(&mut lobby, 2, 4, 3);
        assert_eq!(
            lobby.balance_matches(1, None),
            Err(LobbyError::NotEnoughPlayers { needed: 1 })
        );

        lobby
            .register_or_update("extra", "Extra", RoleRatings::new(0, 3000, 0))
            .unwrap();
        lobby.join("extra").unwrap();
        assert_eq!(
            lobby.balance_matches(1, None),
            Err(LobbyError::Balance(BalanceError::RoleShortage {
                role: Role::Support,
                available: 3,
                required: 4
            }))
        );
        // Nothing recorded on failure
        assert!(lobby.players().all(|p| p.games_skipped == 0));
    }

    #[test]
    fn test_match_display() {
        let mut lobby = create_test_lobby();
        fill_lobby(&mut lobby, 2, 4, 4);
        let m = lobby.balance_matches(1, None).unwrap().remove(0);
        let text = m.to_display_string();
        assert!(text.contains(&m.id));
        assert!(text.contains("Red Team"));
        assert!(text.contains("Blue Team"));
        assert!(text.contains("Role Balance"));
    }

    #[test]
    fn test_member_losing_last_rating_leaves_lobby() {
        let mut lobby = create_test_lobby();
        fill_lobby(&mut lobby, 2, 4, 3);
        lobby
            .register_or_update("ghost", "Ghost", RoleRatings::new(0, 0, 3000))
            .unwrap();
        lobby.join("ghost").unwrap();
        assert!(lobby.can_start());

        lobby.update_rating("ghost", Role::Support, 0).unwrap();
        assert!(!lobby.is_member("ghost"));
        assert!(lobby.player("ghost").is_some());

        let status = lobby.queue_status();
        assert!(!status.can_start);
        assert_eq!(status.players_needed, 1);
        assert_eq!(
            lobby.balance_matches(1, None),
            Err(LobbyError::NotEnoughPlayers { needed: 1 })
        );
    }

    #[test]
    fn test_unrated_reregistration_is_never_skipped() {
        let mut lobby = create_test_lobby();
        fill_lobby(&mut lobby, 2, 4, 4);
        lobby
            .register_or_update("ghost", "Ghost", RoleRatings::new(2500, 0, 0))
            .unwrap();
        lobby.join("ghost").unwrap();
        lobby
            .register_or_update("ghost", "Ghost", RoleRatings::default())
            .unwrap();

        for _ in 0..3 {
            assert_eq!(lobby.balance_matches(1, None).unwrap().len(), 1);
        }
        assert_eq!(lobby.player("ghost").unwrap().games_skipped, 0);
        assert_eq!(lobby.member_count(), 10);
    }

    #[test]
    fn test_player_list_grouped_by_primary_role() {
        let mut lobby = create_test_lobby();
        assert_eq!(lobby.format_player_list(), "No players in lobby");

        lobby
            .register_or_update("a", "Ana", RoleRatings::new(0, 2000, 3100))
            .unwrap();
        lobby
            .register_or_update("b", "Baptiste", RoleRatings::new(0, 0, 3400))
            .unwrap();
        lobby
            .register_or_update("r", "Rein", RoleRatings::new(2800, 0, 0))
            .unwrap();
        for id in ["a", "b", "r"] {
            lobby.join(id).unwrap();
        }

        let grouped = lobby.players_by_role();
        assert!(!grouped.contains_key(&Role::Damage));
        let supports: Vec<&str> = grouped[&Role::Support].iter().map(|p| p.id.as_str()).collect();
        assert_eq!(supports, vec!["b", "a"]);

        assert_eq!(
            lobby.format_player_list(),
            "tank (1):\n  Rein - 2800\nsupport (2):\n  Baptiste - 3400\n  Ana - 3100\n"
        );
    }

    #[test]
    fn test_player_list_marks_skipped_players() {
        let mut lobby = create_test_lobby();
        fill_lobby(&mut lobby, 3, 4, 4);
        lobby.balance_matches(1, None).unwrap();
        let list = lobby.format_player_list();
        assert_eq!(list.matches(" ^").count(), 1);
        assert!(list.starts_with("tank (3):"));
    }

    #[test]
    fn test_random_map_respects_mode() {
        let mut lobby = create_test_lobby();
        for _ in 0..10 {
            assert_eq!(lobby.random_map(Some(GameMode::Control)).mode(), GameMode::Control);
        }
    }

    #[test]
    fn test_zero_iterations_rejected() {
        assert!(matches!(
            Lobby::new(BalancerConfig { max_iterations: 0 }, 1),
            Err(LobbyError::Config(_))
        ));
    }
}
