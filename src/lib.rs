pub mod balancer;
pub mod error;
pub mod lobby;
pub mod types;

pub use balancer::{BalanceMetrics, BalanceResult, Balancer, TrialFailure};
pub use error::{BalanceError, ConfigError, LobbyError};
pub use lobby::{Lobby, Match, MatchSlot, MatchTeam, QueueStatus, MAX_CONCURRENT_MATCHES};
pub use types::*;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use wasm_bindgen::prelude::*;

/// Initialize panic hook for better error messages
#[wasm_bindgen(start)]
pub fn init() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();
}

fn to_js(err: LobbyError) -> JsValue {
    JsValue::from_str(&err.to_string())
}

fn parse_config(config_json: &str) -> Result<BalancerConfig, LobbyError> {
    if config_json.trim().is_empty() {
        return Ok(BalancerConfig::default());
    }
    serde_json::from_str(config_json)
        .map_err(|e| LobbyError::Parse(format!("config: {}", e)))
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, LobbyError> {
    serde_json::to_string(value).map_err(|e| LobbyError::Parse(e.to_string()))
}

/// WASM-exposed lobby wrapper
#[wasm_bindgen]
pub struct BalancerEngine {
    lobby: Lobby,
}

#[wasm_bindgen]
impl BalancerEngine {
    /// Create a lobby with the default config
    #[wasm_bindgen(constructor)]
    pub fn new(seed: u64) -> BalancerEngine {
        BalancerEngine {
            lobby: Lobby::with_default_config(seed),
        }
    }

    /// Create with custom config
    pub fn new_with_config(seed: u64, config_json: &str) -> Result<BalancerEngine, JsValue> {
        let config = parse_config(config_json).map_err(to_js)?;
        let lobby = Lobby::new(config, seed).map_err(to_js)?;
        Ok(BalancerEngine { lobby })
    }

    pub fn register_player(
        &mut self,
        id: &str,
        name: &str,
        tank: u32,
        damage: u32,
        support: u32,
    ) -> Result<(), JsValue> {
        self.lobby
            .register_or_update(id, name, RoleRatings::new(tank, damage, support))
            .map(|_| ())
            .map_err(to_js)
    }

    /// `role` accepts tank, dps/damage or support/supp
    pub fn update_rating(&mut self, id: &str, role: &str, sr: u32) -> Result<(), JsValue> {
        let role: Role = role.parse().map_err(to_js)?;
        self.lobby.update_rating(id, role, sr).map_err(to_js)
    }

    pub fn remove_player(&mut self, id: &str) -> bool {
        self.lobby.remove_player(id).is_some()
    }

    /// Returns false when the player was already in the lobby
    pub fn join(&mut self, id: &str) -> Result<bool, JsValue> {
        self.lobby.join(id).map_err(to_js)
    }

    pub fn leave(&mut self, id: &str) -> bool {
        self.lobby.leave(id)
    }

    pub fn clear_lobby(&mut self) {
        self.lobby.clear();
    }

    pub fn get_member_count(&self) -> usize {
        self.lobby.member_count()
    }

    /// Get lobby members as JSON
    pub fn get_members(&self) -> String {
        to_json(&self.lobby.members()).unwrap_or_default()
    }

    /// Get every registered player as JSON
    pub fn get_players(&self) -> String {
        let mut players: Vec<&Player> = self.lobby.players().collect();
        players.sort_by(|a, b| a.id.cmp(&b.id));
        to_json(&players).unwrap_or_default()
    }

    pub fn get_player_count(&self) -> usize {
        self.lobby.player_count()
    }

    /// Lobby members grouped by primary role, as text
    pub fn get_player_list(&self) -> String {
        self.lobby.format_player_list()
    }

    /// Get a single player with rank labels as JSON
    pub fn get_player(&self, id: &str) -> Option<String> {
        self.lobby.player(id).map(|p| player_json(p).to_string())
    }

    pub fn get_queue_status(&self) -> String {
        to_json(&self.lobby.queue_status()).unwrap_or_default()
    }

    /// Balance up to `count` matches. `mode` restricts the map pool.
    pub fn balance(&mut self, count: usize, mode: Option<String>) -> Result<String, JsValue> {
        let mode = parse_mode(mode.as_deref()).map_err(to_js)?;
        let matches = self.lobby.balance_matches(count, mode).map_err(to_js)?;
        to_json(&matches).map_err(to_js)
    }

    /// Newest first
    pub fn get_recent_matches(&self, limit: usize) -> String {
        to_json(&self.lobby.recent_matches(limit)).unwrap_or_default()
    }

    pub fn get_match_summary(&self, match_id: &str) -> Option<String> {
        self.lobby
            .match_by_id(match_id)
            .map(|m| m.to_display_string())
    }

    /// Get default config as JSON
    pub fn get_default_config() -> String {
        to_json(&BalancerConfig::default()).unwrap_or_default()
    }

    /// Get map catalog as JSON
    pub fn get_maps() -> String {
        maps_json(&GameMap::ALL).to_string()
    }

    pub fn get_maps_by_mode(mode: &str) -> Result<String, JsValue> {
        let mode: GameMode = mode.parse().map_err(to_js)?;
        Ok(maps_json(&GameMap::by_mode(mode)).to_string())
    }

    /// Pick a map with the lobby generator, optionally within one mode
    pub fn get_random_map(&mut self, mode: Option<String>) -> Result<String, JsValue> {
        let mode = parse_mode(mode.as_deref()).map_err(to_js)?;
        Ok(map_json(self.lobby.random_map(mode)).to_string())
    }
}

fn parse_mode(mode: Option<&str>) -> Result<Option<GameMode>, LobbyError> {
    mode.map(str::parse::<GameMode>).transpose()
}

fn player_json(player: &Player) -> serde_json::Value {
    let ranks: serde_json::Map<String, serde_json::Value> = Role::ALL
        .iter()
        .map(|&role| {
            (
                role.name().to_string(),
                serde_json::Value::String(Rank::describe(player.rating(role))),
            )
        })
        .collect();
    serde_json::json!({
        "id": player.id,
        "name": player.name,
        "ratings": player.ratings(),
        "ranks": ranks,
        "primary_role": player.primary_role(),
        "games_played": player.games_played,
        "games_skipped": player.games_skipped,
        "priority": player.priority_score(),
    })
}

fn map_json(map: GameMap) -> serde_json::Value {
    serde_json::json!({
        "id": map,
        "name": map.display_name(),
        "mode": map.mode().display_name(),
    })
}

fn maps_json(maps: &[GameMap]) -> serde_json::Value {
    serde_json::Value::Array(maps.iter().map(|&map| map_json(map)).collect())
}

/// Balance a one-off pool without keeping any lobby state.
///
/// `pool_json` is an array of players; an empty `config_json` uses the defaults.
/// `mode` restricts the map pick.
pub fn balance_pool_json(
    pool_json: &str,
    config_json: &str,
    mode: Option<&str>,
    seed: u64,
) -> Result<String, LobbyError> {
    let balancer = Balancer::new(parse_config(config_json)?)?;
    let mode = parse_mode(mode)?;

    let pool: Vec<Player> = serde_json::from_str(pool_json)
        .map_err(|e| LobbyError::Parse(format!("players: {}", e)))?;

    let mut seen = HashSet::with_capacity(pool.len());
    for player in &pool {
        player.validate()?;
        if !seen.insert(player.id.as_str()) {
            return Err(LobbyError::DuplicatePlayer(player.id.clone()));
        }
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let result = balancer.balance(&pool, &mut rng)?;
    let map = match mode {
        Some(mode) => GameMap::random_by_mode(mode, &mut rng),
        None => GameMap::random(&mut rng),
    };
    let id = format!("{:08X}", rng.gen::<u32>());
    let record = Match::from_result(id, map, &result);

    let response = serde_json::json!({
        "match": record,
        "iterations": result.iterations,
        "summary": record.to_display_string(),
    });
    to_json(&response)
}

/// Balance a one-off pool of players given as JSON
#[wasm_bindgen]
pub fn balance_pool(
    pool_json: &str,
    config_json: &str,
    mode: Option<String>,
    seed: u64,
) -> Result<String, JsValue> {
    balance_pool_json(pool_json, config_json, mode.as_deref(), seed).map_err(to_js)
}
