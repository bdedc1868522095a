use crate::error::{ConfigError, LobbyError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lowest accepted skill rating; 0 means the role is not played
pub const MIN_SR: u32 = 0;
/// Highest accepted skill rating
pub const MAX_SR: u32 = 5000;

/// Players on one full team (1 tank + 2 damage + 2 support)
pub const TEAM_SIZE: usize = 5;
/// Players needed for one match
pub const PLAYERS_PER_MATCH: usize = TEAM_SIZE * 2;

/// Role-queue roles
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Tank,
    Damage,
    Support,
}

impl Role {
    /// All roles in assignment order
    pub const ALL: [Role; 3] = [Role::Tank, Role::Damage, Role::Support];

    pub fn slots_per_team(&self) -> usize {
        match self {
            Role::Tank => 1,
            Role::Damage => 2,
            Role::Support => 2,
        }
    }

    pub fn slots_per_match(&self) -> usize {
        self.slots_per_team() * 2
    }

    /// Relative weight of an imbalance in this role. Not used by the balance score,
    /// which applies fixed per-role constants.
    pub fn balance_weight(&self) -> f64 {
        match self {
            Role::Tank => 1.5,
            Role::Damage => 1.0,
            Role::Support => 1.2,
        }
    }

    /// Largest rating gap between teams still displayed as acceptable
    pub fn max_acceptable_diff(&self) -> u32 {
        match self {
            Role::Tank => 500,
            Role::Damage | Role::Support => 300,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Role::Tank => "tank",
            Role::Damage => "damage",
            Role::Support => "support",
        }
    }

    pub fn short_label(&self) -> &'static str {
        match self {
            Role::Tank => "T",
            Role::Damage => "D",
            Role::Support => "S",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Role::Tank => 0,
            Role::Damage => 1,
            Role::Support => 2,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Role {
    type Err = LobbyError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "tank" => Ok(Role::Tank),
            "dps" | "damage" => Ok(Role::Damage),
            "support" | "supp" => Ok(Role::Support),
            _ => Err(LobbyError::UnknownRole(input.to_string())),
        }
    }
}

/// Competitive rank tiers derived from SR
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Rank {
    Bronze,
    Silver,
    Gold,
    Platinum,
    Diamond,
    Master,
    Grandmaster,
    Champion,
}

impl Rank {
    pub const ALL: [Rank; 8] = [
        Rank::Bronze,
        Rank::Silver,
        Rank::Gold,
        Rank::Platinum,
        Rank::Diamond,
        Rank::Master,
        Rank::Grandmaster,
        Rank::Champion,
    ];

    pub fn min_sr(&self) -> u32 {
        match self {
            Rank::Bronze => 1000,
            Rank::Silver => 1500,
            Rank::Gold => 2000,
            Rank::Platinum => 2500,
            Rank::Diamond => 3000,
            Rank::Master => 3500,
            Rank::Grandmaster => 4000,
            Rank::Champion => 4500,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Rank::Bronze => "Bronze",
            Rank::Silver => "Silver",
            Rank::Gold => "Gold",
            Rank::Platinum => "Platinum",
            Rank::Diamond => "Diamond",
            Rank::Master => "Master",
            Rank::Grandmaster => "Grandmaster",
            Rank::Champion => "Champion",
        }
    }

    pub fn short_name(&self) -> &'static str {
        match self {
            Rank::Bronze => "B",
            Rank::Silver => "S",
            Rank::Gold => "G",
            Rank::Platinum => "P",
            Rank::Diamond => "D",
            Rank::Master => "M",
            Rank::Grandmaster => "GM",
            Rank::Champion => "C",
        }
    }

    /// Highest rank whose threshold the SR reaches (Bronze below 1000)
    pub fn from_sr(sr: u32) -> Rank {
        Rank::ALL
            .iter()
            .rev()
            .find(|rank| sr >= rank.min_sr())
            .copied()
            .unwrap_or(Rank::Bronze)
    }

    /// Division 5 (lowest) to 1 (highest) inside the rank, 0 for an inactive rating
    pub fn division(sr: u32) -> u32 {
        if sr == 0 {
            return 0;
        }
        let above_floor = sr.saturating_sub(Rank::from_sr(sr).min_sr());
        5u32.saturating_sub(above_floor / 100).clamp(1, 5)
    }

    /// "Gold 3 (2250)", or "Not playing" for 0
    pub fn describe(sr: u32) -> String {
        if sr == 0 {
            return "Not playing".to_string();
        }
        format!(
            "{} {} ({})",
            Rank::from_sr(sr).display_name(),
            Rank::division(sr),
            sr
        )
    }

    /// "G3", or "-" for 0
    pub fn short(sr: u32) -> String {
        if sr == 0 {
            return "-".to_string();
        }
        format!("{}{}", Rank::from_sr(sr).short_name(), Rank::division(sr))
    }
}

/// SR per role
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRatings {
    #[serde(default)]
    pub tank: u32,
    #[serde(default)]
    pub damage: u32,
    #[serde(default)]
    pub support: u32,
}

impl RoleRatings {
    pub fn new(tank: u32, damage: u32, support: u32) -> Self {
        Self {
            tank,
            damage,
            support,
        }
    }

    pub fn get(&self, role: Role) -> u32 {
        match role {
            Role::Tank => self.tank,
            Role::Damage => self.damage,
            Role::Support => self.support,
        }
    }

    fn get_mut(&mut self, role: Role) -> &mut u32 {
        match role {
            Role::Tank => &mut self.tank,
            Role::Damage => &mut self.damage,
            Role::Support => &mut self.support,
        }
    }

    /// Check every rating lies in [MIN_SR, MAX_SR]
    pub fn validate(&self) -> Result<(), LobbyError> {
        for role in Role::ALL {
            let value = self.get(role);
            if !(MIN_SR..=MAX_SR).contains(&value) {
                return Err(LobbyError::RatingOutOfRange { role, value });
            }
        }
        Ok(())
    }
}

/// A ranked participant
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub id: String,
    pub name: String,
    #[serde(default)]
    ratings: RoleRatings,
    #[serde(default)]
    pub games_played: u32,
    /// Consecutive matches sat out; reset when placed on a team
    #[serde(default)]
    pub games_skipped: u32,
}

impl Player {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ratings: RoleRatings::default(),
            games_played: 0,
            games_skipped: 0,
        }
    }

    pub fn with_ratings(
        id: impl Into<String>,
        name: impl Into<String>,
        ratings: RoleRatings,
    ) -> Result<Self, LobbyError> {
        ratings.validate()?;
        let mut player = Self::new(id, name);
        player.ratings = ratings;
        Ok(player)
    }

    pub fn ratings(&self) -> RoleRatings {
        self.ratings
    }

    pub fn rating(&self, role: Role) -> u32 {
        self.ratings.get(role)
    }

    pub fn set_rating(&mut self, role: Role, sr: u32) -> Result<(), LobbyError> {
        if sr > MAX_SR {
            return Err(LobbyError::RatingOutOfRange { role, value: sr });
        }
        *self.ratings.get_mut(role) = sr;
        Ok(())
    }

    pub fn set_ratings(&mut self, ratings: RoleRatings) -> Result<(), LobbyError> {
        ratings.validate()?;
        self.ratings = ratings;
        Ok(())
    }

    /// Bounds check for records that bypassed `set_rating`, e.g. deserialized ones
    pub fn validate(&self) -> Result<(), LobbyError> {
        self.ratings.validate()
    }

    pub fn can_play(&self, role: Role) -> bool {
        self.rating(role) > 0
    }

    pub fn has_active_role(&self) -> bool {
        Role::ALL.iter().any(|&role| self.can_play(role))
    }

    /// Role with the highest rating; the earlier role wins a tie. None if nothing is rated.
    pub fn primary_role(&self) -> Option<Role> {
        let mut primary = None;
        let mut best = 0;
        for role in Role::ALL {
            let sr = self.rating(role);
            if sr > best {
                best = sr;
                primary = Some(role);
            }
        }
        primary
    }

    pub fn highest_sr(&self) -> u32 {
        Role::ALL.iter().map(|&role| self.rating(role)).max().unwrap_or(0)
    }

    /// Mean over the roles actually played
    pub fn average_sr(&self) -> f64 {
        let active: Vec<u32> = Role::ALL
            .iter()
            .map(|&role| self.rating(role))
            .filter(|&sr| sr > 0)
            .collect();
        if active.is_empty() {
            0.0
        } else {
            active.iter().sum::<u32>() as f64 / active.len() as f64
        }
    }

    /// Skipped games dominate; highest SR breaks ties
    pub fn priority_score(&self) -> u64 {
        self.games_skipped as u64 * 10_000 + self.highest_sr() as u64
    }

    pub fn record_game_played(&mut self) {
        self.games_played += 1;
        self.games_skipped = 0;
    }

    pub fn record_game_skipped(&mut self) {
        self.games_skipped += 1;
    }
}

impl fmt::Display for Player {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.primary_role() {
            Some(role) => write!(f, "[{}] {} ({})", role.short_label(), self.name, self.rating(role)),
            None => write!(f, "{} (no roles)", self.name),
        }
    }
}

/// One occupied slot: who plays, in which role, at what SR
#[derive(Clone, Copy, Debug, Serialize)]
pub struct TeamSlot<'a> {
    pub player: &'a Player,
    pub role: Role,
    pub sr: u32,
}

/// A team under construction or fully built, borrowing its players from the pool
#[derive(Clone, Debug, Serialize)]
pub struct Team<'a> {
    pub name: &'static str,
    pub label: &'static str,
    tank: Vec<TeamSlot<'a>>,
    damage: Vec<TeamSlot<'a>>,
    support: Vec<TeamSlot<'a>>,
}

impl<'a> Team<'a> {
    pub fn new(name: &'static str, label: &'static str) -> Self {
        Self {
            name,
            label,
            tank: Vec::with_capacity(Role::Tank.slots_per_team()),
            damage: Vec::with_capacity(Role::Damage.slots_per_team()),
            support: Vec::with_capacity(Role::Support.slots_per_team()),
        }
    }

    pub fn red() -> Self {
        Self::new("Red Team", "red")
    }

    pub fn blue() -> Self {
        Self::new("Blue Team", "blue")
    }

    fn roster(&self, role: Role) -> &Vec<TeamSlot<'a>> {
        match role {
            Role::Tank => &self.tank,
            Role::Damage => &self.damage,
            Role::Support => &self.support,
        }
    }

    fn roster_mut(&mut self, role: Role) -> &mut Vec<TeamSlot<'a>> {
        match role {
            Role::Tank => &mut self.tank,
            Role::Damage => &mut self.damage,
            Role::Support => &mut self.support,
        }
    }

    /// Place a player in a role. Refused when the role is full, the player cannot
    /// play it, or the player already holds a slot.
    pub fn add(&mut self, player: &'a Player, role: Role) -> bool {
        if self.free_slots(role) == 0 || !player.can_play(role) || self.contains(player) {
            return false;
        }
        let sr = player.rating(role);
        self.roster_mut(role).push(TeamSlot { player, role, sr });
        true
    }

    pub fn contains(&self, player: &Player) -> bool {
        self.slots().any(|slot| slot.player.id == player.id)
    }

    pub fn slots_for(&self, role: Role) -> &[TeamSlot<'a>] {
        self.roster(role)
    }

    pub fn slots(&self) -> impl Iterator<Item = &TeamSlot<'a>> {
        self.tank.iter().chain(&self.damage).chain(&self.support)
    }

    pub fn free_slots(&self, role: Role) -> usize {
        role.slots_per_team() - self.roster(role).len()
    }

    pub fn is_full(&self) -> bool {
        self.player_count() == TEAM_SIZE
    }

    pub fn player_count(&self) -> usize {
        self.tank.len() + self.damage.len() + self.support.len()
    }

    pub fn players(&self) -> impl Iterator<Item = &'a Player> + '_ {
        self.slots().map(|slot| slot.player)
    }

    pub fn player_ids(&self) -> Vec<String> {
        self.players().map(|p| p.id.clone()).collect()
    }

    pub fn total_sr(&self) -> u32 {
        self.slots().map(|slot| slot.sr).sum()
    }

    pub fn average_sr(&self) -> f64 {
        match self.player_count() {
            0 => 0.0,
            count => self.total_sr() as f64 / count as f64,
        }
    }

    pub fn role_total_sr(&self, role: Role) -> u32 {
        self.roster(role).iter().map(|slot| slot.sr).sum()
    }

    /// 0 when nobody fills the role yet
    pub fn role_average_sr(&self, role: Role) -> f64 {
        let slots = self.roster(role);
        if slots.is_empty() {
            0.0
        } else {
            self.role_total_sr(role) as f64 / slots.len() as f64
        }
    }

    pub fn tank(&self) -> Option<&'a Player> {
        self.tank.first().map(|slot| slot.player)
    }

    pub fn tank_sr(&self) -> u32 {
        self.tank.first().map(|slot| slot.sr).unwrap_or(0)
    }
}

/// Display label for a balance score. Lower scores are better.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BalanceQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl BalanceQuality {
    pub fn from_score(score: f64) -> Self {
        if score < 200.0 {
            BalanceQuality::Excellent
        } else if score < 400.0 {
            BalanceQuality::Good
        } else if score < 700.0 {
            BalanceQuality::Fair
        } else {
            BalanceQuality::Poor
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            BalanceQuality::Excellent => "Excellent",
            BalanceQuality::Good => "Good",
            BalanceQuality::Fair => "Fair",
            BalanceQuality::Poor => "Poor",
        }
    }
}

impl fmt::Display for BalanceQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Balancer configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    /// Upper bound on search iterations per balancing call
    pub max_iterations: usize,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3000,
        }
    }
}

impl BalancerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(ConfigError::ZeroIterations);
        }
        Ok(())
    }
}

/// Objective types of the map pool
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GameMode {
    Control,
    Escort,
    Flashpoint,
    Hybrid,
    Push,
}

impl GameMode {
    pub fn display_name(&self) -> &'static str {
        match self {
            GameMode::Control => "Control",
            GameMode::Escort => "Escort",
            GameMode::Flashpoint => "Flashpoint",
            GameMode::Hybrid => "Hybrid",
            GameMode::Push => "Push",
        }
    }
}

impl FromStr for GameMode {
    type Err = LobbyError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "control" => Ok(GameMode::Control),
            "escort" => Ok(GameMode::Escort),
            "flashpoint" => Ok(GameMode::Flashpoint),
            "hybrid" => Ok(GameMode::Hybrid),
            "push" => Ok(GameMode::Push),
            _ => Err(LobbyError::UnknownMode(input.to_string())),
        }
    }
}

/// Map catalog
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GameMap {
    AntarcticPeninsula,
    Busan,
    Ilios,
    LijiangTower,
    Nepal,
    Oasis,
    Samoa,
    CircuitRoyal,
    Dorado,
    Havana,
    Junkertown,
    Rialto,
    Route66,
    ShambaliMonastery,
    WatchpointGibraltar,
    NewJunkCity,
    Suravasa,
    BlizzardWorld,
    Eichenwalde,
    Hollywood,
    KingsRow,
    Midtown,
    Numbani,
    Paraiso,
    Colosseo,
    Esperanca,
    NewQueenStreet,
    Runasapi,
}

impl GameMap {
    pub const ALL: [GameMap; 28] = [
        GameMap::AntarcticPeninsula,
        GameMap::Busan,
        GameMap::Ilios,
        GameMap::LijiangTower,
        GameMap::Nepal,
        GameMap::Oasis,
        GameMap::Samoa,
        GameMap::CircuitRoyal,
        GameMap::Dorado,
        GameMap::Havana,
        GameMap::Junkertown,
        GameMap::Rialto,
        GameMap::Route66,
        GameMap::ShambaliMonastery,
        GameMap::WatchpointGibraltar,
        GameMap::NewJunkCity,
        GameMap::Suravasa,
        GameMap::BlizzardWorld,
        GameMap::Eichenwalde,
        GameMap::Hollywood,
        GameMap::KingsRow,
        GameMap::Midtown,
        GameMap::Numbani,
        GameMap::Paraiso,
        GameMap::Colosseo,
        GameMap::Esperanca,
        GameMap::NewQueenStreet,
        GameMap::Runasapi,
    ];

    pub fn display_name(&self) -> &'static str {
        match self {
            GameMap::AntarcticPeninsula => "Antarctic Peninsula",
            GameMap::Busan => "Busan",
            GameMap::Ilios => "Ilios",
            GameMap::LijiangTower => "Lijiang Tower",
            GameMap::Nepal => "Nepal",
            GameMap::Oasis => "Oasis",
            GameMap::Samoa => "Samoa",
            GameMap::CircuitRoyal => "Circuit Royal",
            GameMap::Dorado => "Dorado",
            GameMap::Havana => "Havana",
            GameMap::Junkertown => "Junkertown",
            GameMap::Rialto => "Rialto",
            GameMap::Route66 => "Route 66",
            GameMap::ShambaliMonastery => "Shambali Monastery",
            GameMap::WatchpointGibraltar => "Watchpoint: Gibraltar",
            GameMap::NewJunkCity => "New Junk City",
            GameMap::Suravasa => "Suravasa",
            GameMap::BlizzardWorld => "Blizzard World",
            GameMap::Eichenwalde => "Eichenwalde",
            GameMap::Hollywood => "Hollywood",
            GameMap::KingsRow => "King's Row",
            GameMap::Midtown => "Midtown",
            GameMap::Numbani => "Numbani",
            GameMap::Paraiso => "Paraíso",
            GameMap::Colosseo => "Colosseo",
            GameMap::Esperanca => "Esperança",
            GameMap::NewQueenStreet => "New Queen Street",
            GameMap::Runasapi => "Runasapi",
        }
    }

    pub fn mode(&self) -> GameMode {
        match self {
            GameMap::AntarcticPeninsula
            | GameMap::Busan
            | GameMap::Ilios
            | GameMap::LijiangTower
            | GameMap::Nepal
            | GameMap::Oasis
            | GameMap::Samoa => GameMode::Control,
            GameMap::CircuitRoyal
            | GameMap::Dorado
            | GameMap::Havana
            | GameMap::Junkertown
            | GameMap::Rialto
            | GameMap::Route66
            | GameMap::ShambaliMonastery
            | GameMap::WatchpointGibraltar => GameMode::Escort,
            GameMap::NewJunkCity | GameMap::Suravasa => GameMode::Flashpoint,
            GameMap::BlizzardWorld
            | GameMap::Eichenwalde
            | GameMap::Hollywood
            | GameMap::KingsRow
            | GameMap::Midtown
            | GameMap::Numbani
            | GameMap::Paraiso => GameMode::Hybrid,
            GameMap::Colosseo
            | GameMap::Esperanca
            | GameMap::NewQueenStreet
            | GameMap::Runasapi => GameMode::Push,
        }
    }

    pub fn by_mode(mode: GameMode) -> Vec<GameMap> {
        GameMap::ALL.iter().copied().filter(|map| map.mode() == mode).collect()
    }

    /// Everything except Flashpoint
    pub fn competitive() -> Vec<GameMap> {
        GameMap::ALL
            .iter()
            .copied()
            .filter(|map| map.mode() != GameMode::Flashpoint)
            .collect()
    }

    pub fn random(rng: &mut impl Rng) -> GameMap {
        GameMap::ALL[rng.gen_range(0..GameMap::ALL.len())]
    }

    /// Falls back to the whole catalog when the mode has no maps
    pub fn random_by_mode(mode: GameMode, rng: &mut impl Rng) -> GameMap {
        let maps = GameMap::by_mode(mode);
        if maps.is_empty() {
            return GameMap::random(rng);
        }
        maps[rng.gen_range(0..maps.len())]
    }
}

impl fmt::Display for GameMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name(), self.mode().display_name())
    }
}
