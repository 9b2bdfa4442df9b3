use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// The three entity kinds tracked in dimension tables and full snapshots.
///
/// The server status document is scraped too but has its own typed row and
/// no dimension table, so it is not a variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Player,
    Town,
    Nation,
}

impl EntityKind {
    /// Upstream path segment for both the id list (GET) and detail lookup (POST).
    pub fn path(self) -> &'static str {
        match self {
            EntityKind::Player => "players",
            EntityKind::Town => "towns",
            EntityKind::Nation => "nations",
        }
    }

    pub fn dimension_table(self) -> &'static str {
        match self {
            EntityKind::Player => "players",
            EntityKind::Town => "towns",
            EntityKind::Nation => "nations",
        }
    }

    pub fn snapshot_table(self) -> &'static str {
        match self {
            EntityKind::Player => "player_snapshots",
            EntityKind::Town => "town_snapshots",
            EntityKind::Nation => "nation_snapshots",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            EntityKind::Player => "player",
            EntityKind::Town => "town",
            EntityKind::Nation => "nation",
        }
    }
}

/// Minimal name + uuid entry shared by list endpoints.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListEntry {
    pub name: String,
    pub uuid: String,
}

/// Currently online players.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OnlineResponse {
    pub count: u32,
    pub players: Vec<ListEntry>,
}

/// Live-map players.json feed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MapPlayersResponse {
    #[serde(default)]
    pub max: u32,
    pub players: Vec<MapPlayer>,
}

/// One visible player on the live map. The map feed formats uuids without
/// dashes, unlike the main API.
#[derive(Debug, Clone, Deserialize)]
pub struct MapPlayer {
    pub world: String,
    pub name: String,
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub uuid: String,
    pub yaw: i32,
}

/// Server status document, decoded in full because the server snapshot row
/// is typed rather than opaque.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerResponse {
    pub version: String,
    pub moon_phase: String,
    pub status: ServerStatus,
    pub stats: ServerStats,
    pub vote_party: ServerVoteParty,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub has_storm: bool,
    pub is_thundering: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    pub time: i64,
    pub full_time: i64,
    pub max_players: i32,
    pub num_online_players: i32,
    pub num_online_nomads: i32,
    pub num_residents: i32,
    pub num_nomads: i32,
    pub num_towns: i32,
    pub num_town_blocks: i32,
    pub num_nations: i32,
    pub num_quarters: i32,
    pub num_cuboids: i32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerVoteParty {
    pub target: i32,
    pub num_remaining: i32,
}

/// Body for the batched detail lookup.
#[derive(Debug, Serialize)]
pub struct PostQuery<'a> {
    pub query: &'a [String],
}

/// Identity fields parsed out of an otherwise opaque detail record.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub uuid: String,
}

/// Parse only the identity fields of a full detail record; the rest of the
/// payload is stored verbatim so upstream schema changes never break
/// ingestion.
pub fn extract_identity(raw: &RawValue) -> Result<Identity, serde_json::Error> {
    serde_json::from_str(raw.get())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_identity_ignores_extra_fields() {
        let raw: Box<RawValue> = serde_json::from_str(
            r#"{"name":"Londinium","uuid":"abc-123","stats":{"balance":42.0},"residents":[]}"#,
        )
        .unwrap();
        let id = extract_identity(&raw).unwrap();
        assert_eq!(id.name, "Londinium");
        assert_eq!(id.uuid, "abc-123");
    }

    #[test]
    fn test_extract_identity_missing_uuid_fails() {
        let raw: Box<RawValue> = serde_json::from_str(r#"{"name":"Londinium"}"#).unwrap();
        assert!(extract_identity(&raw).is_err());
    }

    #[test]
    fn test_server_response_decodes() {
        let body = r#"{
            "version": "1.20.4",
            "moonPhase": "WAXING_CRESCENT",
            "timestamps": {"newDayTime": 1, "serverTimeOfDay": 2},
            "status": {"hasStorm": false, "isThundering": false},
            "stats": {
                "time": 1, "fullTime": 2, "maxPlayers": 250,
                "numOnlinePlayers": 100, "numOnlineNomads": 10,
                "numResidents": 5000, "numNomads": 200, "numTowns": 800,
                "numTownBlocks": 40000, "numNations": 120,
                "numQuarters": 300, "numCuboids": 50
            },
            "voteParty": {"target": 100, "numRemaining": 37}
        }"#;
        let resp: ServerResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.version, "1.20.4");
        assert_eq!(resp.stats.num_online_players, 100);
        assert_eq!(resp.vote_party.num_remaining, 37);
    }
}
