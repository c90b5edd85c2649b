use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Last known load snapshot of a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    pub players: u32,
    pub playing_players: u32,
    /// Milliseconds
    pub uptime: u64,
    pub memory: MemoryStats,
    pub cpu: CpuStats,
    pub frame_stats: FrameStats,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub free: u64,
    pub used: u64,
    pub allocated: u64,
    pub reservable: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    pub cores: u32,
    pub system_load: f64,
    pub lavalink_load: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameStats {
    pub sent: i64,
    pub nulled: i64,
    pub deficit: i64,
}

/// `op: "stats"` payload. Every field is optional so a partial frame
/// only touches what it carries.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatsFrame {
    pub players: Option<u32>,
    pub playing_players: Option<u32>,
    pub uptime: Option<u64>,
    pub memory: Option<MemoryFrame>,
    pub cpu: Option<CpuFrame>,
    pub frame_stats: Option<FrameStatsFrame>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MemoryFrame {
    pub free: Option<u64>,
    pub used: Option<u64>,
    pub allocated: Option<u64>,
    pub reservable: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CpuFrame {
    pub cores: Option<u32>,
    pub system_load: Option<f64>,
    pub lavalink_load: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FrameStatsFrame {
    pub sent: Option<i64>,
    pub nulled: Option<i64>,
    pub deficit: Option<i64>,
}

fn merge<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

impl NodeStats {
    pub fn merge(&mut self, frame: StatsFrame) {
        merge(&mut self.players, frame.players);
        merge(&mut self.playing_players, frame.playing_players);
        merge(&mut self.uptime, frame.uptime);

        if let Some(memory) = frame.memory {
            merge(&mut self.memory.free, memory.free);
            merge(&mut self.memory.used, memory.used);
            merge(&mut self.memory.allocated, memory.allocated);
            merge(&mut self.memory.reservable, memory.reservable);
        }

        if let Some(cpu) = frame.cpu {
            merge(&mut self.cpu.cores, cpu.cores);
            merge(&mut self.cpu.system_load, cpu.system_load);
            merge(&mut self.cpu.lavalink_load, cpu.lavalink_load);
        }

        if let Some(frames) = frame.frame_stats {
            merge(&mut self.frame_stats.sent, frames.sent);
            merge(&mut self.frame_stats.nulled, frames.nulled);
            merge(&mut self.frame_stats.deficit, frames.deficit);
        }

        self.updated_at = Some(Utc::now());
    }

    /// Load score used to rank nodes, lower is better.
    ///
    /// Playing players count once each, CPU load grows exponentially and
    /// frame deficits (stutter) weigh in once the node reports them.
    pub fn penalty(&self) -> u64 {
        let cpu = (1.05f64.powf(100.0 * self.cpu.system_load) * 10.0 - 10.0).round();

        let (deficit, nulled) = if self.frame_stats.sent > 0 || self.frame_stats.deficit > 0 {
            let deficit = 1.03f64.powf(500.0 * (self.frame_stats.deficit.max(0) as f64 / 3000.0)) * 600.0 - 600.0;
            let nulled =
                (1.03f64.powf(500.0 * (self.frame_stats.nulled.max(0) as f64 / 3000.0)) * 300.0 - 300.0) * 2.0;
            (deficit, nulled)
        } else {
            (0.0, 0.0)
        };

        u64::from(self.playing_players) + (cpu + deficit + nulled).max(0.0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn frame(value: serde_json::Value) -> StatsFrame {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn partial_frame_keeps_known_values() {
        let mut stats = NodeStats::default();
        stats.merge(frame(json!({
            "players": 4,
            "playingPlayers": 2,
            "uptime": 1000,
            "memory": { "free": 10, "used": 20, "allocated": 30, "reservable": 40 },
            "cpu": { "cores": 8, "systemLoad": 0.5, "lavalinkLoad": 0.1 }
        })));

        stats.merge(frame(json!({ "players": 5, "memory": { "used": 25 } })));

        assert_eq!(stats.players, 5);
        assert_eq!(stats.playing_players, 2);
        assert_eq!(stats.uptime, 1000);
        assert_eq!(
            stats.memory,
            MemoryStats { free: 10, used: 25, allocated: 30, reservable: 40 }
        );
        assert_eq!(stats.cpu.cores, 8);
        assert!(stats.updated_at.is_some());
    }

    #[test]
    fn idle_node_has_no_penalty() {
        assert_eq!(NodeStats::default().penalty(), 0);
    }

    #[test]
    fn busier_node_ranks_worse() {
        let mut idle = NodeStats::default();
        idle.merge(frame(json!({ "playingPlayers": 1, "cpu": { "systemLoad": 0.05 } })));

        let mut busy = NodeStats::default();
        busy.merge(frame(json!({ "playingPlayers": 10, "cpu": { "systemLoad": 0.6 } })));

        assert!(idle.penalty() < busy.penalty());
    }
}
