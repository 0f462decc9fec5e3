use crate::card::Card;
use serde::{Deserialize, Serialize};

/// 玩家编号：玩家在配置名单中的下标。`-1` 表示未设置。
pub type PlayerIndex = i32;

pub const NO_PLAYER: PlayerIndex = -1;

/// 整局游戏的公共状态。服务器持有唯一的权威副本，
/// 发给每个客户端的都是经过 `for_player` 过滤的拷贝。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GameStateInfo {
    /// 接收者自己的编号，只在发出的拷贝里有意义
    pub player_id: PlayerIndex,
    // 下标与配置的玩家名单一一对应
    pub player_infos: Vec<PlayerInfo>,
    pub dealer: PlayerIndex,
    pub aggressor: PlayerIndex,
    pub active_player: PlayerIndex,
    pub timer_start_timestamp_ms: i64,
    pub timer_interval_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlayerInfo {
    pub name: String,
    pub net_worth: i64,
    pub bet: i64,
    pub is_folded: bool,
    pub main_hand: Vec<Card>,
}

impl Default for GameStateInfo {
    fn default() -> Self {
        GameStateInfo {
            player_id: NO_PLAYER,
            player_infos: Vec::new(),
            dealer: NO_PLAYER,
            aggressor: NO_PLAYER,
            active_player: NO_PLAYER,
            timer_start_timestamp_ms: -1,
            timer_interval_ms: -1,
        }
    }
}

impl GameStateInfo {
    /// 为 `player_count` 个玩家创建初始状态，每人的初始资产为 `init_net_worth`
    pub fn new(player_count: usize, init_net_worth: i64) -> Self {
        let player_infos = (0..player_count)
            .map(|_| PlayerInfo { net_worth: init_net_worth, ..PlayerInfo::default() })
            .collect();
        GameStateInfo { player_infos, ..GameStateInfo::default() }
    }

    pub fn player(&self, index: PlayerIndex) -> Option<&PlayerInfo> {
        usize::try_from(index).ok().and_then(|i| self.player_infos.get(i))
    }

    pub fn player_mut(&mut self, index: PlayerIndex) -> Option<&mut PlayerInfo> {
        usize::try_from(index).ok().and_then(|i| self.player_infos.get_mut(i))
    }

    /// 当前轮的最高下注额
    pub fn highest_bet(&self) -> i64 {
        self.player_infos.iter().map(|p| p.bet).max().unwrap_or(0)
    }

    /// 生成发给 `recipient` 的拷贝：`player_id` 换成接收者，
    /// 除接收者自己以外所有人的手牌都被清空。
    pub fn for_player(&self, recipient: PlayerIndex) -> Self {
        let mut client_state = self.clone();
        client_state.player_id = recipient;
        for (i, info) in client_state.player_infos.iter_mut().enumerate() {
            if usize::try_from(recipient).ok() != Some(i) {
                info.main_hand.clear();
            }
        }
        client_state
    }
}
