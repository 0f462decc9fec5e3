//! 游戏规则是可替换的：状态机只在开局和收到 `DoAction` 时调用它们。
//! 规则在事件循环里同步执行，不能阻塞。

use card_lounge_core::{CardPile, DoActionRequest, GameStateInfo, NO_PLAYER, PlayerIndex};
use serde::Deserialize;

use crate::error::ActionError;

pub trait GameRules: Send {
    /// 所有玩家到齐、进入 `WaitingForAction` 时调用一次
    fn begin_round(&mut self, state: &mut GameStateInfo, now_ms: i64);

    /// 玩家当前可以执行的动作
    fn available_actions(&self, state: &GameStateInfo, player: PlayerIndex) -> Vec<String>;

    /// 校验并执行一个动作，成功时状态已被修改
    fn apply_action(
        &mut self,
        state: &mut GameStateInfo,
        player: PlayerIndex,
        action: &DoActionRequest,
        now_ms: i64,
    ) -> Result<(), ActionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GeneralAction {
    FollowBet,
    RaiseBet,
    Fold,
}

impl GeneralAction {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "FollowBet" => Some(GeneralAction::FollowBet),
            "RaiseBet" => Some(GeneralAction::RaiseBet),
            "Fold" => Some(GeneralAction::Fold),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            GeneralAction::FollowBet => "FollowBet",
            GeneralAction::RaiseBet => "RaiseBet",
            GeneralAction::Fold => "Fold",
        }
    }
}

#[derive(Debug, Deserialize)]
struct RaiseBetData {
    bet: i64,
}

/// 加注额必须是这个数的整数倍
const BET_UNIT: i64 = 5;

/// 默认规则：发牌、轮流跟注/加注/弃牌
#[derive(Debug, Clone)]
pub struct TableRules {
    pub hand_size: usize,
    pub turn_timer_ms: i64,
}

impl TableRules {
    pub fn new(hand_size: usize, turn_timer_ms: i64) -> Self {
        TableRules { hand_size, turn_timer_ms }
    }

    fn reset_timer(&self, state: &mut GameStateInfo, now_ms: i64) {
        state.timer_start_timestamp_ms = now_ms;
        state.timer_interval_ms = self.turn_timer_ms;
    }
}

impl GameRules for TableRules {
    fn begin_round(&mut self, state: &mut GameStateInfo, now_ms: i64) {
        let mut pile = CardPile::shuffled();
        for info in state.player_infos.iter_mut() {
            info.bet = 0;
            info.is_folded = false;
            info.main_hand = (0..self.hand_size).filter_map(|_| pile.draw()).collect();
        }

        let first = if state.player_infos.is_empty() { NO_PLAYER } else { 0 };
        state.dealer = first;
        state.active_player = first;
        state.aggressor = NO_PLAYER;
        self.reset_timer(state, now_ms);
    }

    fn available_actions(&self, state: &GameStateInfo, player: PlayerIndex) -> Vec<String> {
        let Some(info) = state.player(player) else {
            return Vec::new();
        };
        if player != state.active_player || info.is_folded {
            return Vec::new();
        }

        let highest_bet = state.highest_bet();
        let mut actions = Vec::new();
        if highest_bet <= info.net_worth {
            actions.push(GeneralAction::FollowBet);
        }
        if highest_bet < info.net_worth {
            actions.push(GeneralAction::RaiseBet);
        }
        actions.push(GeneralAction::Fold);
        actions.into_iter().map(|a| a.as_str().to_string()).collect()
    }

    fn apply_action(
        &mut self,
        state: &mut GameStateInfo,
        player: PlayerIndex,
        action: &DoActionRequest,
        now_ms: i64,
    ) -> Result<(), ActionError> {
        let general_action =
            GeneralAction::parse(&action.action).ok_or_else(|| ActionError::UnknownAction(action.action.clone()))?;
        if player != state.active_player {
            return Err(ActionError::NotYourTurn(player));
        }
        let highest_bet = state.highest_bet();
        let info = state.player_mut(player).ok_or(ActionError::NotSeated)?;
        if info.is_folded {
            return Err(ActionError::AlreadyFolded(player));
        }

        match general_action {
            GeneralAction::FollowBet => {
                info.bet = info.bet.max(highest_bet.min(info.net_worth));
            }
            GeneralAction::RaiseBet => {
                let data: RaiseBetData =
                    serde_json::from_str(&action.data).map_err(|e| ActionError::InvalidData(e.to_string()))?;
                if data.bet <= 0 || data.bet % BET_UNIT != 0 || data.bet > info.net_worth - info.bet {
                    return Err(ActionError::InvalidBet(data.bet));
                }
                info.bet += data.bet;
                state.aggressor = player;
            }
            GeneralAction::Fold => {
                info.is_folded = true;
            }
        }

        // 轮到下一位未弃牌的玩家
        let count = state.player_infos.len();
        let current = usize::try_from(player).unwrap_or(0);
        if let Some(next) = (1..=count)
            .map(|step| (current + step) % count)
            .find(|&i| !state.player_infos[i].is_folded)
        {
            state.active_player = next as PlayerIndex;
        }
        self.reset_timer(state, now_ms);
        Ok(())
    }
}
